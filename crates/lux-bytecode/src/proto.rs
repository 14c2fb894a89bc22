//! Function prototypes for the Lux VM
//!
//! A `Proto` is a compiled function template: instruction stream, constant
//! pool, child prototypes, upvalue and local descriptors, and line tables.
//! It is produced by the code generator and treated as immutable by the
//! interpreter; the only sanctioned mutation paths are the bytecode
//! manipulation API and the obfuscation pipeline, both of which respect the
//! `locked` flag.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::instr::Instruction;

/// A constant-pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Constant {
    /// Type tag byte used by the bytecode image format
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Nil => 0,
            Constant::Bool(false) => 1,
            Constant::Bool(true) => 2,
            Constant::Int(_) => 3,
            Constant::Float(_) => 4,
            Constant::Str(_) => 5,
        }
    }
}

/// Upvalue descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalDesc {
    /// Name for debug info (empty when stripped)
    pub name: String,
    /// Whether the upvalue lives in the enclosing function's stack
    pub in_stack: bool,
    /// Register or upvalue index in the enclosing function
    pub index: u8,
    /// Kind of variable (regular, const, to-be-closed)
    pub kind: u8,
}

/// Local-variable descriptor (debug info)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVar {
    /// Variable name
    pub name: String,
    /// First pc where the variable is live
    pub start_pc: u32,
    /// First pc where the variable is dead
    pub end_pc: u32,
}

/// Absolute line-info record, one per run of relative deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsLine {
    /// Instruction the anchor applies from
    pub pc: u32,
    /// Absolute source line at that instruction
    pub line: u32,
}

/// Obfuscation-mode bits recorded on a transformed `Proto`.
///
/// Mirrors the flag set accepted by the obfuscation pipeline; a reader uses
/// these to decide whether a VM-protect block follows in the image.
pub mod obf_mode {
    /// No obfuscation
    pub const NONE: u32 = 0;
    /// Control-flow flattening
    pub const CFF: u32 = 1 << 0;
    /// Randomised state-id assignment
    pub const BLOCK_SHUFFLE: u32 = 1 << 1;
    /// Bogus basic blocks wired into the dispatcher
    pub const BOGUS_BLOCKS: u32 = 1 << 2;
    /// State values passed through a linear bijection
    pub const STATE_ENCODE: u32 = 1 << 3;
    /// Encrypted string constants in the image
    pub const STR_ENCRYPT: u32 = 1 << 5;
    /// Re-encoded for the secondary VM
    pub const VM_PROTECT: u32 = 1 << 7;
}

/// A compiled function template
#[derive(Debug, Clone, Default)]
pub struct Proto {
    /// Source chunk name (empty when stripped or same as parent)
    pub source: String,
    /// Line where the function definition starts
    pub line_defined: u32,
    /// Line where the function definition ends
    pub last_line_defined: u32,
    /// Number of fixed parameters
    pub num_params: u8,
    /// Whether the function accepts varargs
    pub is_vararg: bool,
    /// Number of registers the function needs
    pub max_stack_size: u8,

    /// Instruction stream
    pub code: Vec<Instruction>,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Nested prototypes
    pub protos: Vec<Proto>,
    /// Upvalue descriptors
    pub upvalues: Vec<UpvalDesc>,

    /// Relative line deltas, one byte per instruction
    pub line_info: Vec<i8>,
    /// Absolute line anchors
    pub abs_lines: Vec<AbsLine>,
    /// Local-variable debug records
    pub locals: Vec<LocalVar>,

    /// Obfuscation mode bits (`obf_mode::*`)
    pub obf_mode: u32,
    /// Magic number written by the flattener
    pub obf_magic: u32,
    /// Packed flattener payload: block count in the high word, seed low
    pub obf_data: u64,

    /// Frozen against all modification
    locked: bool,
    /// Pinned so the collector never reclaims it
    gc_fixed: bool,
    /// Baseline SHA-256 over the instruction stream, set by `mark_original`
    baseline: Option<[u8; 32]>,
}

impl Proto {
    /// Create an empty prototype with the given register budget
    pub fn new(num_params: u8, max_stack_size: u8) -> Self {
        Proto {
            num_params,
            max_stack_size,
            ..Proto::default()
        }
    }

    /// Number of instructions
    #[inline]
    pub fn size_code(&self) -> usize {
        self.code.len()
    }

    /// Whether the prototype is frozen against modification
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freeze the prototype. There is deliberately no unlock.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Whether the prototype is pinned against collection
    #[inline]
    pub fn is_gc_fixed(&self) -> bool {
        self.gc_fixed
    }

    /// Pin the prototype so the collector treats it as a permanent root
    pub fn mark_gc_fixed(&mut self) {
        self.gc_fixed = true;
    }

    /// SHA-256 over the little-endian instruction stream
    pub fn code_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for &inst in &self.code {
            hasher.update(inst.to_le_bytes());
        }
        hasher.finalize().into()
    }

    /// Record the current instruction stream as the tamper baseline
    pub fn mark_original(&mut self) {
        self.baseline = Some(self.code_hash());
    }

    /// Whether the instruction stream has drifted from the recorded
    /// baseline. `false` when no baseline was ever recorded.
    pub fn is_tampered(&self) -> bool {
        match self.baseline {
            Some(baseline) => baseline != self.code_hash(),
            None => false,
        }
    }

    /// Source line of the instruction at `pc`, resolved from the anchor
    /// table plus relative deltas
    pub fn line_of(&self, pc: usize) -> u32 {
        if self.line_info.is_empty() {
            return 0;
        }
        let mut anchor = AbsLine {
            pc: 0,
            line: self.line_defined,
        };
        for abs in &self.abs_lines {
            if abs.pc as usize > pc {
                break;
            }
            anchor = *abs;
        }
        let mut line = anchor.line as i64;
        for delta in &self.line_info[anchor.pc as usize..=pc.min(self.line_info.len() - 1)] {
            line += *delta as i64;
        }
        line.max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{abc, Opcode};

    fn sample_proto() -> Proto {
        let mut p = Proto::new(1, 4);
        p.code = vec![
            abc(Opcode::Move, 1, 0, 0),
            abc(Opcode::Return1, 1, 0, 0),
        ];
        p
    }

    #[test]
    fn test_lock_is_permanent() {
        let mut p = sample_proto();
        assert!(!p.is_locked());
        p.lock();
        assert!(p.is_locked());
    }

    #[test]
    fn test_tamper_detection() {
        let mut p = sample_proto();
        assert!(!p.is_tampered()); // no baseline yet

        p.mark_original();
        assert!(!p.is_tampered());

        p.code[0] = abc(Opcode::Move, 2, 0, 0);
        assert!(p.is_tampered());
    }

    #[test]
    fn test_code_hash_changes_with_code() {
        let mut p = sample_proto();
        let h1 = p.code_hash();
        p.code.push(abc(Opcode::Nop, 0, 0, 0));
        assert_ne!(h1, p.code_hash());
    }
}
