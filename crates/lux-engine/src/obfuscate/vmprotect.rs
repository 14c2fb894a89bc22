//! VM protection: re-encoding onto an encrypted secondary VM
//!
//! A protected prototype's bytecode is translated into a custom 64-bit
//! instruction word, the secondary opcode space is renumbered by a random
//! permutation, and the stream is XOR-encrypted with a per-function
//! 64-bit key. The resulting table is registered in a process-wide list
//! keyed by the prototype's identity; execution enters a trampoline that
//! decrypts one instruction at a time inside the secondary dispatch loop.
//!
//! Secondary word layout:
//!
//! ```text
//! op:8 | A:16 | B:16 | C:16 | flags:8      Bx = bits 24..64 (40 bits)
//! ```

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use lux_bytecode::instr::{self, Opcode};
use lux_bytecode::proto::obf_mode;
use lux_bytecode::Proto;

use crate::error::{LuxError, ObfuscateError};
use crate::value::Value;

/// Size of the secondary opcode permutation
pub const VM_MAP_SIZE: usize = 256;

/// A secondary VM instruction word
pub type VmInstruction = u64;

/// Excess offset for the signed 40-bit Bx operand
const VM_OFFSET_BX: i64 = 1 << 39;

/// Secondary VM opcodes. The numbering here is the canonical one; the
/// stream stores each opcode renumbered through a per-function
/// permutation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOp {
    Nop = 0,
    Move,
    LoadI,
    LoadF,
    LoadK,
    LoadTrue,
    LoadFalse,
    LoadNil,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    AddI,
    Band,
    Bor,
    Bxor,
    Bnot,
    Shl,
    Shr,
    Jmp,
    Eq,
    Lt,
    Le,
    EqK,
    EqI,
    LtI,
    LeI,
    GtI,
    GeI,
    Test,
    Ret,
    Ret0,
    Ret1,
    Halt,
}

const VM_OP_COUNT: u8 = VmOp::Halt as u8 + 1;

impl VmOp {
    fn from_u8(byte: u8) -> Option<VmOp> {
        if byte < VM_OP_COUNT {
            // Safety: repr(u8), contiguous from 0
            Some(unsafe { std::mem::transmute::<u8, VmOp>(byte) })
        } else {
            None
        }
    }
}

/// Translate a primary opcode to its secondary counterpart
fn vm_op_of(op: Opcode) -> Option<VmOp> {
    use Opcode::*;
    Some(match op {
        Nop => VmOp::Nop,
        Move => VmOp::Move,
        LoadI => VmOp::LoadI,
        LoadF => VmOp::LoadF,
        LoadK => VmOp::LoadK,
        LoadTrue => VmOp::LoadTrue,
        LoadFalse => VmOp::LoadFalse,
        LoadNil => VmOp::LoadNil,
        Add => VmOp::Add,
        Sub => VmOp::Sub,
        Mul => VmOp::Mul,
        Div => VmOp::Div,
        Mod => VmOp::Mod,
        Pow => VmOp::Pow,
        Unm => VmOp::Unm,
        Not => VmOp::Not,
        AddI => VmOp::AddI,
        BAnd => VmOp::Band,
        BOr => VmOp::Bor,
        BXor => VmOp::Bxor,
        BNot => VmOp::Bnot,
        Shl => VmOp::Shl,
        Shr => VmOp::Shr,
        Jmp => VmOp::Jmp,
        Eq => VmOp::Eq,
        Lt => VmOp::Lt,
        Le => VmOp::Le,
        EqK => VmOp::EqK,
        EqI => VmOp::EqI,
        LtI => VmOp::LtI,
        LeI => VmOp::LeI,
        GtI => VmOp::GtI,
        GeI => VmOp::GeI,
        Test => VmOp::Test,
        Return => VmOp::Ret,
        Return0 => VmOp::Ret0,
        Return1 => VmOp::Ret1,
        _ => return None,
    })
}

#[inline]
fn vm_make(op: u8, a: u16, b: u16, c: u16, flags: u8) -> VmInstruction {
    op as u64
        | (a as u64) << 8
        | (b as u64) << 24
        | (c as u64) << 40
        | (flags as u64) << 56
}

#[inline]
fn vm_make_bx(op: u8, a: u16, sbx: i64) -> VmInstruction {
    op as u64 | (a as u64) << 8 | (((sbx + VM_OFFSET_BX) as u64) & 0xFF_FFFF_FFFF) << 24
}

#[inline]
fn vm_op(inst: VmInstruction) -> u8 {
    inst as u8
}

#[inline]
fn vm_a(inst: VmInstruction) -> u16 {
    (inst >> 8) as u16
}

#[inline]
fn vm_b(inst: VmInstruction) -> u16 {
    (inst >> 24) as u16
}

#[inline]
fn vm_c(inst: VmInstruction) -> u16 {
    (inst >> 40) as u16
}

#[inline]
fn vm_flags(inst: VmInstruction) -> u8 {
    (inst >> 56) as u8
}

#[inline]
fn vm_sbx(inst: VmInstruction) -> i64 {
    ((inst >> 24) & 0xFF_FFFF_FFFF) as i64 - VM_OFFSET_BX
}

/// Generate the secondary opcode permutation and its inverse.
///
/// The first attempt renumbers each opcode through an XOR-then-mod
/// transform seeded by an LCG; the transform is not guaranteed injective,
/// so the first collision abandons it for a Fisher–Yates permutation,
/// which always is. Callers can rely on a strict bijection either way.
pub fn generate_opcode_map(seed: u32) -> ([u8; VM_MAP_SIZE], [u8; VM_MAP_SIZE]) {
    let mut forward = [0u8; VM_MAP_SIZE];
    let mut taken = [false; VM_MAP_SIZE];
    let mut lcg = seed;
    let mut collided = false;

    for i in 0..VM_MAP_SIZE {
        lcg = lcg.wrapping_mul(1664525).wrapping_add(1013904223);
        let mapped = (i ^ (lcg >> 16) as usize) % VM_MAP_SIZE;
        if taken[mapped] {
            collided = true;
            break;
        }
        taken[mapped] = true;
        forward[i] = mapped as u8;
    }

    if collided {
        let mut rng = StdRng::seed_from_u64(seed as u64);
        for (i, slot) in forward.iter_mut().enumerate() {
            *slot = i as u8;
        }
        for i in (1..VM_MAP_SIZE).rev() {
            let j = rng.gen_range(0..=i);
            forward.swap(i, j);
        }
    }

    let mut reverse = [0u8; VM_MAP_SIZE];
    for (i, &mapped) in forward.iter().enumerate() {
        reverse[mapped as usize] = i as u8;
    }
    (forward, reverse)
}

/// A registered protected-code table
#[derive(Debug, Clone)]
pub struct VmCodeTable {
    /// Encrypted secondary instruction stream
    pub code: Vec<VmInstruction>,
    /// Per-function XOR key
    pub key: u64,
    /// Seed the permutation was generated from
    pub seed: u32,
    /// Inverse opcode permutation, stored for the loader
    pub reverse_map: [u8; VM_MAP_SIZE],
}

/// Process-wide registry of protected code, keyed by prototype identity.
/// Shared across States behind a coarse mutex.
static VM_REGISTRY: Lazy<Mutex<FxHashMap<u64, VmCodeTable>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Register a table for a prototype
pub fn register(proto_key: u64, table: VmCodeTable) {
    VM_REGISTRY.lock().insert(proto_key, table);
}

/// Look up the table registered for a prototype
pub fn find(proto_key: u64) -> Option<VmCodeTable> {
    VM_REGISTRY.lock().get(&proto_key).cloned()
}

/// Drop a registration (when a prototype dies)
pub fn unregister(proto_key: u64) {
    VM_REGISTRY.lock().remove(&proto_key);
}

/// Re-encode a prototype for the secondary VM and register the result.
///
/// The prototype's primary code is left in place; execution through the
/// trampoline uses the registered table instead.
pub fn protect(proto: &mut Proto, proto_key: u64, seed: u32) -> Result<(), ObfuscateError> {
    if proto.is_locked() {
        return Err(ObfuscateError::Locked);
    }
    let mut rng = StdRng::seed_from_u64(seed as u64 ^ proto_key);
    let key: u64 = rng.gen();
    let (forward, reverse) = generate_opcode_map(seed);

    let mut code = Vec::with_capacity(proto.code.len() + 1);
    for &inst in &proto.code {
        let op = instr::get_opcode(inst).ok_or(ObfuscateError::BadOutput(
            "invalid opcode in source proto".to_string(),
        ))?;
        let vm_op_raw = vm_op_of(op).ok_or_else(|| {
            ObfuscateError::BadOutput(format!("opcode {} has no secondary encoding", op.name()))
        })? as u8;
        let mapped = forward[vm_op_raw as usize];

        let word = match op.mode() {
            lux_bytecode::OpMode::IAsBx => vm_make_bx(mapped, instr::get_a(inst), instr::get_sbx(inst)),
            lux_bytecode::OpMode::IsJ => vm_make_bx(mapped, 0, instr::get_sj(inst)),
            lux_bytecode::OpMode::IABx => {
                vm_make_bx(mapped, instr::get_a(inst), instr::get_bx(inst) as i64)
            }
            _ => vm_make(
                mapped,
                instr::get_a(inst),
                instr::get_b(inst),
                instr::get_c(inst),
                instr::get_k(inst) as u8,
            ),
        };
        code.push(word ^ key);
    }
    // explicit halt terminator, encrypted like the rest
    code.push(vm_make(forward[VmOp::Halt as usize], 0, 0, 0, 0) ^ key);

    register(
        proto_key,
        VmCodeTable {
            code,
            key,
            seed,
            reverse_map: reverse,
        },
    );
    proto.obf_mode |= obf_mode::VM_PROTECT;
    tracing::debug!(proto_key, words = proto.code.len() + 1, "proto VM-protected");
    Ok(())
}

/// Trampoline: run a protected function in the secondary VM.
///
/// Instructions are decrypted on demand, one word per dispatch. Returns
/// the function result (or `None` for a bare return).
pub fn run_protected(
    table: &VmCodeTable,
    constants: &[lux_bytecode::Constant],
    slots: &mut [Value],
) -> Result<Option<Value>, LuxError> {
    let mut pc: usize = 0;
    loop {
        let word = *table
            .code
            .get(pc)
            .ok_or_else(|| LuxError::Runtime("secondary vm ran off the code end".into()))?
            ^ table.key;
        let raw = table.reverse_map[vm_op(word) as usize];
        let op = VmOp::from_u8(raw)
            .ok_or_else(|| LuxError::Runtime(format!("bad secondary opcode {raw}")))?;
        pc += 1;

        let a = vm_a(word) as usize;
        match op {
            VmOp::Nop => {}
            VmOp::Halt => return Ok(None),
            VmOp::Move => slots[a] = slots[vm_b(word) as usize],
            VmOp::LoadI => slots[a] = Value::Int(vm_sbx(word)),
            VmOp::LoadF => slots[a] = Value::Float(vm_sbx(word) as f64),
            VmOp::LoadTrue => slots[a] = Value::Bool(true),
            VmOp::LoadFalse => slots[a] = Value::Bool(false),
            VmOp::LoadNil => {
                for slot in slots.iter_mut().skip(a).take(vm_b(word) as usize + 1) {
                    *slot = Value::Nil;
                }
            }
            VmOp::LoadK => {
                let idx = vm_sbx(word) as usize;
                slots[a] = match constants.get(idx) {
                    Some(lux_bytecode::Constant::Int(i)) => Value::Int(*i),
                    Some(lux_bytecode::Constant::Float(f)) => Value::Float(*f),
                    Some(lux_bytecode::Constant::Bool(b)) => Value::Bool(*b),
                    Some(lux_bytecode::Constant::Nil) | None => Value::Nil,
                    Some(lux_bytecode::Constant::Str(_)) => {
                        return Err(LuxError::Runtime(
                            "string constants not supported in the secondary vm".into(),
                        ))
                    }
                };
            }
            VmOp::Add | VmOp::Sub | VmOp::Mul | VmOp::Div | VmOp::Mod => {
                let lhs = slots[vm_b(word) as usize];
                let rhs = slots[vm_c(word) as usize];
                slots[a] = arith(op, lhs, rhs)?;
            }
            VmOp::AddI => {
                let lhs = slots[vm_b(word) as usize];
                let imm = vm_c(word) as i32 - instr::OFFSET_SC;
                slots[a] = arith(VmOp::Add, lhs, Value::Int(imm as i64))?;
            }
            VmOp::Unm => {
                slots[a] = match slots[vm_b(word) as usize] {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    _ => return Err(LuxError::Runtime("cannot negate non-number".into())),
                };
            }
            VmOp::Not => {
                let truthy = slots[vm_b(word) as usize].is_truthy();
                slots[a] = Value::Bool(!truthy);
            }
            VmOp::Band | VmOp::Bor | VmOp::Bxor | VmOp::Shl | VmOp::Shr => {
                let lhs = int_of(slots[vm_b(word) as usize])?;
                let rhs = int_of(slots[vm_c(word) as usize])?;
                slots[a] = Value::Int(match op {
                    VmOp::Band => lhs & rhs,
                    VmOp::Bor => lhs | rhs,
                    VmOp::Bxor => lhs ^ rhs,
                    VmOp::Shl => lhs.wrapping_shl(rhs as u32 & 63),
                    VmOp::Shr => ((lhs as u64).wrapping_shr(rhs as u32 & 63)) as i64,
                    _ => unreachable!(),
                });
            }
            VmOp::Bnot => {
                let v = int_of(slots[vm_b(word) as usize])?;
                slots[a] = Value::Int(!v);
            }
            VmOp::Jmp => {
                let target = pc as i64 + vm_sbx(word);
                pc = target as usize;
            }
            VmOp::Eq | VmOp::Lt | VmOp::Le | VmOp::EqI | VmOp::LtI | VmOp::LeI | VmOp::GtI
            | VmOp::GeI | VmOp::Test | VmOp::EqK => {
                let k = vm_flags(word) & 1 != 0;
                let result = condition(op, word, constants, slots)?;
                // the test skips the following jump when it disagrees
                // with k, exactly like the primary interpreter
                if result != k {
                    pc += 1;
                }
            }
            VmOp::Ret0 => return Ok(None),
            VmOp::Ret1 => return Ok(Some(slots[a])),
            VmOp::Ret => {
                let count = vm_b(word) as usize;
                return Ok(if count >= 2 { Some(slots[a]) } else { None });
            }
            VmOp::Pow => {
                return Err(LuxError::Runtime(
                    "pow not supported in the secondary vm".into(),
                ))
            }
        }
    }
}

fn int_of(v: Value) -> Result<i64, LuxError> {
    v.as_int()
        .ok_or_else(|| LuxError::Runtime("integer expected".into()))
}

fn arith(op: VmOp, lhs: Value, rhs: Value) -> Result<Value, LuxError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(match op {
            VmOp::Add => Value::Int(a.wrapping_add(b)),
            VmOp::Sub => Value::Int(a.wrapping_sub(b)),
            VmOp::Mul => Value::Int(a.wrapping_mul(b)),
            VmOp::Div => {
                if b == 0 {
                    return Err(LuxError::Runtime("attempt to divide by zero".into()));
                }
                Value::Int(a.wrapping_div(b))
            }
            VmOp::Mod => {
                if b == 0 {
                    return Err(LuxError::Runtime("attempt to perform 'mod' by zero".into()));
                }
                Value::Int(a.rem_euclid(b))
            }
            _ => unreachable!(),
        }),
        (lhs, rhs) => match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => Ok(match op {
                VmOp::Add => Value::Float(a + b),
                VmOp::Sub => Value::Float(a - b),
                VmOp::Mul => Value::Float(a * b),
                VmOp::Div => Value::Float(a / b),
                VmOp::Mod => Value::Float(a - (a / b).floor() * b),
                _ => unreachable!(),
            }),
            _ => Err(LuxError::Runtime("cannot add non-numbers".into())),
        },
    }
}

fn condition(
    op: VmOp,
    word: VmInstruction,
    constants: &[lux_bytecode::Constant],
    slots: &[Value],
) -> Result<bool, LuxError> {
    let a = slots[vm_a(word) as usize];
    Ok(match op {
        VmOp::Test => a.is_truthy(),
        VmOp::Eq => a == slots[vm_b(word) as usize],
        VmOp::Lt | VmOp::Le => {
            let b = slots[vm_b(word) as usize];
            match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => {
                    if op == VmOp::Lt {
                        x < y
                    } else {
                        x <= y
                    }
                }
                _ => return Err(LuxError::Runtime("cannot compare non-numbers".into())),
            }
        }
        VmOp::EqK => {
            let idx = vm_b(word) as usize;
            match (a, constants.get(idx)) {
                (Value::Int(x), Some(lux_bytecode::Constant::Int(y))) => x == *y,
                (Value::Float(x), Some(lux_bytecode::Constant::Float(y))) => x == *y,
                (Value::Bool(x), Some(lux_bytecode::Constant::Bool(y))) => x == *y,
                (Value::Nil, Some(lux_bytecode::Constant::Nil)) => true,
                _ => false,
            }
        }
        VmOp::EqI | VmOp::LtI | VmOp::LeI | VmOp::GtI | VmOp::GeI => {
            let imm = (vm_b(word) as i32 - instr::OFFSET_SC) as i64;
            let x = a
                .as_int()
                .ok_or_else(|| LuxError::Runtime("integer expected in comparison".into()))?;
            match op {
                VmOp::EqI => x == imm,
                VmOp::LtI => x < imm,
                VmOp::LeI => x <= imm,
                VmOp::GtI => x > imm,
                VmOp::GeI => x >= imm,
                _ => unreachable!(),
            }
        }
        _ => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lux_bytecode::instr::{abc, asbck, asbx, sj};

    #[test]
    fn test_opcode_map_is_bijective_for_every_seed() {
        for seed in [0u32, 1, 42, 0xDEAD_BEEF, u32::MAX] {
            let (forward, reverse) = generate_opcode_map(seed);
            // forward is a permutation
            let mut seen = [false; VM_MAP_SIZE];
            for &m in forward.iter() {
                assert!(!seen[m as usize], "seed {seed}: duplicate image {m}");
                seen[m as usize] = true;
            }
            // and reverse composes to the identity
            for i in 0..VM_MAP_SIZE {
                assert_eq!(reverse[forward[i] as usize] as usize, i, "seed {seed}");
            }
        }
    }

    #[test]
    fn test_word_field_round_trip() {
        let word = vm_make(0xAB, 0x1234, 0x5678, 0x9ABC, 1);
        assert_eq!(vm_op(word), 0xAB);
        assert_eq!(vm_a(word), 0x1234);
        assert_eq!(vm_b(word), 0x5678);
        assert_eq!(vm_c(word), 0x9ABC);
        assert_eq!(vm_flags(word), 1);

        let sbx = vm_make_bx(1, 2, -123_456_789);
        assert_eq!(vm_sbx(sbx), -123_456_789);
    }

    /// |x| as a protected function
    fn abs_proto() -> Proto {
        let mut p = Proto::new(1, 2);
        p.code = vec![
            asbck(Opcode::GtI, 0, 0, 0, false),
            sj(Opcode::Jmp, 1),
            abc(Opcode::Return1, 0, 0, 0),
            abc(Opcode::Unm, 1, 0, 0),
            abc(Opcode::Return1, 1, 0, 0),
        ];
        p
    }

    #[test]
    fn test_protect_and_run() {
        let mut p = abs_proto();
        protect(&mut p, 0x1001, 7).unwrap();
        assert!(p.obf_mode & obf_mode::VM_PROTECT != 0);

        let table = find(0x1001).expect("table registered");
        // the stream is encrypted: no word decodes to a valid halt
        // without the key
        assert_eq!(table.code.len(), p.code.len() + 1);

        for input in [5i64, -5, 0, 123456] {
            let mut slots = vec![Value::Int(input), Value::Nil];
            let result = run_protected(&table, &p.constants, &mut slots).unwrap();
            assert_eq!(result, Some(Value::Int(input.abs())), "input {input}");
        }
        unregister(0x1001);
    }

    #[test]
    fn test_loop_runs_protected() {
        // sum = 0; i = 0; while i < 10 { i += 1; sum += i }; return sum
        let mut p = Proto::new(0, 3);
        p.code = vec![
            asbx(Opcode::LoadI, 0, 0),                          // sum
            asbx(Opcode::LoadI, 1, 0),                          // i
            lux_bytecode::instr::absck(Opcode::AddI, 1, 1, 1, false),
            abc(Opcode::Add, 0, 0, 1),
            asbck(Opcode::LtI, 1, 10, 0, true),
            sj(Opcode::Jmp, -4),
            abc(Opcode::Return1, 0, 0, 0),
        ];
        protect(&mut p, 0x1002, 99).unwrap();
        let table = find(0x1002).unwrap();
        let mut slots = vec![Value::Nil; 3];
        let result = run_protected(&table, &p.constants, &mut slots).unwrap();
        assert_eq!(result, Some(Value::Int(55)));
        unregister(0x1002);
    }

    #[test]
    fn test_distinct_keys_per_function() {
        let mut a = abs_proto();
        let mut b = abs_proto();
        protect(&mut a, 0x2001, 7).unwrap();
        protect(&mut b, 0x2002, 7).unwrap();
        let ta = find(0x2001).unwrap();
        let tb = find(0x2002).unwrap();
        assert_ne!(ta.key, tb.key);
        // identical plaintext, different ciphertext
        assert_ne!(ta.code, tb.code);
        unregister(0x2001);
        unregister(0x2002);
    }

    #[test]
    fn test_locked_proto_refused() {
        let mut p = abs_proto();
        p.lock();
        assert_eq!(
            protect(&mut p, 0x3001, 1).unwrap_err(),
            ObfuscateError::Locked
        );
    }
}
