//! Bytecode manipulation API
//!
//! The host-facing `ByteCode` namespace: raw instruction access by 1-based
//! index, structured decode/encode per opcode mode, enumeration of a
//! prototype's pools, and the lock / tamper-baseline controls. Every
//! modifying operation rejects a locked `Proto`.
//!
//! Errors carry the offending argument position so the host boundary can
//! render `bad argument #n` diagnostics.

use thiserror::Error;

use crate::instr::{self, Instruction, OpMode, Opcode};
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc};

/// Bytecode API misuse
#[derive(Debug, Error)]
pub enum ApiError {
    /// Index outside `1..=len`
    #[error("bad argument #{arg}: index {index} out of range (1..={len})")]
    IndexOutOfRange { arg: usize, index: i64, len: usize },

    /// Instruction fields do not match the opcode's static mode
    #[error("bad argument #{arg}: opcode {opcode} expects {expected:?} fields")]
    ModeMismatch {
        arg: usize,
        opcode: &'static str,
        expected: OpMode,
    },

    /// Byte does not name an opcode
    #[error("bad argument #{arg}: invalid opcode byte {byte}")]
    BadOpcode { arg: usize, byte: u8 },

    /// Modification attempted on a locked prototype
    #[error("bad argument #{arg}: prototype is locked")]
    Locked { arg: usize },
}

/// A decoded instruction, shaped by the opcode's mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Decoded {
    Abc {
        op: Opcode,
        a: u16,
        b: u16,
        c: u16,
        k: bool,
    },
    Abx {
        op: Opcode,
        a: u16,
        bx: u32,
    },
    Asbx {
        op: Opcode,
        a: u16,
        sbx: i64,
    },
    Ax {
        op: Opcode,
        ax: u64,
    },
    Sj {
        op: Opcode,
        sj: i64,
    },
    VAbc {
        op: Opcode,
        a: u16,
        b: u16,
        c: u16,
        k: bool,
        v: u8,
    },
}

impl Decoded {
    /// The decoded opcode
    pub fn opcode(&self) -> Opcode {
        match *self {
            Decoded::Abc { op, .. }
            | Decoded::Abx { op, .. }
            | Decoded::Asbx { op, .. }
            | Decoded::Ax { op, .. }
            | Decoded::Sj { op, .. }
            | Decoded::VAbc { op, .. } => op,
        }
    }
}

fn check_index(arg: usize, index: i64, len: usize) -> Result<usize, ApiError> {
    if index < 1 || index as usize > len {
        return Err(ApiError::IndexOutOfRange { arg, index, len });
    }
    Ok(index as usize - 1)
}

fn check_unlocked(arg: usize, proto: &Proto) -> Result<(), ApiError> {
    if proto.is_locked() {
        return Err(ApiError::Locked { arg });
    }
    Ok(())
}

/// Number of instructions in the prototype
pub fn code_count(proto: &Proto) -> usize {
    proto.code.len()
}

/// Raw instruction word at a 1-based index
pub fn get_code(proto: &Proto, index: i64) -> Result<Instruction, ApiError> {
    let i = check_index(2, index, proto.code.len())?;
    Ok(proto.code[i])
}

/// Replace the raw instruction word at a 1-based index
pub fn set_code(proto: &mut Proto, index: i64, inst: Instruction) -> Result<(), ApiError> {
    check_unlocked(1, proto)?;
    let i = check_index(2, index, proto.code.len())?;
    let byte = instr::get_op_raw(inst);
    if Opcode::from_u8(byte).is_none() {
        return Err(ApiError::BadOpcode { arg: 3, byte });
    }
    proto.code[i] = inst;
    Ok(())
}

/// Decode the instruction at a 1-based index into named fields per its mode
pub fn get_instruction(proto: &Proto, index: i64) -> Result<Decoded, ApiError> {
    let i = check_index(2, index, proto.code.len())?;
    decode(proto.code[i], 3)
}

/// Decode a raw instruction word
pub fn decode(inst: Instruction, arg: usize) -> Result<Decoded, ApiError> {
    let byte = instr::get_op_raw(inst);
    let op = Opcode::from_u8(byte).ok_or(ApiError::BadOpcode { arg, byte })?;
    Ok(match op.mode() {
        OpMode::IABC => Decoded::Abc {
            op,
            a: instr::get_a(inst),
            b: instr::get_b(inst),
            c: instr::get_c(inst),
            k: instr::get_k(inst),
        },
        OpMode::IABx => Decoded::Abx {
            op,
            a: instr::get_a(inst),
            bx: instr::get_bx(inst),
        },
        OpMode::IAsBx => Decoded::Asbx {
            op,
            a: instr::get_a(inst),
            sbx: instr::get_sbx(inst),
        },
        OpMode::IAx => Decoded::Ax {
            op,
            ax: instr::get_ax(inst),
        },
        OpMode::IsJ => Decoded::Sj {
            op,
            sj: instr::get_sj(inst),
        },
        OpMode::IvABC => Decoded::VAbc {
            op,
            a: instr::get_a(inst),
            b: instr::get_b(inst),
            c: instr::get_c(inst),
            k: instr::get_k(inst),
            v: instr::get_v(inst),
        },
    })
}

/// Encode named fields back into a raw instruction word.
///
/// The field shape must match the opcode's static mode.
pub fn encode(fields: Decoded) -> Result<Instruction, ApiError> {
    let op = fields.opcode();
    let mode = op.mode();
    let mismatch = || ApiError::ModeMismatch {
        arg: 2,
        opcode: op.name(),
        expected: mode,
    };
    match (mode, fields) {
        (OpMode::IABC, Decoded::Abc { a, b, c, k, .. }) => Ok(instr::abck(op, a, b, c, k)),
        (OpMode::IABx, Decoded::Abx { a, bx, .. }) => Ok(instr::abx(op, a, bx)),
        (OpMode::IAsBx, Decoded::Asbx { a, sbx, .. }) => Ok(instr::asbx(op, a, sbx)),
        (OpMode::IAx, Decoded::Ax { ax, .. }) => Ok(instr::ax(op, ax)),
        (OpMode::IsJ, Decoded::Sj { sj, .. }) => Ok(instr::sj(op, sj)),
        (OpMode::IvABC, Decoded::VAbc { a, b, c, k, .. }) => Ok(instr::abck(op, a, b, c, k)),
        _ => Err(mismatch()),
    }
}

/// Set the instruction at a 1-based index from decoded fields
pub fn set_instruction(proto: &mut Proto, index: i64, fields: Decoded) -> Result<(), ApiError> {
    check_unlocked(1, proto)?;
    let i = check_index(2, index, proto.code.len())?;
    proto.code[i] = encode(fields)?;
    Ok(())
}

/// Constant at a 1-based index
pub fn get_constant(proto: &Proto, index: i64) -> Result<&Constant, ApiError> {
    let i = check_index(2, index, proto.constants.len())?;
    Ok(&proto.constants[i])
}

/// All constants in pool order
pub fn constants(proto: &Proto) -> &[Constant] {
    &proto.constants
}

/// Upvalue descriptor at a 1-based index
pub fn get_upvalue(proto: &Proto, index: i64) -> Result<&UpvalDesc, ApiError> {
    let i = check_index(2, index, proto.upvalues.len())?;
    Ok(&proto.upvalues[i])
}

/// All upvalue descriptors
pub fn upvalues(proto: &Proto) -> &[UpvalDesc] {
    &proto.upvalues
}

/// Local-variable record at a 1-based index
pub fn get_local(proto: &Proto, index: i64) -> Result<&LocalVar, ApiError> {
    let i = check_index(2, index, proto.locals.len())?;
    Ok(&proto.locals[i])
}

/// All local-variable records
pub fn locals(proto: &Proto) -> &[LocalVar] {
    &proto.locals
}

/// Nested prototype at a 1-based index
pub fn get_nested_proto(proto: &Proto, index: i64) -> Result<&Proto, ApiError> {
    let i = check_index(2, index, proto.protos.len())?;
    Ok(&proto.protos[i])
}

/// Number of nested prototypes
pub fn nested_count(proto: &Proto) -> usize {
    proto.protos.len()
}

/// Pin the prototype against collection
pub fn mark_gc_fixed(proto: &mut Proto) {
    proto.mark_gc_fixed();
}

/// Freeze the prototype against further modification
pub fn lock(proto: &mut Proto) {
    proto.lock();
}

/// Whether the prototype is frozen
pub fn is_locked(proto: &Proto) -> bool {
    proto.is_locked()
}

/// Record the tamper baseline. Rejects a locked prototype, since the
/// baseline is itself a modification of the bookkeeping state.
pub fn mark_original(proto: &mut Proto) -> Result<(), ApiError> {
    check_unlocked(1, proto)?;
    proto.mark_original();
    Ok(())
}

/// Whether the code has drifted from the recorded baseline
pub fn is_tampered(proto: &Proto) -> bool {
    proto.is_tampered()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{abc, asbx};

    fn sample() -> Proto {
        let mut p = Proto::new(1, 4);
        p.code = vec![
            asbx(Opcode::LoadI, 1, 42),
            abc(Opcode::Add, 2, 0, 1),
            abc(Opcode::Return1, 2, 0, 0),
        ];
        p.constants = vec![Constant::Int(7), Constant::Str("x".into())];
        p
    }

    #[test]
    fn test_one_based_indexing() {
        let p = sample();
        assert_eq!(code_count(&p), 3);
        assert!(get_code(&p, 0).is_err());
        assert!(get_code(&p, 4).is_err());
        let first = get_code(&p, 1).unwrap();
        assert_eq!(instr::get_opcode(first), Some(Opcode::LoadI));
    }

    #[test]
    fn test_decode_shapes_follow_mode() {
        let p = sample();
        match get_instruction(&p, 1).unwrap() {
            Decoded::Asbx { op, a, sbx } => {
                assert_eq!(op, Opcode::LoadI);
                assert_eq!(a, 1);
                assert_eq!(sbx, 42);
            }
            other => panic!("expected Asbx, got {other:?}"),
        }
        match get_instruction(&p, 2).unwrap() {
            Decoded::Abc { op, a, b, c, k } => {
                assert_eq!(op, Opcode::Add);
                assert_eq!((a, b, c, k), (2, 0, 1, false));
            }
            other => panic!("expected Abc, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_rejects_mode_mismatch() {
        // Add is iABC; feeding it iABx fields must fail
        let bad = Decoded::Abx {
            op: Opcode::Add,
            a: 0,
            bx: 1,
        };
        assert!(matches!(encode(bad), Err(ApiError::ModeMismatch { .. })));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let fields = Decoded::Abc {
            op: Opcode::Sub,
            a: 3,
            b: 1,
            c: 2,
            k: true,
        };
        let inst = encode(fields).unwrap();
        assert_eq!(decode(inst, 1).unwrap(), fields);
    }

    #[test]
    fn test_locked_proto_rejects_writes() {
        let mut p = sample();
        lock(&mut p);
        assert!(is_locked(&p));

        let inst = abc(Opcode::Move, 0, 1, 0);
        assert!(matches!(
            set_code(&mut p, 1, inst),
            Err(ApiError::Locked { arg: 1 })
        ));
        assert!(mark_original(&mut p).is_err());
    }

    #[test]
    fn test_tamper_flow() {
        let mut p = sample();
        mark_original(&mut p).unwrap();
        assert!(!is_tampered(&p));

        set_code(&mut p, 1, asbx(Opcode::LoadI, 1, 43)).unwrap();
        assert!(is_tampered(&p));
    }

    #[test]
    fn test_set_code_rejects_bad_opcode() {
        let mut p = sample();
        assert!(matches!(
            set_code(&mut p, 1, 0xFF),
            Err(ApiError::BadOpcode { arg: 3, byte: 0xFF })
        ));
    }

    #[test]
    fn test_pool_enumeration() {
        let p = sample();
        assert_eq!(constants(&p).len(), 2);
        assert!(matches!(get_constant(&p, 1).unwrap(), Constant::Int(7)));
        assert!(get_constant(&p, 3).is_err());
        assert_eq!(nested_count(&p), 0);
    }
}
