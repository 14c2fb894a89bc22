//! Structural verification of prototypes
//!
//! Checks run before a `Proto` is first executed or serialised: every
//! opcode byte must be valid, jumps must land inside the instruction
//! stream, register operands must stay below `max_stack_size`, and pool
//! indices must be in range. The obfuscation pipeline re-runs verification
//! on its output.

use thiserror::Error;

use crate::instr::{self, OpMode, Opcode};
use crate::proto::Proto;

/// Structural defects found in a prototype
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum VerifyError {
    #[error("invalid opcode byte {byte} at pc {pc}")]
    InvalidOpcode { pc: usize, byte: u8 },

    #[error("jump at pc {pc} targets {target}, outside 0..{len}")]
    JumpOutOfRange { pc: usize, target: i64, len: usize },

    #[error("register {reg} at pc {pc} exceeds max stack size {max}")]
    RegisterOutOfRange { pc: usize, reg: u16, max: u8 },

    #[error("constant index {index} at pc {pc} exceeds pool size {len}")]
    ConstantOutOfRange { pc: usize, index: u32, len: usize },

    #[error("nested proto index {index} at pc {pc} exceeds {len}")]
    ProtoOutOfRange { pc: usize, index: u32, len: usize },

    #[error("empty instruction stream")]
    EmptyCode,
}

/// Registers written by an instruction, for bound checking
fn dest_register(op: Opcode, inst: u64) -> Option<u16> {
    use Opcode::*;
    match op {
        // Instructions whose A operand is a destination register
        Move | LoadI | LoadF | LoadK | LoadFalse | LoadTrue | LoadNil | GetUpval | GetTable
        | GetI | GetField | NewTable | Add | Sub | Mul | Div | Mod | Pow | Unm | Not | Len
        | AddI | BAnd | BOr | BXor | BNot | Shl | Shr | Concat | Closure => {
            Some(instr::get_a(inst))
        }
        _ => None,
    }
}

/// Verify one prototype (not its children)
pub fn verify_proto(proto: &Proto) -> Result<(), VerifyError> {
    let len = proto.code.len();
    if len == 0 {
        return Err(VerifyError::EmptyCode);
    }

    for (pc, &inst) in proto.code.iter().enumerate() {
        let byte = instr::get_op_raw(inst);
        let op = Opcode::from_u8(byte).ok_or(VerifyError::InvalidOpcode { pc, byte })?;

        match op.mode() {
            OpMode::IsJ => {
                let target = instr::jump_target(inst, pc);
                if target < 0 || target as usize >= len {
                    return Err(VerifyError::JumpOutOfRange { pc, target, len });
                }
            }
            OpMode::IABx if op == Opcode::LoadK => {
                let index = instr::get_bx(inst);
                if index as usize >= proto.constants.len() {
                    return Err(VerifyError::ConstantOutOfRange {
                        pc,
                        index,
                        len: proto.constants.len(),
                    });
                }
            }
            OpMode::IABx if op == Opcode::Closure => {
                let index = instr::get_bx(inst);
                if index as usize >= proto.protos.len() {
                    return Err(VerifyError::ProtoOutOfRange {
                        pc,
                        index,
                        len: proto.protos.len(),
                    });
                }
            }
            _ => {}
        }

        if let Some(reg) = dest_register(op, inst) {
            if reg as usize >= proto.max_stack_size as usize {
                return Err(VerifyError::RegisterOutOfRange {
                    pc,
                    reg,
                    max: proto.max_stack_size,
                });
            }
        }
    }

    Ok(())
}

/// Verify a prototype and all nested prototypes
pub fn verify_recursive(proto: &Proto) -> Result<(), VerifyError> {
    verify_proto(proto)?;
    for child in &proto.protos {
        verify_recursive(child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{abc, asbx, sj};

    #[test]
    fn test_valid_proto_passes() {
        let mut p = Proto::new(0, 3);
        p.code = vec![
            asbx(Opcode::LoadI, 0, 1),
            abc(Opcode::Add, 1, 0, 0),
            abc(Opcode::Return1, 1, 0, 0),
        ];
        assert!(verify_proto(&p).is_ok());
    }

    #[test]
    fn test_jump_out_of_range() {
        let mut p = Proto::new(0, 2);
        p.code = vec![sj(Opcode::Jmp, 10), abc(Opcode::Return0, 0, 0, 0)];
        assert!(matches!(
            verify_proto(&p),
            Err(VerifyError::JumpOutOfRange { pc: 0, .. })
        ));
    }

    #[test]
    fn test_register_bound() {
        let mut p = Proto::new(0, 2);
        p.code = vec![asbx(Opcode::LoadI, 5, 1), abc(Opcode::Return0, 0, 0, 0)];
        assert!(matches!(
            verify_proto(&p),
            Err(VerifyError::RegisterOutOfRange { reg: 5, .. })
        ));
    }

    #[test]
    fn test_constant_bound() {
        let mut p = Proto::new(0, 2);
        p.code = vec![
            crate::instr::abx(Opcode::LoadK, 0, 3),
            abc(Opcode::Return0, 0, 0, 0),
        ];
        assert!(matches!(
            verify_proto(&p),
            Err(VerifyError::ConstantOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn test_empty_code_rejected() {
        let p = Proto::new(0, 2);
        assert!(matches!(verify_proto(&p), Err(VerifyError::EmptyCode)));
    }
}
