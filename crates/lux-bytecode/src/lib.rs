//! Lux VM bytecode definitions
//!
//! This crate provides the 64-bit instruction word, the opcode table with
//! its static operand modes, the `Proto` function-template model, the
//! byte-level image encoding primitives, the structural verifier, and the
//! host-facing bytecode manipulation API.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod encoder;
pub mod instr;
pub mod proto;
pub mod verify;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use instr::{Instruction, OpMode, Opcode, NUM_OPCODES};
pub use proto::{AbsLine, Constant, LocalVar, Proto, UpvalDesc};
pub use verify::{verify_proto, verify_recursive, VerifyError};
