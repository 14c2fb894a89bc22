//! Engine error model
//!
//! Each subsystem has its own error enum; `LuxError` is the single
//! host-facing union. JIT errors never reach the host: the recorder
//! converts them into aborts and interpretation continues unchanged.

use thiserror::Error;

use lux_bytecode::api::ApiError;
use lux_bytecode::DecodeError;

/// Errors raised by the BigNum engine
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NumError {
    /// Division or modulo by zero
    #[error("attempt to divide by zero")]
    DivideByZero,

    /// Negative exponent on a BigInt base (result would be a BigFloat)
    #[error("negative power not supported for big integers")]
    NegativePower,

    /// Operand is not numeric
    #[error("value is not a number")]
    NotANumber,

    /// Unparseable decimal literal
    #[error("malformed numeric literal {0:?}")]
    BadLiteral(String),
}

/// Errors internal to the JIT; converted to recorder aborts, never
/// propagated to the host
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum JitError {
    /// Executable-memory allocation failed or hit the engine cap
    #[error("machine-code memory exhausted")]
    Memory,

    /// The recorder met an opcode it cannot compile
    #[error("bytecode not yet implemented by the recorder")]
    NotYetImplemented,

    /// Too many aborts at this location
    #[error("location is blacklisted")]
    Blacklisted,

    /// IR or recorded-bytecode limit exceeded
    #[error("trace limit exceeded")]
    TraceLimit,

    /// Call-inline depth exceeded
    #[error("loop or call depth exceeded")]
    LoopDepth,

    /// Observed operand types changed between iterations
    #[error("operand types are unstable")]
    TypeUnstable,

    /// Side-exit or snapshot budget exceeded
    #[error("side-exit budget exceeded")]
    SideExit,
}

/// Errors raised while loading a bytecode image
#[derive(Debug, Error)]
pub enum LoadError {
    /// Malformed byte stream
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Signature, probe, or size check failed
    #[error("bad image header: {0}")]
    BadHeader(&'static str),

    /// A SHA-256 guard did not match the decoded content
    #[error("integrity check failed: {0}")]
    IntegrityCheck(&'static str),

    /// PNG payload could not be decoded
    #[error("corrupt image payload: {0}")]
    BadImage(&'static str),

    /// Constant tag or opcode map entry out of range
    #[error("malformed image field: {0}")]
    BadField(&'static str),
}

/// Errors raised by the obfuscation pipeline
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObfuscateError {
    /// The prototype contains a loop-terminator opcode
    #[error("proto contains loop opcodes and cannot be flattened")]
    LoopOpcode,

    /// The original code writes at or above the chosen state register
    #[error("proto writes register {0}, at or above the state register")]
    StateRegisterClash(u16),

    /// The prototype is locked against modification
    #[error("proto is locked")]
    Locked,

    /// Structural verification of the rewritten code failed
    #[error("flattened code failed verification: {0}")]
    BadOutput(String),
}

/// Host-facing error union
#[derive(Debug, Error)]
pub enum LuxError {
    /// Allocation failure
    #[error("out of memory")]
    Memory,

    /// Arithmetic error (divide by zero, NaN table key, bad literal)
    #[error("arithmetic error: {0}")]
    Arithmetic(#[from] NumError),

    /// Bytecode API misuse
    #[error("bytecode error: {0}")]
    InvalidInput(#[from] ApiError),

    /// Obfuscation pipeline refusal
    #[error("obfuscation error: {0}")]
    Obfuscate(#[from] ObfuscateError),

    /// Image load failure; the VM is never entered with a tampered image
    #[error("load error: {0}")]
    Load(#[from] LoadError),

    /// Runtime error with a rendered message
    #[error("runtime error: {0}")]
    Runtime(String),
}
