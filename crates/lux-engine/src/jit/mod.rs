//! Tracing JIT compiler
//!
//! Hot bytecode regions are speculatively specialised into native code:
//! - hotness detection and the trace recorder (`trace`)
//! - the linear IR and its builder with CSE (`types`, `ir`)
//! - backend-agnostic optimisation passes (`opt`)
//! - x86-64 / AArch64 code emitters (`emit`)
//! - the executable-memory manager (`mem`)
//! - the controller wiring it all to the interpreter (`engine`)

pub mod emit;
pub mod engine;
pub mod ir;
pub mod mem;
pub mod opt;
pub mod trace;
pub mod types;

pub use engine::{HookAction, JitEngine, JitOptions, JitStats};
