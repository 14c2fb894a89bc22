//! Lux VM runtime core
//!
//! The execution engine behind the Lux VM: the tagged value model and
//! per-State arenas, the arbitrary-precision numeric engine, the
//! interpreter fallback, the tracing JIT compiler (IR, optimiser, x86-64
//! and AArch64 emitters, executable-memory manager), the bytecode
//! obfuscation pipeline (control-flow flattening, VM protection, the
//! image-encoded serialiser and reader), and the table-access
//! observability filter.
//!
//! Each [`State`] is one OS-thread-bound interpreter with its own JIT
//! engine and arenas; the string-intern table and the VM-protect registry
//! are the only process-wide resources.

pub mod arena;
pub mod bignum;
pub mod error;
pub mod filter;
pub mod interp;
pub mod jit;
pub mod obfuscate;
pub mod state;
pub mod value;

pub use bignum::{Big, BigFloat, BigInt};
pub use error::{JitError, LoadError, LuxError, NumError, ObfuscateError};
pub use state::{intern, resolve, BigOp, State};
pub use value::{TypeTag, Value};
