//! Bytecode obfuscation pipeline
//!
//! Rewrites prototypes into semantically equivalent but hostile-to-static-
//! analysis forms: control-flow flattening with optional block shuffling,
//! state encoding and bogus blocks (`cff`), re-encoding onto an encrypted
//! secondary VM (`vmprotect`), and the image-encoded serialiser with its
//! matching reader (`dump`, `undump`, `png`).

pub mod cff;
pub mod dump;
pub mod png;
pub mod undump;
pub mod vmprotect;

pub use cff::{flatten, CffMetadata};
pub use dump::{dump_proto, DumpOptions};
pub use undump::load_proto;

/// Transformation log collected for a single pipeline invocation.
///
/// The pipeline never writes global state; callers that want the
/// transformation transcript render it from here.
#[derive(Debug, Default)]
pub struct ObfLog {
    lines: Vec<String>,
    enabled: bool,
}

impl ObfLog {
    /// A log that records nothing
    pub fn disabled() -> Self {
        ObfLog {
            lines: Vec::new(),
            enabled: false,
        }
    }

    /// A log that collects every line
    pub fn enabled() -> Self {
        ObfLog {
            lines: Vec::new(),
            enabled: true,
        }
    }

    /// Append one line when enabled
    pub fn line(&mut self, text: impl FnOnce() -> String) {
        if self.enabled {
            self.lines.push(text());
        }
    }

    /// The collected transcript
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}
