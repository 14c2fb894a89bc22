//! Machine-code emission
//!
//! Per-architecture emitters lower the linear IR of a committed trace into
//! position-independent native code. The shared pieces live here: the code
//! buffer with label binding and deferred rel32 patching, and the frame
//! layout compiled traces receive at run time.
//!
//! A compiled trace is entered as `extern "C" fn(*mut TraceFrame) -> u32`.
//! The frame points at the interpreter's register window, split into
//! payload words and type-tag bytes; stores write both back eagerly, so a
//! failing guard only needs to return its exit index for the controller to
//! resume interpretation at the snapshot's pc.

pub mod a64;
pub mod x64;

use crate::error::JitError;
use crate::jit::types::{IrConst, IrIns, SideExit};

/// Interpreter state handed to a compiled trace
#[repr(C)]
pub struct TraceFrame {
    /// Slot payload words: integers raw, floats by bit pattern,
    /// collectables by arena index
    pub payloads: *mut i64,
    /// Slot type tags, one `TypeTag` byte per slot
    pub tags: *mut u8,
    /// Number of valid slots
    pub nslots: usize,
}

/// Entry signature of compiled trace code; the return value is the index
/// of the side exit taken
pub type TraceEntry = extern "C" fn(*mut TraceFrame) -> u32;

/// Everything the emitter needs from a committed trace
pub struct EmitInput<'a> {
    pub ir: &'a [IrIns],
    pub consts: &'a [IrConst],
    pub exits: &'a [SideExit],
}

/// A label bound to a buffer position, or pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[derive(Debug)]
struct Reloc {
    /// Offset of the rel32 field to patch
    at: usize,
    target: Label,
}

/// Growable machine-code buffer with deferred label patching
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    relocs: Vec<Reloc>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer {
            code: Vec::with_capacity(4096),
            labels: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// Current emission offset
    #[inline]
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Allocate an unbound label
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind a label to the current position
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.code.len());
    }

    /// Emit a 32-bit little-endian displacement field referring to
    /// `target`, resolved relative to the end of the field
    pub fn emit_rel32(&mut self, target: Label) {
        self.relocs.push(Reloc {
            at: self.code.len(),
            target,
        });
        self.emit_u32(0);
    }

    /// Resolve every deferred displacement in a single pass
    pub fn finish(mut self) -> Result<Vec<u8>, JitError> {
        for reloc in &self.relocs {
            let target = self.labels[reloc.target.0 as usize].ok_or(JitError::Memory)?;
            let rel = target as i64 - (reloc.at as i64 + 4);
            let rel32 = i32::try_from(rel).map_err(|_| JitError::Memory)?;
            self.code[reloc.at..reloc.at + 4].copy_from_slice(&rel32.to_le_bytes());
        }
        Ok(self.code)
    }

    /// AArch64 uses word-relative 19/26-bit branch offsets instead of
    /// byte-relative rel32 fields; the A64 emitter patches those itself
    /// via this accessor.
    pub fn code_mut(&mut self) -> &mut Vec<u8> {
        &mut self.code
    }

    /// Bound position of a label, if bound
    pub fn label_pos(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize]
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower a trace for the host architecture
pub fn emit_trace(input: &EmitInput<'_>) -> Result<Vec<u8>, JitError> {
    #[cfg(target_arch = "x86_64")]
    {
        x64::emit(input)
    }
    #[cfg(target_arch = "aarch64")]
    {
        a64::emit(input)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = input;
        Err(JitError::NotYetImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_patching() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.emit_u8(0xE9); // jmp rel32
        buf.emit_rel32(target);
        buf.emit_u8(0x90); // skipped nop
        buf.bind(target);
        buf.emit_u8(0xC3);

        let code = buf.finish().unwrap();
        // rel32 at offset 1 must skip one byte: target(6) - end_of_field(5)
        assert_eq!(&code[1..5], &1i32.to_le_bytes());
    }

    #[test]
    fn test_unbound_label_fails() {
        let mut buf = CodeBuffer::new();
        let dangling = buf.new_label();
        buf.emit_rel32(dangling);
        assert!(buf.finish().is_err());
    }

    #[test]
    fn test_backward_label() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        buf.bind(top);
        buf.emit_bytes(&[0x90, 0x90]);
        buf.emit_u8(0xE9);
        buf.emit_rel32(top);
        let code = buf.finish().unwrap();
        // target(0) - end_of_field(7) = -7
        assert_eq!(&code[3..7], &(-7i32).to_le_bytes());
    }
}
