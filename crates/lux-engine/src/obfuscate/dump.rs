//! Bytecode image serialiser
//!
//! Writes a prototype tree as an encrypted, image-encoded byte stream.
//! Per prototype the dumper draws a fresh timestamp key, renumbers every
//! opcode through two permutation layers (the inverse of the first and
//! the forward of the second travel with the image, guarded by a SHA-256
//! over their concatenation), XORs the serialised words against the
//! timestamp, and writes the result either raw (short streams, with a
//! CRC) or as the pixels of a grayscale PNG. Constant strings are
//! independently keyed with their own timestamp and a 256-byte
//! permutation map; long strings additionally carry a plaintext hash and
//! ride inside their own PNG.
//!
//! When obfuscation flags are set, control-flow flattening and VM
//! protection run in place before each prototype is written, exactly as
//! the reader expects to find them.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use lux_bytecode::instr;
use lux_bytecode::proto::obf_mode;
use lux_bytecode::{BytecodeWriter, Constant, Proto, NUM_OPCODES};

use crate::error::LuxError;

use super::{cff, vmprotect, ObfLog};

/// 4-byte image signature
pub const SIGNATURE: &[u8; 4] = b"\x1BLux";
/// Fixed high nibble of the version byte; the low nibble is randomised
/// per dump
pub const VERSION_HIGH: u8 = 0x50;
/// Format byte
pub const FORMAT: u8 = 0;
/// Data marker catching text-mode translation damage
pub const DATA_MARKER: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
/// Little-endian integer probe
pub const INT_PROBE: i64 = 0x5678;
/// Floating-point probe
pub const NUM_PROBE: f64 = 370.5;

/// Streams shorter than this skip the PNG layer and are written raw
/// (with a CRC32 trailer)
pub const RAW_CODEC_THRESHOLD: usize = 64;
/// Strings at or above this length take the long-string path
pub const LONG_STRING_THRESHOLD: usize = 0xFF;
/// Anti-import section marker
const ANTI_IMPORT_MARK: usize = 0x99;
/// Decoy line-info entries appended to unstripped debug info
const DECOY_DEBUG_ENTRIES: usize = 2;

/// Codec tags for the byte layer
pub const CODEC_RAW: u8 = 0;
pub const CODEC_PNG: u8 = 1;

/// Serialisation options
#[derive(Debug, Clone, Copy)]
pub struct DumpOptions {
    /// Omit all debug-info contents
    pub strip: bool,
    /// Obfuscation passes to run per prototype (`obf_mode::*`)
    pub obf_flags: u32,
    /// Seed for the obfuscation passes (0 draws one from the clock)
    pub seed: u32,
}

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            strip: false,
            obf_flags: 0,
            seed: 0,
        }
    }
}

/// Generate a permutation of `0..n` and its inverse.
///
/// First attempt is the XOR-then-mod transform over an LCG stream; its
/// first collision falls back to Fisher–Yates, so the result is always a
/// strict bijection.
pub fn opcode_permutation(n: usize, seed: u64) -> (Vec<u8>, Vec<u8>) {
    debug_assert!(n <= 256);
    let mut forward = vec![0u8; n];
    let mut taken = vec![false; n];
    let mut lcg = seed as u32;
    let mut collided = false;

    for i in 0..n {
        lcg = lcg.wrapping_mul(1664525).wrapping_add(1013904223);
        let mapped = (i ^ (lcg >> 16) as usize) % n;
        if taken[mapped] {
            collided = true;
            break;
        }
        taken[mapped] = true;
        forward[i] = mapped as u8;
    }
    if collided {
        let mut rng = StdRng::seed_from_u64(seed);
        for (i, slot) in forward.iter_mut().enumerate() {
            *slot = i as u8;
        }
        for i in (1..n).rev() {
            let j = rng.gen_range(0..=i);
            forward.swap(i, j);
        }
    }

    let mut inverse = vec![0u8; n];
    for (i, &m) in forward.iter().enumerate() {
        inverse[m as usize] = i as u8;
    }
    (forward, inverse)
}

/// XOR a buffer against the 8-byte timestamp repeated
pub fn xor_with_key(data: &mut [u8], key: u64) {
    let key_bytes = key.to_le_bytes();
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key_bytes[i % 8];
    }
}

struct DumpState {
    w: BytecodeWriter,
    strip: bool,
    obf_flags: u32,
    obf_seed: u32,
    /// Rolling seed so every string map differs
    string_seed: u32,
    /// Monotonic timestamp source
    clock: u64,
    /// Registry keys handed to VM-protected prototypes
    next_proto_key: u64,
}

impl DumpState {
    fn next_timestamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn roll_string_seed(&mut self) -> u32 {
        self.string_seed = self
            .string_seed
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.string_seed
    }

    /// Byte-layer codec: raw + CRC below the threshold, PNG above
    fn write_payload(&mut self, data: &[u8]) {
        if data.len() < RAW_CODEC_THRESHOLD {
            self.w.write_u8(CODEC_RAW);
            self.w.write_size(data.len());
            self.w.write_bytes(data);
            self.w.write_u32(crc32fast::hash(data));
        } else {
            self.w.write_u8(CODEC_PNG);
            let (width, height) = super::png::dimensions(data.len());
            let mut pixels = data.to_vec();
            pixels.resize((width * height) as usize, 0);
            let png = super::png::encode(&pixels, width, height);
            self.w.write_size(width as usize);
            self.w.write_size(height as usize);
            self.w.write_size(data.len());
            self.w.write_size(png.len());
            self.w.write_bytes(&png);
        }
    }

    /// Encrypted string: per-string timestamp, 256-byte permutation map
    /// guarded by SHA-256, then the mapped+XORed bytes (PNG-wrapped for
    /// long strings, which also carry a plaintext hash)
    fn dump_string(&mut self, s: &str) {
        let bytes = s.as_bytes();
        if bytes.is_empty() {
            self.w.write_size(0);
            return;
        }
        self.w.write_size(bytes.len() + 1);

        let ts = self.next_timestamp();
        self.w.write_u64(ts);

        let map_seed = ts ^ self.roll_string_seed() as u64;
        let (map, _inverse) = opcode_permutation(256, map_seed);
        self.w.write_bytes(&map);
        let map_hash = Sha256::digest(&map);
        self.w.write_bytes(map_hash.as_slice());

        let mut encrypted: Vec<u8> = bytes.iter().map(|&b| map[b as usize]).collect();
        xor_with_key(&mut encrypted, ts);

        if bytes.len() < LONG_STRING_THRESHOLD {
            self.w.write_bytes(&encrypted);
        } else {
            let content_hash = Sha256::digest(bytes);
            self.w.write_bytes(content_hash.as_slice());

            let (width, height) = super::png::dimensions(encrypted.len());
            self.w.write_size(width as usize);
            self.w.write_size(height as usize);
            let mut pixels = encrypted;
            pixels.resize((width * height) as usize, 0);
            let png = super::png::encode(&pixels, width, height);
            self.w.write_size(png.len());
            self.w.write_bytes(&png);
        }
    }

    /// Code block: opcode layers, map hash, then the byte-layer codec
    fn dump_code(&mut self, proto: &Proto, ts: u64) {
        let (primary, primary_inv) = opcode_permutation(NUM_OPCODES, ts);
        let (secondary, _) = opcode_permutation(
            NUM_OPCODES,
            ts.wrapping_mul(1664525).wrapping_add(1013904223),
        );

        self.w.write_size(proto.code.len());
        self.w.write_bytes(&primary_inv);
        self.w.write_bytes(&secondary);

        let mut hasher = Sha256::new();
        hasher.update(&primary_inv);
        hasher.update(&secondary);
        self.w.write_bytes(hasher.finalize().as_slice());

        let mut stream = Vec::with_capacity(proto.code.len() * 8);
        for &inst in &proto.code {
            let op = instr::get_op_raw(inst) as usize;
            let mapped = secondary[primary[op] as usize];
            stream.extend_from_slice(&instr::set_op_raw(inst, mapped).to_le_bytes());
        }
        xor_with_key(&mut stream, ts);
        self.write_payload(&stream);
    }

    fn dump_constants(&mut self, proto: &Proto) {
        self.w.write_size(proto.constants.len());
        for constant in &proto.constants {
            self.w.write_u8(constant.tag());
            match constant {
                Constant::Nil | Constant::Bool(_) => {}
                Constant::Int(i) => self.w.write_i64(*i),
                Constant::Float(f) => self.w.write_f64(*f),
                Constant::Str(s) => self.dump_string(s),
            }
        }
    }

    /// Upvalue descriptors followed by the anti-import section
    fn dump_upvalues(&mut self, proto: &Proto, ts: u64, primary_inv: &[u8], secondary: &[u8]) {
        self.w.write_size(proto.upvalues.len());
        for upval in &proto.upvalues {
            self.w.write_u8(upval.in_stack as u8);
            self.w.write_u8(upval.index);
            self.w.write_u8(upval.kind);
        }

        // anti-import: decoy descriptors and keyed validation data that a
        // naive importer would trip over
        self.w.write_size(ANTI_IMPORT_MARK);
        let mut rng = StdRng::seed_from_u64(ts);
        for _ in 0..15 {
            self.w.write_u8(rng.gen_range(0..2));
            self.w.write_u8(rng.gen());
            self.w.write_u8(rng.gen_range(0..3));
        }
        let mut validation = [0u8; 16];
        for byte in validation.iter_mut() {
            *byte = rng.gen_range(1..=u8::MAX);
        }
        xor_with_key(&mut validation, ts);
        self.w.write_bytes(&validation);
        for i in 0..10 {
            let idx = i % NUM_OPCODES;
            self.w.write_u8(secondary[idx] % 2);
            self.w.write_u8(primary_inv[idx]);
            self.w.write_u8(secondary[idx] % 3);
        }
        self.w.write_bytes(Sha256::digest(ts.to_le_bytes()).as_slice());
    }

    fn dump_debug(&mut self, proto: &Proto) {
        if self.strip {
            for _ in 0..5 {
                self.w.write_size(0);
            }
            return;
        }
        self.w.write_size(proto.line_info.len());
        for &delta in &proto.line_info {
            self.w.write_u8(delta as u8);
        }
        self.w.write_size(proto.abs_lines.len());
        for abs in &proto.abs_lines {
            self.w.write_size(abs.pc as usize);
            self.w.write_size(abs.line as usize);
        }
        self.w.write_size(proto.locals.len());
        for local in &proto.locals {
            self.dump_string(&local.name);
            self.w.write_size(local.start_pc as usize);
            self.w.write_size(local.end_pc as usize);
        }
        self.w.write_size(proto.upvalues.len());
        for upval in &proto.upvalues {
            self.dump_string(&upval.name);
        }
        // decoy line-info entries
        self.w.write_size(DECOY_DEBUG_ENTRIES);
        for i in 0..DECOY_DEBUG_ENTRIES {
            self.w.write_size(i * 10);
            self.w.write_size(i * 100);
        }
    }

    fn dump_function(&mut self, proto: &mut Proto, parent_source: &str) -> Result<(), LuxError> {
        let ts = self.next_timestamp();
        self.w.write_u64(ts);

        // run the requested obfuscation passes before serialising
        if self.obf_flags & obf_mode::CFF != 0 {
            let mut log = ObfLog::disabled();
            cff::flatten(proto, self.obf_flags, self.obf_seed, &mut log)?;
            self.obf_seed = self
                .obf_seed
                .wrapping_mul(1664525)
                .wrapping_add(1013904223);
        }
        let vm_key = if self.obf_flags & obf_mode::VM_PROTECT != 0 {
            let key = self.next_proto_key;
            self.next_proto_key += 1;
            vmprotect::protect(proto, key, self.obf_seed)?;
            Some(key)
        } else {
            None
        };

        if self.strip || proto.source == parent_source {
            self.w.write_size(0);
        } else {
            let source = proto.source.clone();
            self.dump_string(&source);
        }
        self.w.write_size(proto.line_defined as usize);
        self.w.write_size(proto.last_line_defined as usize);
        self.w.write_u8(proto.num_params);
        self.w.write_u8(proto.is_vararg as u8);
        self.w.write_u8(proto.max_stack_size);
        self.w.write_u8(proto.obf_mode as u8);
        self.w.write_size(proto.obf_magic as usize);
        self.w.write_u64(proto.obf_data);

        // VM-protect sub-block
        match vm_key.and_then(vmprotect::find) {
            Some(table) => {
                self.w.write_size(1);
                self.w.write_size(table.code.len());
                self.w.write_u64(table.key);
                self.w.write_size(table.seed as usize);
                for &word in &table.code {
                    self.w.write_u64(word);
                }
                self.w.write_size(vmprotect::VM_MAP_SIZE);
                self.w.write_bytes(&table.reverse_map);
            }
            None => self.w.write_size(0),
        }

        // the upvalue anti-import section reuses the code block's maps
        let (_, primary_inv) = opcode_permutation(NUM_OPCODES, ts);
        let (secondary, _) = opcode_permutation(
            NUM_OPCODES,
            ts.wrapping_mul(1664525).wrapping_add(1013904223),
        );

        self.dump_code(proto, ts);
        self.dump_constants(proto);
        self.dump_upvalues(proto, ts, &primary_inv, &secondary);

        self.w.write_size(proto.protos.len());
        let source = proto.source.clone();
        for child in &mut proto.protos {
            self.dump_function(child, &source)?;
        }

        self.dump_debug(proto);
        Ok(())
    }

    fn dump_header(&mut self, top_upvalues: u8) {
        self.w.write_bytes(SIGNATURE);
        let low_nibble = (self.clock as u8) & 0x0F;
        self.w.write_u8(VERSION_HIGH | low_nibble);
        self.w.write_u8(FORMAT);
        self.w.write_bytes(DATA_MARKER);
        self.w.write_u8(8); // sizeof(instruction word)
        self.w.write_u8(8); // sizeof(integer)
        self.w.write_u8(8); // sizeof(number)
        self.w.write_i64(INT_PROBE);
        self.w.write_f64(NUM_PROBE);
        self.w.write_u8(top_upvalues);
    }
}

/// Serialise a prototype tree into a bytecode image.
///
/// The prototype is mutated in place when obfuscation flags request the
/// flattening or VM-protect passes, matching what the image records.
pub fn dump_proto(proto: &mut Proto, options: &DumpOptions) -> Result<Vec<u8>, LuxError> {
    let seed = if options.seed != 0 {
        options.seed
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1)
            | 1
    };
    // the timestamp source mixes the seed so distinct dumps draw
    // distinct per-proto keys
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(1)
        .wrapping_add((seed as u64) << 20);

    let mut state = DumpState {
        w: BytecodeWriter::new(),
        strip: options.strip,
        obf_flags: options.obf_flags,
        obf_seed: seed,
        string_seed: seed,
        clock,
        next_proto_key: (clock << 16) | 1,
    };

    state.dump_header(proto.upvalues.len() as u8);
    state.dump_function(proto, "")?;

    // whole-image digest trailer; the reader refuses anything tampered
    let mut image = state.w.into_bytes();
    let digest = Sha256::digest(&image);
    image.extend_from_slice(digest.as_slice());
    tracing::debug!(bytes = image.len(), "image dumped");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_bijective_over_seeds() {
        for seed in 0..200u64 {
            let (forward, inverse) = opcode_permutation(NUM_OPCODES, seed);
            for i in 0..NUM_OPCODES {
                assert_eq!(inverse[forward[i] as usize] as usize, i, "seed {seed}");
            }
        }
    }

    #[test]
    fn test_xor_is_involutive() {
        let mut data: Vec<u8> = (0..100).collect();
        let original = data.clone();
        xor_with_key(&mut data, 0x0102_0304_0506_0708);
        assert_ne!(data, original);
        xor_with_key(&mut data, 0x0102_0304_0506_0708);
        assert_eq!(data, original);
    }

    #[test]
    fn test_header_shape() {
        let mut proto = Proto::new(0, 2);
        proto.code = vec![
            instr::asbx(lux_bytecode::Opcode::LoadI, 0, 1),
            instr::abc(lux_bytecode::Opcode::Return1, 0, 0, 0),
        ];
        let image = dump_proto(&mut proto, &DumpOptions::default()).unwrap();

        assert_eq!(&image[0..4], SIGNATURE);
        // version: fixed high nibble, random low nibble
        assert_eq!(image[4] & 0xF0, VERSION_HIGH);
        assert_eq!(image[5], FORMAT);
        assert_eq!(&image[6..12], DATA_MARKER);
        assert_eq!(&image[12..15], &[8, 8, 8]);
    }

    #[test]
    fn test_dumps_differ_per_invocation() {
        let make = || {
            let mut p = Proto::new(0, 2);
            p.code = vec![
                instr::asbx(lux_bytecode::Opcode::LoadI, 0, 42),
                instr::abc(lux_bytecode::Opcode::Return1, 0, 0, 0),
            ];
            p
        };
        // different seeds produce different opcode layers even for
        // identical input
        let a = dump_proto(&mut make(), &DumpOptions { seed: 1, ..Default::default() }).unwrap();
        let b = dump_proto(&mut make(), &DumpOptions { seed: 2, ..Default::default() }).unwrap();
        assert_ne!(a, b);
    }
}
