//! Bytecode image reader
//!
//! Consumes what [`super::dump`] writes, inverting every layer: PNG
//! pixels back to ciphertext, timestamp XOR, the two opcode permutation
//! layers, and the per-string maps. Every SHA-256 guard is recomputed and
//! compared before the decoded content is trusted; any mismatch aborts
//! the load, so a running VM is never entered with a tampered image.

use sha2::{Digest, Sha256};

use lux_bytecode::instr;
use lux_bytecode::{AbsLine, BytecodeReader, Constant, LocalVar, Proto, UpvalDesc, NUM_OPCODES};

use crate::error::LoadError;

use super::dump::{
    xor_with_key, CODEC_PNG, CODEC_RAW, DATA_MARKER, FORMAT, INT_PROBE,
    LONG_STRING_THRESHOLD, NUM_PROBE, SIGNATURE, VERSION_HIGH,
};
use super::vmprotect::{VmCodeTable, VM_MAP_SIZE};

/// A fully decoded image
#[derive(Debug)]
pub struct LoadedImage {
    /// The reconstructed prototype tree
    pub proto: Proto,
    /// Top-level upvalue count from the header
    pub top_upvalues: u8,
    /// VM-protect tables found in the image, in prototype pre-order
    pub vm_tables: Vec<VmCodeTable>,
}

/// Validate that a byte slice is a permutation of `0..n` and return its
/// inverse
fn invert_permutation(map: &[u8], n: usize) -> Result<Vec<u8>, LoadError> {
    let mut inverse = vec![0u8; n];
    let mut seen = vec![false; n];
    for (i, &m) in map.iter().enumerate() {
        let m = m as usize;
        if m >= n || seen[m] {
            return Err(LoadError::BadField("opcode map is not a bijection"));
        }
        seen[m] = true;
        inverse[m] = i as u8;
    }
    Ok(inverse)
}

fn read_string(r: &mut BytecodeReader<'_>) -> Result<String, LoadError> {
    let size = r.read_size()?;
    if size == 0 {
        return Ok(String::new());
    }
    let len = size - 1;
    let ts = r.read_u64()?;

    let map = r.read_bytes(256)?.to_vec();
    let stored_hash = r.read_bytes(32)?;
    if Sha256::digest(&map).as_slice() != stored_hash {
        return Err(LoadError::IntegrityCheck("string map hash mismatch"));
    }
    let inverse = invert_permutation(&map, 256)?;

    let mut encrypted = if len < LONG_STRING_THRESHOLD {
        r.read_bytes(len)?.to_vec()
    } else {
        let content_hash = r.read_bytes(32)?.to_vec();
        let width = r.read_size()? as u32;
        let height = r.read_size()? as u32;
        let png_len = r.read_size()?;
        let (pixels, dw, dh) = super::png::decode(r.read_bytes(png_len)?)?;
        if (dw, dh) != (width, height) || pixels.len() < len {
            return Err(LoadError::BadImage("string image dimensions mismatch"));
        }
        let mut encrypted = pixels;
        encrypted.truncate(len);
        // decrypt, then verify the plaintext hash
        xor_with_key(&mut encrypted, ts);
        let plain: Vec<u8> = encrypted.iter().map(|&b| inverse[b as usize]).collect();
        if Sha256::digest(&plain).as_slice() != content_hash {
            return Err(LoadError::IntegrityCheck("long string content hash mismatch"));
        }
        return String::from_utf8(plain)
            .map_err(|_| LoadError::BadField("string is not valid UTF-8"));
    };

    xor_with_key(&mut encrypted, ts);
    let plain: Vec<u8> = encrypted.iter().map(|&b| inverse[b as usize]).collect();
    String::from_utf8(plain).map_err(|_| LoadError::BadField("string is not valid UTF-8"))
}

/// Read the byte-layer codec written by the dumper
fn read_payload(r: &mut BytecodeReader<'_>) -> Result<Vec<u8>, LoadError> {
    match r.read_u8()? {
        CODEC_RAW => {
            let len = r.read_size()?;
            let data = r.read_bytes(len)?.to_vec();
            let crc = r.read_u32()?;
            if crc32fast::hash(&data) != crc {
                return Err(LoadError::IntegrityCheck("raw payload CRC mismatch"));
            }
            Ok(data)
        }
        CODEC_PNG => {
            let width = r.read_size()? as u32;
            let height = r.read_size()? as u32;
            let data_len = r.read_size()?;
            let png_len = r.read_size()?;
            let (pixels, dw, dh) = super::png::decode(r.read_bytes(png_len)?)?;
            if (dw, dh) != (width, height) || pixels.len() < data_len {
                return Err(LoadError::BadImage("payload dimensions mismatch"));
            }
            let mut data = pixels;
            data.truncate(data_len);
            Ok(data)
        }
        _ => Err(LoadError::BadField("unknown payload codec")),
    }
}

fn read_code(r: &mut BytecodeReader<'_>, ts: u64) -> Result<Vec<u64>, LoadError> {
    let count = r.read_size()?;
    let primary_inv = r.read_bytes(NUM_OPCODES)?.to_vec();
    let secondary = r.read_bytes(NUM_OPCODES)?.to_vec();

    let stored_hash = r.read_bytes(32)?;
    let mut hasher = Sha256::new();
    hasher.update(&primary_inv);
    hasher.update(&secondary);
    if hasher.finalize().as_slice() != stored_hash {
        return Err(LoadError::IntegrityCheck("opcode map hash mismatch"));
    }
    // both layers must be strict bijections
    invert_permutation(&primary_inv, NUM_OPCODES)?;
    let secondary_inv = invert_permutation(&secondary, NUM_OPCODES)?;

    let mut stream = read_payload(r)?;
    if stream.len() != count * 8 {
        return Err(LoadError::BadField("code stream length mismatch"));
    }
    xor_with_key(&mut stream, ts);

    let mut code = Vec::with_capacity(count);
    for chunk in stream.chunks_exact(8) {
        let word = u64::from_le_bytes(chunk.try_into().unwrap());
        let stored_op = instr::get_op_raw(word) as usize;
        if stored_op >= NUM_OPCODES {
            return Err(LoadError::BadField("encoded opcode out of range"));
        }
        let op = primary_inv[secondary_inv[stored_op] as usize];
        code.push(instr::set_op_raw(word, op));
    }
    Ok(code)
}

fn read_constants(r: &mut BytecodeReader<'_>) -> Result<Vec<Constant>, LoadError> {
    let count = r.read_size()?;
    let mut constants = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let constant = match r.read_u8()? {
            0 => Constant::Nil,
            1 => Constant::Bool(false),
            2 => Constant::Bool(true),
            3 => Constant::Int(r.read_i64()?),
            4 => Constant::Float(r.read_f64()?),
            5 => Constant::Str(read_string(r)?),
            _ => return Err(LoadError::BadField("unknown constant tag")),
        };
        constants.push(constant);
    }
    Ok(constants)
}

fn read_upvalues(r: &mut BytecodeReader<'_>, ts: u64) -> Result<Vec<UpvalDesc>, LoadError> {
    let count = r.read_size()?;
    let mut upvalues = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let in_stack = r.read_u8()? != 0;
        let index = r.read_u8()?;
        let kind = r.read_u8()?;
        upvalues.push(UpvalDesc {
            name: String::new(),
            in_stack,
            index,
            kind,
        });
    }

    // anti-import section: marker, decoy descriptors, keyed validation
    // data, map-derived noise, and a final timestamp hash
    if r.read_size()? != 0x99 {
        return Err(LoadError::BadField("missing anti-import marker"));
    }
    r.read_bytes(15 * 3)?;
    let mut validation = r.read_bytes(16)?.to_vec();
    xor_with_key(&mut validation, ts);
    if validation.iter().any(|&b| b == 0) {
        return Err(LoadError::IntegrityCheck("anti-import validation failed"));
    }
    r.read_bytes(10 * 3)?;
    let stored = r.read_bytes(32)?;
    if Sha256::digest(ts.to_le_bytes()).as_slice() != stored {
        return Err(LoadError::IntegrityCheck("timestamp hash mismatch"));
    }
    Ok(upvalues)
}

fn read_debug(r: &mut BytecodeReader<'_>, proto: &mut Proto) -> Result<(), LoadError> {
    let line_count = r.read_size()?;
    proto.line_info = r
        .read_bytes(line_count)?
        .iter()
        .map(|&b| b as i8)
        .collect();

    let abs_count = r.read_size()?;
    proto.abs_lines = Vec::with_capacity(abs_count.min(4096));
    for _ in 0..abs_count {
        let pc = r.read_size()? as u32;
        let line = r.read_size()? as u32;
        proto.abs_lines.push(AbsLine { pc, line });
    }

    let local_count = r.read_size()?;
    proto.locals = Vec::with_capacity(local_count.min(4096));
    for _ in 0..local_count {
        let name = read_string(r)?;
        let start_pc = r.read_size()? as u32;
        let end_pc = r.read_size()? as u32;
        proto.locals.push(LocalVar {
            name,
            start_pc,
            end_pc,
        });
    }

    let name_count = r.read_size()?;
    for i in 0..name_count {
        let name = read_string(r)?;
        if let Some(upval) = proto.upvalues.get_mut(i) {
            upval.name = name;
        }
    }

    // decoy entries carry no information; their count must match what
    // the dumper emits
    let decoy_count = r.read_size()?;
    for _ in 0..decoy_count {
        r.read_size()?;
        r.read_size()?;
    }
    Ok(())
}

fn read_function(
    r: &mut BytecodeReader<'_>,
    parent_source: &str,
    vm_tables: &mut Vec<VmCodeTable>,
) -> Result<Proto, LoadError> {
    let ts = r.read_u64()?;

    let mut proto = Proto::default();
    let source = read_string(r)?;
    proto.source = if source.is_empty() {
        parent_source.to_string()
    } else {
        source
    };
    proto.line_defined = r.read_size()? as u32;
    proto.last_line_defined = r.read_size()? as u32;
    proto.num_params = r.read_u8()?;
    proto.is_vararg = r.read_u8()? != 0;
    proto.max_stack_size = r.read_u8()?;
    proto.obf_mode = r.read_u8()? as u32;
    proto.obf_magic = r.read_size()? as u32;
    proto.obf_data = r.read_u64()?;

    // VM-protect sub-block
    if r.read_size()? == 1 {
        let size = r.read_size()?;
        let key = r.read_u64()?;
        let seed = r.read_size()? as u32;
        let mut code = Vec::with_capacity(size.min(1 << 20));
        for _ in 0..size {
            code.push(r.read_u64()?);
        }
        if r.read_size()? != VM_MAP_SIZE {
            return Err(LoadError::BadField("bad VM map size"));
        }
        let map_bytes = r.read_bytes(VM_MAP_SIZE)?;
        invert_permutation(map_bytes, VM_MAP_SIZE)?;
        let mut reverse_map = [0u8; VM_MAP_SIZE];
        reverse_map.copy_from_slice(map_bytes);
        vm_tables.push(VmCodeTable {
            code,
            key,
            seed,
            reverse_map,
        });
    }

    proto.code = read_code(r, ts)?;
    proto.constants = read_constants(r)?;
    proto.upvalues = read_upvalues(r, ts)?;

    let child_count = r.read_size()?;
    proto.protos = Vec::with_capacity(child_count.min(256));
    let source = proto.source.clone();
    for _ in 0..child_count {
        proto.protos.push(read_function(r, &source, vm_tables)?);
    }

    read_debug(r, &mut proto)?;
    Ok(proto)
}

/// Decode and validate a bytecode image
pub fn load_proto(data: &[u8]) -> Result<LoadedImage, LoadError> {
    if data.len() < 4 || &data[..4] != SIGNATURE {
        return Err(LoadError::BadHeader("bad signature"));
    }
    // whole-image digest trailer: any tampering fails before parsing
    if data.len() < 4 + 32 {
        return Err(LoadError::BadHeader("image truncated"));
    }
    let (body, trailer) = data.split_at(data.len() - 32);
    if Sha256::digest(body).as_slice() != trailer {
        return Err(LoadError::IntegrityCheck("image digest mismatch"));
    }

    let mut r = BytecodeReader::new(body);

    if r.read_bytes(4)? != SIGNATURE {
        return Err(LoadError::BadHeader("bad signature"));
    }
    let version = r.read_u8()?;
    if version & 0xF0 != VERSION_HIGH {
        return Err(LoadError::BadHeader("unsupported version"));
    }
    if r.read_u8()? != FORMAT {
        return Err(LoadError::BadHeader("unsupported format"));
    }
    if r.read_bytes(DATA_MARKER.len())? != DATA_MARKER {
        return Err(LoadError::BadHeader("data marker damaged"));
    }
    if r.read_bytes(3)? != [8, 8, 8] {
        return Err(LoadError::BadHeader("size checks failed"));
    }
    if r.read_i64()? != INT_PROBE {
        return Err(LoadError::BadHeader("integer probe mismatch"));
    }
    if r.read_f64()? != NUM_PROBE {
        return Err(LoadError::BadHeader("number probe mismatch"));
    }
    let top_upvalues = r.read_u8()?;

    let mut vm_tables = Vec::new();
    let proto = read_function(&mut r, "", &mut vm_tables)?;
    tracing::debug!(
        code = proto.code.len(),
        vm_tables = vm_tables.len(),
        "image loaded"
    );
    Ok(LoadedImage {
        proto,
        top_upvalues,
        vm_tables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscate::dump::{dump_proto, DumpOptions};
    use lux_bytecode::instr::{abc, asbx};
    use lux_bytecode::Opcode;

    fn sample_proto() -> Proto {
        let mut p = Proto::new(1, 4);
        p.source = "test.lux".to_string();
        p.code = vec![
            asbx(Opcode::LoadI, 1, 42),
            abc(Opcode::Add, 2, 0, 1),
            abc(Opcode::Return1, 2, 0, 0),
        ];
        p.constants = vec![
            Constant::Nil,
            Constant::Bool(true),
            Constant::Int(-7),
            Constant::Float(2.5),
            Constant::Str("hello".to_string()),
        ];
        p.line_info = vec![0, 1, 0];
        p.upvalues = vec![UpvalDesc {
            name: "x".to_string(),
            in_stack: true,
            index: 0,
            kind: 0,
        }];
        p
    }

    #[test]
    fn test_round_trip() {
        let mut original = sample_proto();
        let image = dump_proto(&mut original.clone(), &DumpOptions::default()).unwrap();
        let loaded = load_proto(&image).unwrap();

        assert_eq!(loaded.proto.code, original.code);
        assert_eq!(loaded.proto.constants, original.constants);
        assert_eq!(loaded.proto.source, original.source);
        assert_eq!(loaded.proto.num_params, original.num_params);
        assert_eq!(loaded.proto.max_stack_size, original.max_stack_size);
        assert_eq!(loaded.proto.line_info, original.line_info);
        assert_eq!(loaded.top_upvalues, 1);
    }

    #[test]
    fn test_round_trip_with_long_string() {
        let mut p = sample_proto();
        let long: String = "abcdefgh".chars().cycle().take(5000).collect();
        p.constants.push(Constant::Str(long.clone()));
        let image = dump_proto(&mut p, &DumpOptions::default()).unwrap();
        let loaded = load_proto(&image).unwrap();
        assert!(matches!(
            loaded.proto.constants.last(),
            Some(Constant::Str(s)) if *s == long
        ));
    }

    #[test]
    fn test_round_trip_with_nested_protos() {
        let mut p = sample_proto();
        let mut child = sample_proto();
        child.source = String::new(); // inherits the parent source
        p.protos.push(child);
        let image = dump_proto(&mut p, &DumpOptions::default()).unwrap();
        let loaded = load_proto(&image).unwrap();
        assert_eq!(loaded.proto.protos.len(), 1);
        assert_eq!(loaded.proto.protos[0].source, "test.lux");
        assert_eq!(loaded.proto.protos[0].code, p.protos[0].code);
    }

    #[test]
    fn test_stripped_dump_has_no_debug_info() {
        let mut p = sample_proto();
        let image = dump_proto(
            &mut p,
            &DumpOptions {
                strip: true,
                ..Default::default()
            },
        )
        .unwrap();
        let loaded = load_proto(&image).unwrap();
        assert!(loaded.proto.line_info.is_empty());
        assert!(loaded.proto.locals.is_empty());
        assert!(loaded.proto.source.is_empty());
    }

    #[test]
    fn test_large_proto_uses_png_codec() {
        let mut p = Proto::new(0, 4);
        for i in 0..64 {
            p.code.push(asbx(Opcode::LoadI, 0, i));
        }
        p.code.push(abc(Opcode::Return0, 0, 0, 0));
        let image = dump_proto(&mut p.clone(), &DumpOptions::default()).unwrap();
        // 65 instructions = 520 bytes, beyond the raw threshold: the
        // image must embed a PNG
        assert!(image.windows(4).any(|w| w == b"IHDR"));
        let loaded = load_proto(&image).unwrap();
        assert_eq!(loaded.proto.code, p.code);
    }

    #[test]
    fn test_vm_protect_block_round_trips() {
        let mut p = sample_proto();
        let image = dump_proto(
            &mut p,
            &DumpOptions {
                obf_flags: lux_bytecode::proto::obf_mode::VM_PROTECT,
                seed: 77,
                ..Default::default()
            },
        )
        .unwrap();
        let loaded = load_proto(&image).unwrap();
        assert_eq!(loaded.vm_tables.len(), 1);
        assert!(loaded.proto.obf_mode & lux_bytecode::proto::obf_mode::VM_PROTECT != 0);
        // table code length: one word per instruction plus the halt
        assert_eq!(loaded.vm_tables[0].code.len(), loaded.proto.code.len() + 1);
    }

    #[test]
    fn test_single_bit_flip_fails_the_load() {
        let mut p = sample_proto();
        let image = dump_proto(&mut p, &DumpOptions::default()).unwrap();
        // flipping any single bit in the body must be caught by one of
        // the integrity layers
        let header_len = 4 + 1 + 1 + DATA_MARKER.len() + 3 + 8 + 8 + 1;
        let mut failures = 0;
        let mut total = 0;
        for pos in (header_len..image.len()).step_by(7) {
            let mut tampered = image.clone();
            tampered[pos] ^= 0x10;
            total += 1;
            if load_proto(&tampered).is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, total, "some bit flips went undetected");
    }

    #[test]
    fn test_bad_header_rejected() {
        let mut p = sample_proto();
        let image = dump_proto(&mut p, &DumpOptions::default()).unwrap();

        let mut bad_sig = image.clone();
        bad_sig[0] ^= 0xFF;
        assert!(matches!(
            load_proto(&bad_sig),
            Err(LoadError::BadHeader(_))
        ));

        let mut bad_probe = image.clone();
        bad_probe[15] ^= 0x01; // inside the integer probe
        assert!(load_proto(&bad_probe).is_err());

        assert!(load_proto(&[]).is_err());
    }
}
