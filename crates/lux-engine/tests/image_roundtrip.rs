//! Full pipeline: obfuscate, serialise to an image, load it back, and
//! execute — the loaded program must behave like the original

use lux_bytecode::instr::{abc, asbck, sj};
use lux_bytecode::proto::obf_mode;
use lux_bytecode::{Constant, Opcode, Proto};

use lux_engine::interp::call_proto;
use lux_engine::obfuscate::{dump_proto, load_proto, vmprotect, DumpOptions};
use lux_engine::{State, Value};

fn abs_proto() -> Proto {
    let mut p = Proto::new(1, 2);
    p.source = "abs.lux".to_string();
    p.code = vec![
        asbck(Opcode::GtI, 0, 0, 0, false),
        sj(Opcode::Jmp, 1),
        abc(Opcode::Return1, 0, 0, 0),
        abc(Opcode::Unm, 1, 0, 0),
        abc(Opcode::Return1, 1, 0, 0),
    ];
    p.constants = vec![Constant::Str("answer".to_string()), Constant::Int(42)];
    p.line_info = vec![1, 0, 0, 1, 0];
    p
}

fn execute(proto: Proto, arg: i64) -> Option<Value> {
    let mut state = State::new();
    state.jit_off();
    let id = state.register_proto(proto);
    call_proto(&mut state, id, &[Value::Int(arg)]).unwrap()
}

#[test]
fn test_plain_image_executes_identically() {
    let image = dump_proto(&mut abs_proto(), &DumpOptions::default()).unwrap();
    let loaded = load_proto(&image).unwrap();
    lux_bytecode::verify_recursive(&loaded.proto).unwrap();

    for &input in &[9i64, -9, 0] {
        assert_eq!(execute(loaded.proto.clone(), input), execute(abs_proto(), input));
    }
}

#[test]
fn test_flattened_image_executes_identically() {
    let options = DumpOptions {
        obf_flags: obf_mode::CFF
            | obf_mode::BLOCK_SHUFFLE
            | obf_mode::BOGUS_BLOCKS
            | obf_mode::STATE_ENCODE,
        seed: 0xDEAD_BEEF,
        ..Default::default()
    };
    let mut original = abs_proto();
    let image = dump_proto(&mut original, &options).unwrap();

    let loaded = load_proto(&image).unwrap();
    // the image records the flattened form
    assert!(loaded.proto.obf_mode & obf_mode::CFF != 0);
    assert!(loaded.proto.code.len() > abs_proto().code.len());
    assert_eq!(loaded.proto.code, original.code);

    for &input in &[9i64, -9, 0] {
        assert_eq!(execute(loaded.proto.clone(), input), execute(abs_proto(), input));
    }
}

#[test]
fn test_vm_protected_image_runs_in_secondary_vm() {
    let options = DumpOptions {
        obf_flags: obf_mode::VM_PROTECT,
        seed: 0x77,
        ..Default::default()
    };
    let image = dump_proto(&mut abs_proto(), &options).unwrap();
    let loaded = load_proto(&image).unwrap();
    assert_eq!(loaded.vm_tables.len(), 1);

    let table = &loaded.vm_tables[0];
    for &input in &[3i64, -3] {
        let mut slots = vec![Value::Int(input), Value::Nil];
        let result = vmprotect::run_protected(table, &loaded.proto.constants, &mut slots).unwrap();
        assert_eq!(result, Some(Value::Int(input.abs())), "input {input}");
    }
}

#[test]
fn test_tampered_image_never_loads() {
    let image = dump_proto(&mut abs_proto(), &DumpOptions::default()).unwrap();
    // a flip anywhere in the image must be rejected
    for pos in (0..image.len()).step_by(11) {
        let mut tampered = image.clone();
        tampered[pos] ^= 0x40;
        assert!(load_proto(&tampered).is_err(), "flip at {pos} accepted");
    }
}

#[test]
fn test_stripped_image_runs_without_debug_info() {
    let options = DumpOptions {
        strip: true,
        ..Default::default()
    };
    let image = dump_proto(&mut abs_proto(), &options).unwrap();
    let loaded = load_proto(&image).unwrap();
    assert!(loaded.proto.line_info.is_empty());
    assert_eq!(execute(loaded.proto.clone(), -4), Some(Value::Int(4)));
}
