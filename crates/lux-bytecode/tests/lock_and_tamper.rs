//! Locking and tamper-baseline semantics of the manipulation API

use lux_bytecode::api::{self, ApiError, Decoded};
use lux_bytecode::instr::{abc, asbx};
use lux_bytecode::{Opcode, Proto};

fn sample() -> Proto {
    let mut p = Proto::new(1, 4);
    p.code = vec![
        asbx(Opcode::LoadI, 1, 7),
        abc(Opcode::Add, 2, 0, 1),
        abc(Opcode::Return1, 2, 0, 0),
    ];
    p
}

#[test]
fn test_locked_proto_rejects_every_mutation() {
    let mut p = sample();
    api::mark_original(&mut p).unwrap();
    api::lock(&mut p);

    assert!(api::is_locked(&p));
    // a baseline recorded before locking, with no intervening edits,
    // reports no tampering
    assert!(!api::is_tampered(&p));

    let inst = abc(Opcode::Move, 0, 1, 0);
    assert!(matches!(
        api::set_code(&mut p, 1, inst),
        Err(ApiError::Locked { .. })
    ));
    assert!(matches!(
        api::set_instruction(
            &mut p,
            1,
            Decoded::Abc {
                op: Opcode::Move,
                a: 0,
                b: 1,
                c: 0,
                k: false
            }
        ),
        Err(ApiError::Locked { .. })
    ));

    // reads still work on a locked proto
    assert_eq!(api::code_count(&p), 3);
    assert!(api::get_code(&p, 1).is_ok());
    assert!(api::get_instruction(&p, 2).is_ok());
}

#[test]
fn test_tamper_roundtrip_through_the_api() {
    let mut p = sample();
    api::mark_original(&mut p).unwrap();
    assert!(!api::is_tampered(&p));

    // editing through the API drifts from the baseline
    api::set_code(&mut p, 1, asbx(Opcode::LoadI, 1, 8)).unwrap();
    assert!(api::is_tampered(&p));

    // restoring the original word restores the baseline hash
    api::set_code(&mut p, 1, asbx(Opcode::LoadI, 1, 7)).unwrap();
    assert!(!api::is_tampered(&p));
}

#[test]
fn test_index_errors_carry_argument_position() {
    let p = sample();
    match api::get_code(&p, 99) {
        Err(ApiError::IndexOutOfRange { arg, index, len }) => {
            assert_eq!(arg, 2);
            assert_eq!(index, 99);
            assert_eq!(len, 3);
        }
        other => panic!("expected IndexOutOfRange, got {other:?}"),
    }
}
