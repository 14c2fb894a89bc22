//! End-to-end JIT flow through the interpreter: hot-loop detection,
//! trace commit, native execution, and guard deoptimisation

use lux_bytecode::instr::{abc, absck, abck, asbx, sj};
use lux_bytecode::{Opcode, Proto};

use lux_engine::interp::call_proto;
use lux_engine::jit::HookAction;
use lux_engine::{State, Value};

/// function(x) while x < 1000 do x = x + 1 end return x end
///
/// ```text
/// 0: ADDI r0, r0, 1
/// 1: LOADI r1, 1000
/// 2: LT r0, r1, k=1   ; loop while x < 1000
/// 3: JMP -4           ; back to pc 0
/// 4: RETURN1 r0
/// ```
fn counting_proto() -> Proto {
    let mut p = Proto::new(1, 4);
    p.code = vec![
        absck(Opcode::AddI, 0, 0, 1, false),
        asbx(Opcode::LoadI, 1, 1000),
        abck(Opcode::Lt, 0, 1, 0, true),
        sj(Opcode::Jmp, -4),
        abc(Opcode::Return1, 0, 0, 0),
    ];
    p
}

#[test]
fn test_hot_loop_transitions_recorder() {
    // driving on_loop directly: the 56th hit flips Idle -> Recording
    let mut state = State::new();
    for _ in 0..55 {
        assert_eq!(state.jit.on_loop(3, 7), HookAction::Nothing);
    }
    assert_eq!(state.jit.on_loop(3, 7), HookAction::Record);
    assert!(state.jit.is_recording());
}

#[test]
fn test_loop_compiles_through_the_interpreter() {
    let mut state = State::new();
    let proto_id = state.register_proto(counting_proto());

    let result = call_proto(&mut state, proto_id, &[Value::Int(0)]).unwrap();
    assert_eq!(result, Some(Value::Int(1000)));

    let (enabled, stats) = state.jit_status();
    assert!(enabled);
    assert!(stats.traces >= 1, "the hot loop must have been traced");

    #[cfg(all(target_arch = "x86_64", unix))]
    {
        assert_eq!(stats.compiled, 1);
        assert!(stats.mcode_size > 0);
        assert!(stats.executions >= 1, "the compiled trace must have run");

        // committed machine code lies inside a protected block
        let trace = state.jit.find_trace(proto_id, 0).expect("trace registered");
        let mcode = trace.mcode.expect("machine code attached");
        assert!(mcode.size > 0);
        assert_eq!(
            state.jit.mcode_state(mcode.addr),
            Some(lux_engine::jit::mem::BlockState::Protected)
        );
    }
}

#[test]
fn test_guard_deopt_delivers_float_intact() {
    let mut state = State::new();
    let proto_id = state.register_proto(counting_proto());

    // warm up and compile under the "x is integer" assumption
    let warm = call_proto(&mut state, proto_id, &[Value::Int(0)]).unwrap();
    assert_eq!(warm, Some(Value::Int(1000)));

    // now call with a float: the type guard must side-exit and hand the
    // float back to the interpreter uncorrupted
    let result = call_proto(&mut state, proto_id, &[Value::Float(0.5)]).unwrap();
    assert_eq!(result, Some(Value::Float(1000.5)));
}

#[test]
fn test_disabled_jit_still_computes() {
    let mut state = State::new();
    state.jit_off();
    let proto_id = state.register_proto(counting_proto());
    let result = call_proto(&mut state, proto_id, &[Value::Int(990)]).unwrap();
    assert_eq!(result, Some(Value::Int(1000)));
    let (_, stats) = state.jit_status();
    assert_eq!(stats.traces, 0);
}

#[test]
fn test_flush_releases_traces() {
    let mut state = State::new();
    let proto_id = state.register_proto(counting_proto());
    call_proto(&mut state, proto_id, &[Value::Int(0)]).unwrap();
    assert!(state.jit_status().1.traces >= 1);

    state.jit_flush();
    assert_eq!(state.jit_status().1.mcode_size, 0);
    assert!(state.jit.find_trace(proto_id, 0).is_none());

    // the engine keeps working after a flush
    let result = call_proto(&mut state, proto_id, &[Value::Int(0)]).unwrap();
    assert_eq!(result, Some(Value::Int(1000)));
}

#[test]
fn test_opt_start_options_apply() {
    let mut state = State::new();
    state
        .jit_opt_start(&["hotloop=8", "maxtrace=2", "maxrecord=100"])
        .unwrap();
    assert_eq!(state.jit.options().hotloop, 8);

    // with the lower threshold, an 8-iteration warm-up is enough
    let proto_id = state.register_proto(counting_proto());
    call_proto(&mut state, proto_id, &[Value::Int(900)]).unwrap();
    assert!(state.jit_status().1.traces >= 1);

    assert!(state.jit_opt_start(&["bogus=1"]).is_err());
}
