//! Interpreter fallback
//!
//! A register-machine interpreter for the hot-path opcode subset. It is
//! the semantic baseline the JIT specialises against: loop back-edges
//! drive `on_loop`, dispatched bytecodes feed the recorder while one is
//! active, and compiled traces are entered here with deoptimisation
//! writing slot state back into the frame.

use lux_bytecode::instr::{self, Opcode};
use lux_bytecode::{Constant, Proto};

use crate::error::{LuxError, NumError};
use crate::jit::emit::TraceFrame;
use crate::jit::HookAction;
use crate::state::{intern, render_value, resolve, BigOp, State};
use crate::value::{
    BigFloatId, BigIntId, ClosureId, LongStrId, TableId, ThreadId, TypeTag, UserdataId, Value,
};

/// A closure: a prototype plus flat-captured upvalues
#[derive(Debug, Clone)]
pub struct Closure {
    pub proto_id: u32,
    pub upvalues: Vec<Value>,
}

/// Convert an interpreter value to its trace-frame representation
fn to_payload(v: &Value) -> (i64, u8) {
    match v {
        Value::Nil => (0, TypeTag::Nil as u8),
        Value::Bool(false) => (0, TypeTag::False as u8),
        Value::Bool(true) => (1, TypeTag::True as u8),
        Value::Int(i) => (*i, TypeTag::Int as u8),
        Value::Float(f) => (f.to_bits() as i64, TypeTag::Float as u8),
        Value::ShortStr(id) => (id.0 as i64, TypeTag::ShortStr as u8),
        Value::LongStr(id) => (id.0 as i64, TypeTag::LongStr as u8),
        Value::Table(id) => (id.0 as i64, TypeTag::Table as u8),
        Value::Closure(id) => (id.0 as i64, TypeTag::Closure as u8),
        Value::Userdata(id) => (id.0 as i64, TypeTag::Userdata as u8),
        Value::Thread(id) => (id.0 as i64, TypeTag::Thread as u8),
        Value::LightUserdata(p) => (*p as i64, TypeTag::LightUserdata as u8),
        Value::BigInt(id) => (id.0 as i64, TypeTag::BigInt as u8),
        Value::BigFloat(id) => (id.0 as i64, TypeTag::BigFloat as u8),
    }
}

/// Rebuild an interpreter value from its trace-frame representation
fn from_payload(payload: i64, tag: u8) -> Value {
    match tag {
        t if t == TypeTag::Nil as u8 => Value::Nil,
        t if t == TypeTag::False as u8 => Value::Bool(false),
        t if t == TypeTag::True as u8 => Value::Bool(true),
        t if t == TypeTag::Int as u8 => Value::Int(payload),
        t if t == TypeTag::Float as u8 => Value::Float(f64::from_bits(payload as u64)),
        t if t == TypeTag::ShortStr as u8 => Value::ShortStr(crate::value::StrId(payload as u32)),
        t if t == TypeTag::LongStr as u8 => Value::LongStr(LongStrId(payload as u32)),
        t if t == TypeTag::Table as u8 => Value::Table(TableId(payload as u32)),
        t if t == TypeTag::Closure as u8 => Value::Closure(ClosureId(payload as u32)),
        t if t == TypeTag::Userdata as u8 => Value::Userdata(UserdataId(payload as u32)),
        t if t == TypeTag::Thread as u8 => Value::Thread(ThreadId(payload as u32)),
        t if t == TypeTag::LightUserdata as u8 => Value::LightUserdata(payload as usize),
        t if t == TypeTag::BigInt as u8 => Value::BigInt(BigIntId(payload as u32)),
        t if t == TypeTag::BigFloat as u8 => Value::BigFloat(BigFloatId(payload as u32)),
        _ => Value::Nil,
    }
}

fn is_big(v: &Value) -> bool {
    matches!(v, Value::BigInt(_) | Value::BigFloat(_))
}

/// Arithmetic over tagged values; any big-number operand takes the
/// BigNum path
fn arith(state: &mut State, op: Opcode, lhs: Value, rhs: Value) -> Result<Value, LuxError> {
    if is_big(&lhs) || is_big(&rhs) {
        let big_op = match op {
            Opcode::Add => BigOp::Add,
            Opcode::Sub => BigOp::Sub,
            Opcode::Mul => BigOp::Mul,
            Opcode::Div => BigOp::Div,
            Opcode::Mod => BigOp::Mod,
            Opcode::Pow => BigOp::Pow,
            _ => return Err(LuxError::Arithmetic(NumError::NotANumber)),
        };
        return state.big_arith(big_op, lhs, rhs);
    }

    if op == Opcode::Div {
        if let (Value::Int(_), Value::Int(0)) = (lhs, rhs) {
            return Err(LuxError::Arithmetic(NumError::DivideByZero));
        }
    }

    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(match op {
            Opcode::Add => Value::Int(a.wrapping_add(b)),
            Opcode::Sub => Value::Int(a.wrapping_sub(b)),
            Opcode::Mul => Value::Int(a.wrapping_mul(b)),
            Opcode::Div => Value::Int(a.wrapping_div(b)),
            Opcode::Mod => {
                if b == 0 {
                    return Err(LuxError::Arithmetic(NumError::DivideByZero));
                }
                Value::Int(((a % b) + b) % b)
            }
            Opcode::Pow => {
                if b >= 0 {
                    Value::Int(a.wrapping_pow(b.min(u32::MAX as i64) as u32))
                } else {
                    Value::Float((a as f64).powf(b as f64))
                }
            }
            _ => return Err(LuxError::Arithmetic(NumError::NotANumber)),
        }),
        (lhs, rhs) => match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => Ok(match op {
                Opcode::Add => Value::Float(a + b),
                Opcode::Sub => Value::Float(a - b),
                Opcode::Mul => Value::Float(a * b),
                Opcode::Div => Value::Float(a / b),
                Opcode::Mod => Value::Float(a - (a / b).floor() * b),
                Opcode::Pow => Value::Float(a.powf(b)),
                _ => return Err(LuxError::Arithmetic(NumError::NotANumber)),
            }),
            _ => Err(LuxError::Arithmetic(NumError::NotANumber)),
        },
    }
}

/// Equality across the numeric tower
fn values_equal(state: &State, a: &Value, b: &Value) -> bool {
    if is_big(a) || is_big(b) {
        return state
            .big_compare(*a, *b)
            .map(|o| o == std::cmp::Ordering::Equal)
            .unwrap_or(false);
    }
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        _ => a == b,
    }
}

fn values_less(state: &State, a: &Value, b: &Value, or_equal: bool) -> Result<bool, LuxError> {
    if is_big(a) || is_big(b) {
        let ord = state.big_compare(*a, *b)?;
        return Ok(if or_equal {
            ord != std::cmp::Ordering::Greater
        } else {
            ord == std::cmp::Ordering::Less
        });
    }
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => Ok(if or_equal { x <= y } else { x < y }),
        _ => match (a, b) {
            (Value::ShortStr(x), Value::ShortStr(y)) => {
                let (x, y) = (resolve(*x), resolve(*y));
                Ok(if or_equal { x <= y } else { x < y })
            }
            _ => Err(LuxError::Runtime("attempt to compare incompatible values".into())),
        },
    }
}

/// Run a compiled trace over the current frame, then deoptimise back to
/// the snapshot pc
fn run_compiled(state: &mut State, trace_id: u32, regs: &mut [Value]) -> Option<u32> {
    let mut payloads: Vec<i64> = Vec::with_capacity(regs.len());
    let mut tags: Vec<u8> = Vec::with_capacity(regs.len());
    for reg in regs.iter() {
        let (p, t) = to_payload(reg);
        payloads.push(p);
        tags.push(t);
    }
    let mut frame = TraceFrame {
        payloads: payloads.as_mut_ptr(),
        tags: tags.as_mut_ptr(),
        nslots: regs.len(),
    };
    let exit = state.jit.run_trace(trace_id, &mut frame)?;
    let resume = state.jit.deoptimize(trace_id, exit, &mut frame)?;
    for (i, reg) in regs.iter_mut().enumerate() {
        *reg = from_payload(payloads[i], tags[i]);
    }
    Some(resume)
}

/// Invoke a registered prototype directly (no upvalues)
pub fn call_proto(state: &mut State, proto_id: u32, args: &[Value]) -> Result<Option<Value>, LuxError> {
    run(state, proto_id, Vec::new(), args)
}

/// Invoke a closure value
pub fn call_closure(
    state: &mut State,
    closure: ClosureId,
    args: &[Value],
) -> Result<Option<Value>, LuxError> {
    let c = state.closures.get(closure.0).clone();
    run(state, c.proto_id, c.upvalues, args)
}

fn run(
    state: &mut State,
    proto_id: u32,
    mut upvalues: Vec<Value>,
    args: &[Value],
) -> Result<Option<Value>, LuxError> {
    // prototypes are immutable while executing; a private copy keeps the
    // borrow on `state` free for the dispatch loop
    let proto = state.proto(proto_id).clone();

    // heat the call site; entry traces are picked up at the first
    // back-edge below
    state.jit.on_call(proto_id);

    let mut regs = vec![Value::Nil; (proto.max_stack_size as usize).max(args.len())];
    regs[..args.len()].copy_from_slice(args);

    let mut pc: usize = 0;
    loop {
        if pc >= proto.code.len() {
            return Err(LuxError::Runtime("instruction pointer ran off the end".into()));
        }
        if state.jit.is_recording() {
            state.jit.record(&proto, pc as u32, &regs);
        }

        let inst = proto.code[pc];
        let op = instr::get_opcode(inst)
            .ok_or_else(|| LuxError::Runtime(format!("invalid opcode at pc {pc}")))?;
        pc += 1;

        let a = instr::get_a(inst) as usize;
        match op {
            Opcode::Nop => {}
            Opcode::Move => regs[a] = regs[instr::get_b(inst) as usize],
            Opcode::LoadI => regs[a] = Value::Int(instr::get_sbx(inst)),
            Opcode::LoadF => regs[a] = Value::Float(instr::get_sbx(inst) as f64),
            Opcode::LoadK => {
                let constant = proto
                    .constants
                    .get(instr::get_bx(inst) as usize)
                    .ok_or_else(|| LuxError::Runtime("constant index out of range".into()))?;
                regs[a] = match constant {
                    Constant::Nil => Value::Nil,
                    Constant::Bool(b) => Value::Bool(*b),
                    Constant::Int(i) => Value::Int(*i),
                    Constant::Float(f) => Value::Float(*f),
                    Constant::Str(s) => Value::ShortStr(intern(s)),
                };
            }
            Opcode::LoadTrue => regs[a] = Value::Bool(true),
            Opcode::LoadFalse => regs[a] = Value::Bool(false),
            Opcode::LoadNil => {
                let count = instr::get_b(inst) as usize + 1;
                for reg in regs.iter_mut().skip(a).take(count) {
                    *reg = Value::Nil;
                }
            }
            Opcode::GetUpval => {
                regs[a] = upvalues
                    .get(instr::get_b(inst) as usize)
                    .copied()
                    .unwrap_or(Value::Nil);
            }
            Opcode::SetUpval => {
                let value = regs[instr::get_b(inst) as usize];
                if let Some(upval) = upvalues.get_mut(a) {
                    *upval = value;
                }
            }
            Opcode::GetTable | Opcode::GetI | Opcode::GetField => {
                let table = match regs[instr::get_b(inst) as usize] {
                    Value::Table(id) => id,
                    other => {
                        return Err(LuxError::Runtime(format!(
                            "attempt to index a {} value",
                            other.tag().name()
                        )))
                    }
                };
                let key = match op {
                    Opcode::GetTable => regs[instr::get_c(inst) as usize],
                    Opcode::GetI => Value::Int(instr::get_c(inst) as i64),
                    _ => match proto.constants.get(instr::get_c(inst) as usize) {
                        Some(Constant::Str(s)) => Value::ShortStr(intern(s)),
                        _ => return Err(LuxError::Runtime("bad field constant".into())),
                    },
                };
                regs[a] = state.table_get(table, key)?;
            }
            Opcode::SetTable | Opcode::SetI | Opcode::SetField => {
                let table = match regs[a] {
                    Value::Table(id) => id,
                    other => {
                        return Err(LuxError::Runtime(format!(
                            "attempt to index a {} value",
                            other.tag().name()
                        )))
                    }
                };
                let key = match op {
                    Opcode::SetTable => regs[instr::get_b(inst) as usize],
                    Opcode::SetI => Value::Int(instr::get_b(inst) as i64),
                    _ => match proto.constants.get(instr::get_b(inst) as usize) {
                        Some(Constant::Str(s)) => Value::ShortStr(intern(s)),
                        _ => return Err(LuxError::Runtime("bad field constant".into())),
                    },
                };
                let value = regs[instr::get_c(inst) as usize];
                state.table_set(table, key, value)?;
            }
            Opcode::NewTable => regs[a] = Value::Table(state.new_table()),
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let lhs = regs[instr::get_b(inst) as usize];
                let rhs = regs[instr::get_c(inst) as usize];
                regs[a] = arith(state, op, lhs, rhs)?;
            }
            Opcode::AddI => {
                let lhs = regs[instr::get_b(inst) as usize];
                let imm = Value::Int(instr::get_sc(inst) as i64);
                regs[a] = arith(state, Opcode::Add, lhs, imm)?;
            }
            Opcode::Unm => {
                regs[a] = match regs[instr::get_b(inst) as usize] {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    v if is_big(&v) => {
                        let zero = Value::Int(0);
                        arith(state, Opcode::Sub, zero, v)?
                    }
                    other => {
                        return Err(LuxError::Runtime(format!(
                            "attempt to negate a {} value",
                            other.tag().name()
                        )))
                    }
                };
            }
            Opcode::Not => {
                let truthy = regs[instr::get_b(inst) as usize].is_truthy();
                regs[a] = Value::Bool(!truthy);
            }
            Opcode::Len => {
                regs[a] = match regs[instr::get_b(inst) as usize] {
                    Value::Table(id) => Value::Int(state.table_len(id) as i64),
                    Value::ShortStr(id) => Value::Int(resolve(id).len() as i64),
                    other => {
                        return Err(LuxError::Runtime(format!(
                            "attempt to get length of a {} value",
                            other.tag().name()
                        )))
                    }
                };
            }
            Opcode::BAnd | Opcode::BOr | Opcode::BXor | Opcode::Shl | Opcode::Shr => {
                let lhs = regs[instr::get_b(inst) as usize]
                    .as_int()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                let rhs = regs[instr::get_c(inst) as usize]
                    .as_int()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                regs[a] = Value::Int(match op {
                    Opcode::BAnd => lhs & rhs,
                    Opcode::BOr => lhs | rhs,
                    Opcode::BXor => lhs ^ rhs,
                    Opcode::Shl => lhs.wrapping_shl(rhs as u32 & 63),
                    Opcode::Shr => ((lhs as u64).wrapping_shr(rhs as u32 & 63)) as i64,
                    _ => unreachable!(),
                });
            }
            Opcode::BNot => {
                let v = regs[instr::get_b(inst) as usize]
                    .as_int()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                regs[a] = Value::Int(!v);
            }
            Opcode::Concat => {
                let count = instr::get_b(inst) as usize;
                let mut out = String::new();
                for reg in regs.iter().skip(a).take(count) {
                    match reg {
                        Value::ShortStr(id) => out.push_str(&resolve(*id)),
                        Value::Int(i) => out.push_str(&i.to_string()),
                        Value::Float(f) => out.push_str(&f.to_string()),
                        other => {
                            return Err(LuxError::Runtime(format!(
                                "attempt to concatenate a {} value",
                                other.tag().name()
                            )))
                        }
                    }
                }
                regs[a] = Value::ShortStr(intern(&out));
            }
            Opcode::Jmp => {
                let offset = instr::get_sj(inst);
                let target = (pc as i64 + offset) as usize;
                if offset < 0 {
                    // loop back-edge: heat the site, run or record
                    match state.jit.on_loop(proto_id, target as u32) {
                        HookAction::Execute(id) => {
                            if let Some(resume) = run_compiled(state, id, &mut regs) {
                                pc = resume as usize;
                                continue;
                            }
                        }
                        HookAction::Record | HookAction::Nothing => {}
                    }
                }
                pc = target;
            }
            Opcode::Eq | Opcode::Lt | Opcode::Le | Opcode::EqK | Opcode::EqI | Opcode::LtI
            | Opcode::LeI | Opcode::GtI | Opcode::GeI | Opcode::Test => {
                let k = instr::get_k(inst);
                let value = regs[a];
                let result = match op {
                    Opcode::Test => value.is_truthy(),
                    Opcode::Eq => {
                        let rhs = regs[instr::get_b(inst) as usize];
                        values_equal(state, &value, &rhs)
                    }
                    Opcode::Lt => {
                        let rhs = regs[instr::get_b(inst) as usize];
                        values_less(state, &value, &rhs, false)?
                    }
                    Opcode::Le => {
                        let rhs = regs[instr::get_b(inst) as usize];
                        values_less(state, &value, &rhs, true)?
                    }
                    Opcode::EqK => {
                        let rhs = match proto.constants.get(instr::get_b(inst) as usize) {
                            Some(Constant::Int(i)) => Value::Int(*i),
                            Some(Constant::Float(f)) => Value::Float(*f),
                            Some(Constant::Bool(b)) => Value::Bool(*b),
                            Some(Constant::Nil) => Value::Nil,
                            Some(Constant::Str(s)) => Value::ShortStr(intern(s)),
                            None => Value::Nil,
                        };
                        values_equal(state, &value, &rhs)
                    }
                    _ => {
                        let imm = instr::get_sb(inst) as i64;
                        let x = value
                            .as_int()
                            .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                        match op {
                            Opcode::EqI => x == imm,
                            Opcode::LtI => x < imm,
                            Opcode::LeI => x <= imm,
                            Opcode::GtI => x > imm,
                            Opcode::GeI => x >= imm,
                            _ => unreachable!(),
                        }
                    }
                };
                // the test skips the following jump when it disagrees
                if result != k {
                    pc += 1;
                }
            }
            Opcode::Call => {
                let callee = regs[a];
                let argc = instr::get_b(inst) as usize;
                let argv: Vec<Value> = regs[a + 1..a + argc.max(1)].to_vec();
                let result = match callee {
                    Value::Closure(id) => call_closure(state, id, &argv)?,
                    other => {
                        return Err(LuxError::Runtime(format!(
                            "attempt to call a {} value",
                            other.tag().name()
                        )))
                    }
                };
                let nresults = instr::get_c(inst) as usize;
                if nresults >= 2 {
                    regs[a] = result.unwrap_or(Value::Nil);
                }
            }
            Opcode::TailCall => {
                let callee = regs[a];
                let argc = instr::get_b(inst) as usize;
                let argv: Vec<Value> = regs[a + 1..a + argc.max(1)].to_vec();
                return match callee {
                    Value::Closure(id) => call_closure(state, id, &argv),
                    other => Err(LuxError::Runtime(format!(
                        "attempt to call a {} value",
                        other.tag().name()
                    ))),
                };
            }
            Opcode::Return0 => return Ok(None),
            Opcode::Return1 => return Ok(Some(regs[a])),
            Opcode::Return => {
                let count = instr::get_b(inst) as usize;
                return Ok(if count >= 2 { Some(regs[a]) } else { None });
            }
            Opcode::ForPrep => {
                let init = regs[a]
                    .as_float()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                let limit = regs[a + 1]
                    .as_float()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                let step = regs[a + 2]
                    .as_float()
                    .ok_or(LuxError::Arithmetic(NumError::NotANumber))?;
                if step == 0.0 {
                    return Err(LuxError::Runtime("'for' step is zero".into()));
                }
                let runs = if step > 0.0 { init <= limit } else { init >= limit };
                if runs {
                    regs[a + 3] = regs[a];
                } else {
                    pc += instr::get_bx(inst) as usize + 1;
                }
            }
            Opcode::ForLoop => {
                let next = arith(state, Opcode::Add, regs[a], regs[a + 2])?;
                let limit = regs[a + 1];
                let step_positive = regs[a + 2].as_float().unwrap_or(1.0) > 0.0;
                let continues = if step_positive {
                    values_less(state, &next, &limit, true)?
                } else {
                    values_less(state, &limit, &next, true)?
                };
                if continues {
                    regs[a] = next;
                    regs[a + 3] = next;
                    let back = instr::get_bx(inst) as usize;
                    // numeric loops are also trace candidates
                    let target = pc - 1 - back;
                    match state.jit.on_loop(proto_id, target as u32) {
                        HookAction::Execute(id) => {
                            if let Some(resume) = run_compiled(state, id, &mut regs) {
                                pc = resume as usize;
                                continue;
                            }
                        }
                        HookAction::Record | HookAction::Nothing => {}
                    }
                    pc = target;
                }
            }
            Opcode::Closure => {
                let child_index = instr::get_bx(inst) as usize;
                let child = proto
                    .protos
                    .get(child_index)
                    .ok_or_else(|| LuxError::Runtime("closure index out of range".into()))?
                    .clone();
                // flat capture: upvalues are copied at closure creation
                let mut captured = Vec::with_capacity(child.upvalues.len());
                for desc in &child.upvalues {
                    let v = if desc.in_stack {
                        regs.get(desc.index as usize).copied().unwrap_or(Value::Nil)
                    } else {
                        upvalues.get(desc.index as usize).copied().unwrap_or(Value::Nil)
                    };
                    captured.push(v);
                }
                let child_id = state.register_proto(child);
                let closure = state.closures.alloc(Closure {
                    proto_id: child_id,
                    upvalues: captured,
                });
                regs[a] = Value::Closure(ClosureId(closure));
            }
        }
    }
}

/// Render a value for host display
pub fn display_value(state: &State, v: &Value) -> String {
    match v {
        Value::BigInt(_) | Value::BigFloat(_) => {
            state.big_to_string(*v).unwrap_or_else(|_| render_value(v))
        }
        other => render_value(other),
    }
}
