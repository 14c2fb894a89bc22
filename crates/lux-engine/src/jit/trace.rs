//! Hotness detection and the trace recorder
//!
//! Hotness uses three parallel 64-entry counter tables (loop back-edges,
//! calls, side exits) indexed by a pc hash. A counter that reaches its
//! threshold resets to zero — so the site cannot immediately re-fire — and
//! reports hot.
//!
//! The recorder is a small state machine: `Idle -> Recording -> (Done |
//! Abort)`. While recording, every dispatched bytecode appends one or more
//! IR instructions; observed operand values drive type guards, and a
//! snapshot is captured before every guard so a failing run can be
//! deoptimised back to the interpreter. Returning to the start pc closes
//! the loop and the trace commits.

use lux_bytecode::instr::{self, Opcode};
use lux_bytecode::{Constant, Proto};

use crate::jit::ir::IrBuilder;
use crate::jit::types::{
    AbortReason, IrOp, IrRef, IrType, SideExit, SnapSlot, Snapshot, Trace,
};
use crate::value::Value;

/// Counter-table size; the pc hash is masked to this many entries
pub const HOTCOUNT_SIZE: usize = 64;
const HOTCOUNT_MASK: u32 = 0x3F;

/// Default loop-counter trigger threshold
pub const DEFAULT_HOTLOOP: u16 = 56;
/// Default call-counter trigger threshold
pub const DEFAULT_HOTCALL: u16 = 100;
/// Default side-exit trigger threshold
pub const DEFAULT_HOTEXIT: u16 = 10;

/// Three parallel hot-site counter tables
pub struct HotCounts {
    loops: [u16; HOTCOUNT_SIZE],
    calls: [u16; HOTCOUNT_SIZE],
    exits: [u16; HOTCOUNT_SIZE],
    pub hotloop: u16,
    pub hotcall: u16,
    pub hotexit: u16,
}

#[inline]
fn hash_pc(proto_id: u32, pc: u32) -> usize {
    let h = (pc ^ proto_id.rotate_left(16)).wrapping_mul(2654435761);
    (h & HOTCOUNT_MASK) as usize
}

impl HotCounts {
    pub fn new() -> Self {
        HotCounts {
            loops: [0; HOTCOUNT_SIZE],
            calls: [0; HOTCOUNT_SIZE],
            exits: [0; HOTCOUNT_SIZE],
            hotloop: DEFAULT_HOTLOOP,
            hotcall: DEFAULT_HOTCALL,
            hotexit: DEFAULT_HOTEXIT,
        }
    }

    /// Clear every counter
    pub fn reset(&mut self) {
        self.loops = [0; HOTCOUNT_SIZE];
        self.calls = [0; HOTCOUNT_SIZE];
        self.exits = [0; HOTCOUNT_SIZE];
    }

    fn tick(slot: &mut u16, threshold: u16) -> bool {
        *slot += 1;
        if *slot >= threshold {
            *slot = 0;
            true
        } else {
            false
        }
    }

    /// Count a loop back-edge; true when the site just became hot
    pub fn tick_loop(&mut self, proto_id: u32, pc: u32) -> bool {
        Self::tick(&mut self.loops[hash_pc(proto_id, pc)], self.hotloop)
    }

    /// Count a call; true when the site just became hot
    pub fn tick_call(&mut self, proto_id: u32, pc: u32) -> bool {
        Self::tick(&mut self.calls[hash_pc(proto_id, pc)], self.hotcall)
    }

    /// Count a side exit; true when the exit just became hot
    pub fn tick_exit(&mut self, trace_id: u32, exit: u32) -> bool {
        Self::tick(&mut self.exits[hash_pc(trace_id, exit)], self.hotexit)
    }
}

impl Default for HotCounts {
    fn default() -> Self {
        Self::new()
    }
}

/// Recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Recording,
    Done,
    Abort,
}

/// Outcome of recording one dispatched bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Keep feeding instructions
    Continue,
    /// The trace closed its loop and is ready to commit
    LoopClosed,
    /// The trace ended at a return and is ready to commit
    Returned,
    /// Recording was abandoned
    Aborted(AbortReason),
}

/// Recorder limits, mirrored from the engine configuration
#[derive(Debug, Clone, Copy)]
pub struct RecordLimits {
    pub max_record: u32,
    pub max_depth: u32,
    pub max_irconst: usize,
    pub max_ir: usize,
    pub max_side: usize,
    pub max_snap: usize,
}

impl Default for RecordLimits {
    fn default() -> Self {
        RecordLimits {
            max_record: 4000,
            max_depth: 8,
            max_irconst: 4096,
            max_ir: 16384,
            max_side: 100,
            max_snap: 500,
        }
    }
}

/// The trace recorder
pub struct TraceRecorder {
    pub state: RecordState,
    pub abort_reason: Option<AbortReason>,
    builder: IrBuilder,
    limits: RecordLimits,

    proto_id: u32,
    start_pc: u32,
    cur_pc: u32,
    bc_count: u32,
    depth: u32,

    /// Current IR value per interpreter slot
    slot_refs: Vec<Option<IrRef>>,
    /// Type observed when the slot was first loaded
    slot_types: Vec<IrType>,

    snapshots: Vec<Snapshot>,
    exits: Vec<SideExit>,
}

fn observed_type(v: &Value) -> IrType {
    match v {
        Value::Nil => IrType::Nil,
        Value::Bool(false) => IrType::False,
        Value::Bool(true) => IrType::True,
        Value::Int(_) => IrType::Int,
        Value::Float(_) => IrType::Num,
        Value::ShortStr(_) | Value::LongStr(_) => IrType::Str,
        Value::Table(_) => IrType::Tab,
        Value::Closure(_) => IrType::Func,
        _ => IrType::Unknown,
    }
}

impl TraceRecorder {
    pub fn new(limits: RecordLimits) -> Self {
        TraceRecorder {
            state: RecordState::Idle,
            abort_reason: None,
            builder: IrBuilder::new(limits.max_ir, limits.max_irconst),
            limits,
            proto_id: 0,
            start_pc: 0,
            cur_pc: 0,
            bc_count: 0,
            depth: 0,
            slot_refs: Vec::new(),
            slot_types: Vec::new(),
            snapshots: Vec::new(),
            exits: Vec::new(),
        }
    }

    /// Begin recording at `(proto_id, pc)`
    pub fn start(&mut self, proto_id: u32, pc: u32, limits: RecordLimits) {
        self.limits = limits;
        self.builder.set_limits(limits.max_ir, limits.max_irconst);
        self.builder.reset();
        self.state = RecordState::Recording;
        self.abort_reason = None;
        self.proto_id = proto_id;
        self.start_pc = pc;
        self.cur_pc = pc;
        self.bc_count = 0;
        self.depth = 0;
        self.slot_refs.clear();
        self.slot_types.clear();
        self.snapshots.clear();
        self.exits.clear();
        tracing::debug!(proto_id, pc, "trace recording started");
    }

    /// Abandon the recording with a tagged reason; any partial trace
    /// state is dropped
    pub fn abort(&mut self, reason: AbortReason) -> RecordOutcome {
        tracing::debug!(?reason, "trace recording aborted");
        self.state = RecordState::Abort;
        self.abort_reason = Some(reason);
        RecordOutcome::Aborted(reason)
    }

    /// Back to idle after an abort or commit
    pub fn reset(&mut self) {
        self.state = RecordState::Idle;
        self.abort_reason = None;
    }

    /// Where recording started
    pub fn start_location(&self) -> (u32, u32) {
        (self.proto_id, self.start_pc)
    }

    /// Call-inline depth bookkeeping for `on_call` / `on_return`
    pub fn enter_call(&mut self) -> Result<(), AbortReason> {
        self.depth += 1;
        if self.depth > self.limits.max_depth {
            Err(AbortReason::MaxDepth)
        } else {
            Ok(())
        }
    }

    /// Returns true when the return pops past the recording root, which
    /// ends the trace
    pub fn leave_call(&mut self) -> bool {
        if self.depth == 0 {
            true
        } else {
            self.depth -= 1;
            false
        }
    }

    fn ensure_slots(&mut self, n: usize) {
        if self.slot_refs.len() < n {
            self.slot_refs.resize(n, None);
            self.slot_types.resize(n, IrType::Unknown);
        }
    }

    /// IR value for a slot, loading and type-guarding it on first use
    fn slot_ref(&mut self, slot: u16, observed: &Value) -> Result<IrRef, AbortReason> {
        self.ensure_slots(slot as usize + 1);
        if let Some(r) = self.slot_refs[slot as usize] {
            return Ok(r);
        }
        let ty = observed_type(observed);
        let slot_key = self
            .builder
            .kint(slot as i64)
            .map_err(|_| AbortReason::SideExit)?;
        let load = self
            .builder
            .emit1(IrOp::Load, ty, slot_key)
            .map_err(|_| AbortReason::SideExit)?;
        let guard_op = match ty {
            IrType::Int => Some(IrOp::GuardInt),
            IrType::Num => Some(IrOp::GuardNum),
            IrType::Str => Some(IrOp::GuardStr),
            IrType::Tab => Some(IrOp::GuardTab),
            IrType::Func => Some(IrOp::GuardFunc),
            IrType::Nil => Some(IrOp::GuardNil),
            _ => Some(IrOp::GuardType),
        };
        if let Some(op) = guard_op {
            self.snapshot_here()?;
            self.builder
                .emit1(op, ty, load)
                .map_err(|_| AbortReason::SideExit)?;
        }
        self.slot_refs[slot as usize] = Some(load);
        self.slot_types[slot as usize] = ty;
        Ok(load)
    }

    /// Bind a slot to a new IR value and emit the write-back store.
    /// Eager stores keep the frame canonical, so deoptimisation only has
    /// to resume at the snapshot pc.
    fn set_slot(&mut self, slot: u16, value: IrRef, ty: IrType) -> Result<(), AbortReason> {
        self.ensure_slots(slot as usize + 1);
        let slot_key = self
            .builder
            .kint(slot as i64)
            .map_err(|_| AbortReason::SideExit)?;
        self.builder
            .emit2(IrOp::Store, ty, slot_key, value)
            .map_err(|_| AbortReason::SideExit)?;
        self.slot_refs[slot as usize] = Some(value);
        self.slot_types[slot as usize] = ty;
        Ok(())
    }

    /// Capture a snapshot of the live slot bindings at `self.cur_pc`
    fn snapshot_at(&mut self, pc: u32) -> Result<u16, AbortReason> {
        if self.snapshots.len() >= self.limits.max_snap
            || self.exits.len() >= self.limits.max_side
        {
            return Err(AbortReason::SideExit);
        }
        let slots: Vec<SnapSlot> = self
            .slot_refs
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                r.map(|ir| SnapSlot {
                    slot: i as u16,
                    ir,
                    ty: self.slot_types[i],
                })
            })
            .collect();
        let index = self.snapshots.len() as u16;
        self.snapshots.push(Snapshot { pc, slots });
        self.exits.push(SideExit {
            pc,
            snapshot: index,
        });
        // the Snapshot op carries the table index in op1 (not an IrRef)
        self.builder
            .emit1(IrOp::Snapshot, IrType::Nil, index)
            .map_err(|_| AbortReason::SideExit)?;
        Ok(index)
    }

    fn snapshot_here(&mut self) -> Result<u16, AbortReason> {
        self.snapshot_at(self.cur_pc)
    }

    /// Record one dispatched bytecode. `slots` is the active frame's
    /// register window, observed *before* the instruction executes.
    pub fn record(&mut self, proto: &Proto, pc: u32, slots: &[Value]) -> RecordOutcome {
        debug_assert_eq!(self.state, RecordState::Recording);

        if self.bc_count > 0 && pc == self.start_pc && self.depth == 0 {
            return self.close_loop();
        }
        self.bc_count += 1;
        if self.bc_count > self.limits.max_record {
            return self.abort(AbortReason::MaxIns);
        }
        self.cur_pc = pc;

        let inst = match proto.code.get(pc as usize) {
            Some(&i) => i,
            None => return self.abort(AbortReason::BadInstr),
        };
        let op = match instr::get_opcode(inst) {
            Some(op) => op,
            None => return self.abort(AbortReason::BadInstr),
        };

        match self.record_ins(proto, op, inst, slots) {
            Ok(true) => RecordOutcome::Continue,
            Ok(false) => {
                // a return at depth 0 ends the trace; it exits through a
                // final snapshot so the interpreter resumes at the return
                if let Err(reason) = self.snapshot_at(pc) {
                    return self.abort(reason);
                }
                match self.builder.emit0(IrOp::Ret, IrType::Nil) {
                    Ok(_) => {
                        self.state = RecordState::Done;
                        RecordOutcome::Returned
                    }
                    Err(_) => self.abort(AbortReason::SideExit),
                }
            }
            Err(reason) => self.abort(reason),
        }
    }

    fn close_loop(&mut self) -> RecordOutcome {
        match self.builder.emit0(IrOp::Loop, IrType::Nil) {
            Ok(_) => {
                self.state = RecordState::Done;
                tracing::debug!(ir = self.builder.len(), "trace loop closed");
                RecordOutcome::LoopClosed
            }
            Err(_) => self.abort(AbortReason::SideExit),
        }
    }

    /// Record a single instruction. `Ok(true)` continues, `Ok(false)`
    /// signals a depth-0 return.
    fn record_ins(
        &mut self,
        proto: &Proto,
        op: Opcode,
        inst: u64,
        slots: &[Value],
    ) -> Result<bool, AbortReason> {
        use Opcode::*;

        let a = instr::get_a(inst);
        let b = instr::get_b(inst);
        let c = instr::get_c(inst);

        let observe = |slot: u16| slots.get(slot as usize).copied().unwrap_or(Value::Nil);

        match op {
            Nop => {}
            Move => {
                let src = self.slot_ref(b, &observe(b))?;
                let ty = self.slot_types[b as usize];
                self.set_slot(a, src, ty)?;
            }
            LoadI => {
                let k = self
                    .builder
                    .kint(instr::get_sbx(inst))
                    .map_err(|_| AbortReason::SideExit)?;
                self.set_slot(a, k, IrType::Int)?;
            }
            LoadF => {
                let k = self
                    .builder
                    .knum(instr::get_sbx(inst) as f64)
                    .map_err(|_| AbortReason::SideExit)?;
                self.set_slot(a, k, IrType::Num)?;
            }
            LoadK => {
                let idx = instr::get_bx(inst) as usize;
                let (k, ty) = match proto.constants.get(idx) {
                    Some(Constant::Int(i)) => (
                        self.builder.kint(*i).map_err(|_| AbortReason::SideExit)?,
                        IrType::Int,
                    ),
                    Some(Constant::Float(f)) => (
                        self.builder.knum(*f).map_err(|_| AbortReason::SideExit)?,
                        IrType::Num,
                    ),
                    // strings and other constants are not traced yet
                    _ => return Err(AbortReason::Nyi),
                };
                self.set_slot(a, k, ty)?;
            }
            LoadTrue | LoadFalse => {
                let k = self
                    .builder
                    .kint((op == LoadTrue) as i64)
                    .map_err(|_| AbortReason::SideExit)?;
                let ty = if op == LoadTrue {
                    IrType::True
                } else {
                    IrType::False
                };
                self.set_slot(a, k, ty)?;
            }
            Add | Sub | Mul | Div | Mod | BAnd | BOr | BXor | Shl | Shr => {
                self.record_arith(op, a, b, c, &observe(b), &observe(c))?;
            }
            AddI => {
                let vb = observe(b);
                let lhs = self.slot_ref(b, &vb)?;
                let imm = instr::get_sc(inst) as i64;
                match observed_type(&vb) {
                    IrType::Int => {
                        let k = self.builder.kint(imm).map_err(|_| AbortReason::SideExit)?;
                        let r = self
                            .builder
                            .emit2(IrOp::AddInt, IrType::Int, lhs, k)
                            .map_err(|_| AbortReason::SideExit)?;
                        self.set_slot(a, r, IrType::Int)?;
                    }
                    IrType::Num => {
                        let k = self
                            .builder
                            .knum(imm as f64)
                            .map_err(|_| AbortReason::SideExit)?;
                        let r = self
                            .builder
                            .emit2(IrOp::AddNum, IrType::Num, lhs, k)
                            .map_err(|_| AbortReason::SideExit)?;
                        self.set_slot(a, r, IrType::Num)?;
                    }
                    _ => return Err(AbortReason::TypeUnstable),
                }
            }
            Unm => {
                let vb = observe(b);
                let src = self.slot_ref(b, &vb)?;
                let (irop, ty) = match observed_type(&vb) {
                    IrType::Int => (IrOp::NegInt, IrType::Int),
                    IrType::Num => (IrOp::NegNum, IrType::Num),
                    _ => return Err(AbortReason::TypeUnstable),
                };
                let r = self
                    .builder
                    .emit1(irop, ty, src)
                    .map_err(|_| AbortReason::SideExit)?;
                self.set_slot(a, r, ty)?;
            }
            GetI => {
                let vb = observe(b);
                if observed_type(&vb) != IrType::Tab {
                    return Err(AbortReason::TypeUnstable);
                }
                let tab = self.slot_ref(b, &vb)?;
                let key = self
                    .builder
                    .kint(c as i64)
                    .map_err(|_| AbortReason::SideExit)?;
                self.snapshot_here()?;
                let r = self
                    .builder
                    .emit2(IrOp::Tget, IrType::Unknown, tab, key)
                    .map_err(|_| AbortReason::SideExit)?;
                self.set_slot(a, r, IrType::Unknown)?;
            }
            SetI => {
                let va = observe(a);
                if observed_type(&va) != IrType::Tab {
                    return Err(AbortReason::TypeUnstable);
                }
                let tab = self.slot_ref(a, &va)?;
                let val = self.slot_ref(c, &observe(c))?;
                let key = self
                    .builder
                    .kint(b as i64)
                    .map_err(|_| AbortReason::SideExit)?;
                self.snapshot_here()?;
                let href = self
                    .builder
                    .emit2(IrOp::Aref, IrType::Ptr, tab, key)
                    .map_err(|_| AbortReason::SideExit)?;
                self.builder
                    .emit2(IrOp::Tset, IrType::Nil, href, val)
                    .map_err(|_| AbortReason::SideExit)?;
            }
            Jmp => {
                // unconditional control flow inside the trace is implicit
            }
            Eq | Lt | Le | EqI | LtI | LeI | GtI | GeI | Test => {
                self.record_cond(op, inst, slots)?;
            }
            Return | Return0 | Return1 => {
                if self.leave_call() {
                    return Ok(false);
                }
            }
            Call | TailCall => {
                self.enter_call()?;
                // calls into unknown callables are not inlined yet
                return Err(AbortReason::Nyi);
            }
            // the remaining opcodes fall back to the interpreter contract
            _ => return Err(AbortReason::Nyi),
        }
        Ok(true)
    }

    fn record_arith(
        &mut self,
        op: Opcode,
        a: u16,
        b: u16,
        c: u16,
        vb: &Value,
        vc: &Value,
    ) -> Result<(), AbortReason> {
        use Opcode::*;
        let tb = observed_type(vb);
        let tc = observed_type(vc);

        let bitwise = matches!(op, BAnd | BOr | BXor | Shl | Shr);
        let int_path = tb == IrType::Int && tc == IrType::Int;
        let num_path = !bitwise
            && matches!(tb, IrType::Int | IrType::Num)
            && matches!(tc, IrType::Int | IrType::Num)
            && !int_path;

        if !int_path && !num_path {
            return Err(AbortReason::TypeUnstable);
        }

        let mut lhs = self.slot_ref(b, vb)?;
        let mut rhs = self.slot_ref(c, vc)?;

        let (irop, ty) = if int_path {
            let irop = match op {
                Add => IrOp::AddInt,
                Sub => IrOp::SubInt,
                Mul => IrOp::MulInt,
                Div => IrOp::DivInt,
                Mod => IrOp::ModInt,
                BAnd => IrOp::Band,
                BOr => IrOp::Bor,
                BXor => IrOp::Bxor,
                Shl => IrOp::Shl,
                Shr => IrOp::Shr,
                _ => unreachable!(),
            };
            (irop, IrType::Int)
        } else {
            // widen mixed operands to float
            if tb == IrType::Int {
                lhs = self
                    .builder
                    .emit1(IrOp::ConvIntNum, IrType::Num, lhs)
                    .map_err(|_| AbortReason::SideExit)?;
            }
            if tc == IrType::Int {
                rhs = self
                    .builder
                    .emit1(IrOp::ConvIntNum, IrType::Num, rhs)
                    .map_err(|_| AbortReason::SideExit)?;
            }
            let irop = match op {
                Add => IrOp::AddNum,
                Sub => IrOp::SubNum,
                Mul => IrOp::MulNum,
                Div => IrOp::DivNum,
                _ => return Err(AbortReason::Nyi),
            };
            (irop, IrType::Num)
        };

        // integer division by a possibly-zero divisor needs a guard
        if matches!(irop, IrOp::DivInt | IrOp::ModInt) {
            let zero = self.builder.kint(0).map_err(|_| AbortReason::SideExit)?;
            let nonzero = self
                .builder
                .emit2(IrOp::Ne, IrType::Int, rhs, zero)
                .map_err(|_| AbortReason::SideExit)?;
            self.snapshot_here()?;
            self.builder
                .emit1(IrOp::Jmpt, IrType::Nil, nonzero)
                .map_err(|_| AbortReason::SideExit)?;
        }

        let r = self
            .builder
            .emit2(irop, ty, lhs, rhs)
            .map_err(|_| AbortReason::SideExit)?;
        self.set_slot(a, r, ty)?;
        Ok(())
    }

    /// Record a condition test plus its trailing jump. The taken
    /// direction becomes the trace; the other direction becomes a guarded
    /// side exit at the snapshot's pc.
    fn record_cond(&mut self, op: Opcode, inst: u64, slots: &[Value]) -> Result<(), AbortReason> {
        use Opcode::*;
        let a = instr::get_a(inst);
        let observe = |slot: u16| slots.get(slot as usize).copied().unwrap_or(Value::Nil);

        let va = observe(a);
        let lhs = self.slot_ref(a, &va)?;

        let (irop, rhs, outcome) = match op {
            Test => {
                let truthy = va.is_truthy();
                let zero = self.builder.kint(0).map_err(|_| AbortReason::SideExit)?;
                (IrOp::Ne, zero, truthy)
            }
            Eq | Lt | Le => {
                let b = instr::get_b(inst);
                let vb = observe(b);
                let rhs = self.slot_ref(b, &vb)?;
                let (irop, outcome) = match (op, &va, &vb) {
                    (Eq, x, y) => (IrOp::Eq, x == y),
                    (Lt, Value::Int(x), Value::Int(y)) => (IrOp::Lt, x < y),
                    (Le, Value::Int(x), Value::Int(y)) => (IrOp::Le, x <= y),
                    (Lt, x, y) => match (x.as_float(), y.as_float()) {
                        (Some(x), Some(y)) => (IrOp::Lt, x < y),
                        _ => return Err(AbortReason::TypeUnstable),
                    },
                    (Le, x, y) => match (x.as_float(), y.as_float()) {
                        (Some(x), Some(y)) => (IrOp::Le, x <= y),
                        _ => return Err(AbortReason::TypeUnstable),
                    },
                    _ => unreachable!(),
                };
                (irop, rhs, outcome)
            }
            EqI | LtI | LeI | GtI | GeI => {
                let imm = instr::get_sb(inst) as i64;
                let rhs = self.builder.kint(imm).map_err(|_| AbortReason::SideExit)?;
                let x = match va {
                    Value::Int(x) => x,
                    _ => return Err(AbortReason::TypeUnstable),
                };
                let (irop, outcome) = match op {
                    EqI => (IrOp::Eq, x == imm),
                    LtI => (IrOp::Lt, x < imm),
                    LeI => (IrOp::Le, x <= imm),
                    GtI => (IrOp::Gt, x > imm),
                    GeI => (IrOp::Ge, x >= imm),
                    _ => unreachable!(),
                };
                (irop, rhs, outcome)
            }
            _ => return Err(AbortReason::Nyi),
        };

        let cmp = self
            .builder
            .emit2(irop, IrType::Int, lhs, rhs)
            .map_err(|_| AbortReason::SideExit)?;

        // guard the outcome the interpreter observed; either branch
        // direction deviating from it takes the side exit
        self.snapshot_here()?;
        let guard = if outcome { IrOp::Jmpt } else { IrOp::Jmpf };
        self.builder
            .emit1(guard, IrType::Nil, cmp)
            .map_err(|_| AbortReason::SideExit)?;
        Ok(())
    }

    /// Commit the finished recording into a trace
    pub fn commit(&mut self, trace_id: u32) -> Trace {
        debug_assert_eq!(self.state, RecordState::Done);
        let (ir, consts) = self.builder.snapshot_buffers();
        let trace = Trace {
            id: trace_id,
            kind: crate::jit::types::TraceKind::Root,
            proto_id: self.proto_id,
            start_pc: self.start_pc,
            ir,
            consts,
            snapshots: std::mem::take(&mut self.snapshots),
            exits: std::mem::take(&mut self.exits),
            mcode: None,
            link: None,
            parent: None,
        };
        self.state = RecordState::Idle;
        trace
    }

    /// Borrow the IR builder (for the optimiser)
    pub fn builder_mut(&mut self) -> &mut IrBuilder {
        &mut self.builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lux_bytecode::instr::{abc, absck, asbck, asbx, sj};

    #[test]
    fn test_hotcount_triggers_and_resets() {
        let mut counts = HotCounts::new();
        counts.hotloop = 4;
        for _ in 0..3 {
            assert!(!counts.tick_loop(1, 10));
        }
        assert!(counts.tick_loop(1, 10));
        // the counter reset, so the site does not immediately re-fire
        assert!(!counts.tick_loop(1, 10));
    }

    #[test]
    fn test_hotcount_tables_are_independent() {
        let mut counts = HotCounts::new();
        counts.hotloop = 2;
        counts.hotcall = 2;
        assert!(!counts.tick_loop(1, 0));
        assert!(!counts.tick_call(1, 0));
        assert!(counts.tick_loop(1, 0));
        assert!(counts.tick_call(1, 0));
    }

    /// A tight counting loop:
    ///   0: LOADI r1, 0
    ///   1: ADDI  r1, r1, 1
    ///   2: LTI   r1, 1000, k=1
    ///   3: JMP   -3           ; back to pc 1
    ///   4: RETURN1 r1
    fn loop_proto() -> Proto {
        let mut p = Proto::new(0, 4);
        p.code = vec![
            asbx(Opcode::LoadI, 1, 0),
            lux_bytecode::instr::absck(Opcode::AddI, 1, 1, 1, false),
            asbck(Opcode::LtI, 1, 1000, 0, true),
            sj(Opcode::Jmp, -3),
            abc(Opcode::Return1, 1, 0, 0),
        ];
        p
    }

    #[test]
    fn test_recorder_closes_a_loop() {
        let proto = loop_proto();
        let mut rec = TraceRecorder::new(RecordLimits::default());
        assert_eq!(rec.state, RecordState::Idle);

        rec.start(7, 1, RecordLimits::default());
        assert_eq!(rec.state, RecordState::Recording);

        // simulate the interpreter running one iteration: pcs 1,2,3 then
        // back to the start pc
        let mut slots = vec![Value::Nil, Value::Int(5)];
        assert_eq!(rec.record(&proto, 1, &slots), RecordOutcome::Continue);
        slots[1] = Value::Int(6);
        assert_eq!(rec.record(&proto, 2, &slots), RecordOutcome::Continue);
        assert_eq!(rec.record(&proto, 3, &slots), RecordOutcome::Continue);
        assert_eq!(rec.record(&proto, 1, &slots), RecordOutcome::LoopClosed);
        assert_eq!(rec.state, RecordState::Done);

        let trace = rec.commit(1);
        assert_eq!(trace.proto_id, 7);
        assert_eq!(trace.start_pc, 1);
        assert!(!trace.ir.is_empty());
        assert!(!trace.snapshots.is_empty());
        assert_eq!(trace.ir.last().unwrap().op, IrOp::Loop);
        assert_eq!(rec.state, RecordState::Idle);
    }

    #[test]
    fn test_recorder_aborts_on_unknown_opcode() {
        let mut p = Proto::new(0, 4);
        p.code = vec![abc(Opcode::Concat, 0, 2, 0), abc(Opcode::Return0, 0, 0, 0)];
        let mut rec = TraceRecorder::new(RecordLimits::default());
        rec.start(1, 0, RecordLimits::default());
        let out = rec.record(&p, 0, &[Value::Nil]);
        assert_eq!(out, RecordOutcome::Aborted(AbortReason::Nyi));
        assert_eq!(rec.state, RecordState::Abort);
        assert_eq!(rec.abort_reason, Some(AbortReason::Nyi));
    }

    #[test]
    fn test_recorder_aborts_on_record_limit() {
        let proto = loop_proto();
        let mut limits = RecordLimits::default();
        limits.max_record = 2;
        let mut rec = TraceRecorder::new(limits);
        rec.start(1, 1, limits);
        let slots = vec![Value::Nil, Value::Int(1)];
        assert_eq!(rec.record(&proto, 1, &slots), RecordOutcome::Continue);
        assert_eq!(rec.record(&proto, 2, &slots), RecordOutcome::Continue);
        assert_eq!(
            rec.record(&proto, 3, &slots),
            RecordOutcome::Aborted(AbortReason::MaxIns)
        );
    }

    #[test]
    fn test_recorder_return_commits() {
        let mut p = Proto::new(0, 2);
        p.code = vec![asbx(Opcode::LoadI, 0, 3), abc(Opcode::Return1, 0, 0, 0)];
        let mut rec = TraceRecorder::new(RecordLimits::default());
        rec.start(2, 0, RecordLimits::default());
        let slots = vec![Value::Nil, Value::Nil];
        assert_eq!(rec.record(&p, 0, &slots), RecordOutcome::Continue);
        assert_eq!(rec.record(&p, 1, &slots), RecordOutcome::Returned);
        let trace = rec.commit(1);
        assert_eq!(trace.ir.last().unwrap().op, IrOp::Ret);
    }

    #[test]
    fn test_type_guards_on_first_slot_use() {
        let proto = loop_proto();
        let mut rec = TraceRecorder::new(RecordLimits::default());
        rec.start(1, 1, RecordLimits::default());
        let slots = vec![Value::Nil, Value::Int(5)];
        rec.record(&proto, 1, &slots);

        // the first touch of slot 1 loads and guards its integer type
        let ops: Vec<IrOp> = rec.builder_mut().ir().iter().map(|i| i.op).collect();
        assert!(ops.contains(&IrOp::Load));
        assert!(ops.contains(&IrOp::GuardInt));
        assert!(ops.contains(&IrOp::Snapshot));
    }
}
