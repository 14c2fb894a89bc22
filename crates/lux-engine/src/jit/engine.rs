//! JIT controller
//!
//! Composes hotness detection, the recorder, the optimiser, the emitter,
//! and the executable-memory manager, and exposes the hooks the
//! interpreter drives: `on_loop`, `on_call`, `on_return`, plus the host
//! `jit` namespace (`on`/`off`/`status`/`flush`/`opt_start`).
//!
//! JIT failures never reach the host: a failed recording aborts and
//! interpretation continues; an exhausted code cap silently stops
//! compiling new traces while the compiled ones keep running.

use rustc_hash::FxHashMap;
use serde::Serialize;

use lux_bytecode::Proto;

use crate::error::JitError;
use crate::jit::emit::{self, EmitInput, TraceEntry, TraceFrame};
use crate::jit::mem::{JitMem, MCODE_MAX_SIZE};
use crate::jit::opt::{OptConfig, Optimizer};
use crate::jit::trace::{
    HotCounts, RecordLimits, RecordOutcome, RecordState, TraceRecorder, DEFAULT_HOTCALL,
    DEFAULT_HOTEXIT, DEFAULT_HOTLOOP,
};
use crate::jit::types::{irref_is_const, IrConst, IrType, McodeRef, Trace};
use crate::value::TypeTag;

/// Aborts at one location before it is blacklisted
const BLACKLIST_AFTER: u8 = 3;

/// Tunable options, settable through `opt_start("key=value")`
#[derive(Debug, Clone, Copy)]
pub struct JitOptions {
    pub enable: bool,
    pub enable_opt: bool,
    pub hotloop: u16,
    pub hotcall: u16,
    pub hotexit: u16,
    pub maxtrace: u32,
    pub maxrecord: u32,
    pub maxirconst: u32,
    pub maxside: u32,
    pub maxsnap: u32,
    pub maxmcode: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        JitOptions {
            enable: true,
            enable_opt: true,
            hotloop: DEFAULT_HOTLOOP,
            hotcall: DEFAULT_HOTCALL,
            hotexit: DEFAULT_HOTEXIT,
            maxtrace: 1000,
            maxrecord: 4000,
            maxirconst: 4096,
            maxside: 100,
            maxsnap: 500,
            maxmcode: MCODE_MAX_SIZE,
        }
    }
}

/// Counters reported by `status()`
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct JitStats {
    /// Traces registered (compiled or interpreter-assisted)
    pub traces: u32,
    /// Traces with machine code
    pub compiled: u32,
    /// Recording attempts abandoned
    pub aborted: u32,
    /// Compiled-trace invocations
    pub executions: u64,
    /// Bytes of machine code committed
    pub mcode_size: usize,
}

/// What the interpreter should do at a loop or call edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Nothing special; keep interpreting
    Nothing,
    /// A compiled trace exists: execute it
    Execute(u32),
    /// Recording just started: feed dispatched bytecodes to `record`
    Record,
}

/// Per-State JIT engine
pub struct JitEngine {
    options: JitOptions,
    hotcounts: HotCounts,
    recorder: TraceRecorder,
    mem: JitMem,
    traces: Vec<Trace>,
    /// (proto, pc) -> trace id
    trace_map: FxHashMap<(u32, u32), u32>,
    /// (proto, pc) -> abort count
    blacklist: FxHashMap<(u32, u32), u8>,
    stats: JitStats,
    /// The code cap was hit: no further compilation
    mem_exhausted: bool,
}

impl JitEngine {
    pub fn new(options: JitOptions) -> Self {
        let mut hotcounts = HotCounts::new();
        hotcounts.hotloop = options.hotloop;
        hotcounts.hotcall = options.hotcall;
        hotcounts.hotexit = options.hotexit;
        JitEngine {
            options,
            hotcounts,
            recorder: TraceRecorder::new(RecordLimits::default()),
            mem: JitMem::new(options.maxmcode),
            traces: Vec::new(),
            trace_map: FxHashMap::default(),
            blacklist: FxHashMap::default(),
            stats: JitStats::default(),
            mem_exhausted: false,
        }
    }

    /// Enable or disable the whole controller
    pub fn set_enabled(&mut self, enabled: bool) {
        self.options.enable = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enable
    }

    /// Whether a recording is in flight
    pub fn is_recording(&self) -> bool {
        self.recorder.state == RecordState::Recording
    }

    /// Current statistics snapshot
    pub fn status(&self) -> JitStats {
        self.stats
    }

    fn limits(&self) -> RecordLimits {
        RecordLimits {
            max_record: self.options.maxrecord,
            max_depth: 8,
            max_irconst: self.options.maxirconst as usize,
            max_ir: 16384,
            max_side: self.options.maxside as usize,
            max_snap: self.options.maxsnap as usize,
        }
    }

    fn is_blacklisted(&self, proto_id: u32, pc: u32) -> bool {
        self.blacklist
            .get(&(proto_id, pc))
            .is_some_and(|&n| n >= BLACKLIST_AFTER)
    }

    /// Loop back-edge hook
    pub fn on_loop(&mut self, proto_id: u32, pc: u32) -> HookAction {
        if !self.options.enable {
            return HookAction::Nothing;
        }
        if let Some(&id) = self.trace_map.get(&(proto_id, pc)) {
            if self.traces[id as usize].mcode.is_some() {
                return HookAction::Execute(id);
            }
        }
        if self.recorder.state == RecordState::Recording {
            return HookAction::Nothing;
        }
        if self.hotcounts.tick_loop(proto_id, pc) {
            if self.is_blacklisted(proto_id, pc)
                || self.traces.len() as u32 >= self.options.maxtrace
            {
                return HookAction::Nothing;
            }
            self.recorder.start(proto_id, pc, self.limits());
            return HookAction::Record;
        }
        HookAction::Nothing
    }

    /// Function-entry hook, mirroring `on_loop` for the entry pc
    pub fn on_call(&mut self, proto_id: u32) -> HookAction {
        if !self.options.enable {
            return HookAction::Nothing;
        }
        if let Some(&id) = self.trace_map.get(&(proto_id, 0)) {
            if self.traces[id as usize].mcode.is_some() {
                return HookAction::Execute(id);
            }
        }
        if self.recorder.state == RecordState::Recording {
            // an in-flight recording follows the call instead
            if let Err(reason) = self.recorder.enter_call() {
                self.finish_abort(reason);
            }
            return HookAction::Nothing;
        }
        if self.hotcounts.tick_call(proto_id, 0)
            && !self.is_blacklisted(proto_id, 0)
            && (self.traces.len() as u32) < self.options.maxtrace
        {
            self.recorder.start(proto_id, 0, self.limits());
            return HookAction::Record;
        }
        HookAction::Nothing
    }

    /// Function-return hook; commits a depth-0 recording
    pub fn on_return(&mut self, proto: &Proto, pc: u32, slots: &[crate::value::Value]) {
        if self.recorder.state == RecordState::Recording {
            // feed the return itself so the recorder can close the trace
            match self.recorder.record(proto, pc, slots) {
                RecordOutcome::Returned | RecordOutcome::LoopClosed => self.finish_commit(),
                RecordOutcome::Aborted(reason) => self.finish_abort(reason),
                RecordOutcome::Continue => {}
            }
        }
    }

    /// Feed one dispatched bytecode to the in-flight recording
    pub fn record(&mut self, proto: &Proto, pc: u32, slots: &[crate::value::Value]) {
        if self.recorder.state != RecordState::Recording {
            return;
        }
        match self.recorder.record(proto, pc, slots) {
            RecordOutcome::Continue => {}
            RecordOutcome::LoopClosed | RecordOutcome::Returned => self.finish_commit(),
            RecordOutcome::Aborted(reason) => self.finish_abort(reason),
        }
    }

    fn finish_abort(&mut self, _reason: crate::jit::types::AbortReason) {
        let (proto_id, pc) = self.recorder.start_location();
        *self.blacklist.entry((proto_id, pc)).or_insert(0) += 1;
        self.stats.aborted += 1;
        self.recorder.reset();
    }

    fn finish_commit(&mut self) {
        // optimise in the builder, then copy out the committed buffers
        if self.options.enable_opt {
            let optimizer = Optimizer::new(OptConfig::default());
            let stats = optimizer.run(self.recorder.builder_mut());
            tracing::trace!(?stats, "optimiser finished");
        }
        let id = self.traces.len() as u32;
        let mut trace = self.recorder.commit(id);

        if !self.mem_exhausted {
            match self.compile(&trace) {
                Ok(mcode) => {
                    trace.mcode = Some(mcode);
                    self.stats.compiled += 1;
                    self.stats.mcode_size += mcode.size;
                }
                Err(JitError::Memory) => {
                    // cap hit: stop compiling, keep interpreting
                    tracing::debug!("mcode cap reached, disabling compilation");
                    self.mem_exhausted = true;
                }
                Err(_) => {
                    // NYI lowering: the trace stays interpreter-assisted
                }
            }
        }

        tracing::debug!(
            id,
            proto = trace.proto_id,
            pc = trace.start_pc,
            compiled = trace.mcode.is_some(),
            "trace committed"
        );
        self.trace_map
            .insert((trace.proto_id, trace.start_pc), id);
        self.traces.push(trace);
        self.stats.traces += 1;
    }

    fn compile(&mut self, trace: &Trace) -> Result<McodeRef, JitError> {
        let code = emit::emit_trace(&EmitInput {
            ir: &trace.ir,
            consts: &trace.consts,
            exits: &trace.exits,
        })?;
        let (addr, avail) = self.mem.reserve(code.len())?;
        debug_assert!(avail >= code.len());
        // Safety: the reservation is writable and at least code.len() long
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), addr, code.len());
        }
        self.mem.commit(code.len());
        self.mem.protect_exec(addr, code.len())?;
        JitMem::flush_icache(addr, code.len());
        Ok(McodeRef {
            addr: addr as usize,
            size: code.len(),
        })
    }

    /// Execute a compiled trace over the interpreter frame. Returns the
    /// side exit taken, or `None` when the trace has no machine code.
    pub fn run_trace(&mut self, trace_id: u32, frame: &mut TraceFrame) -> Option<u32> {
        let mcode = self.traces.get(trace_id as usize)?.mcode?;
        self.stats.executions += 1;
        // Safety: the address points at committed, protected trace code
        // emitted for exactly this frame layout
        let entry: TraceEntry = unsafe { std::mem::transmute(mcode.addr) };
        let exit = entry(frame);
        self.hotcounts.tick_exit(trace_id, exit);
        Some(exit)
    }

    /// Deoptimise after a side exit: restore constant-bound snapshot
    /// slots (eager stores keep the rest current) and hand back the
    /// bytecode pc to resume at.
    pub fn deoptimize(&self, trace_id: u32, exit: u32, frame: &mut TraceFrame) -> Option<u32> {
        let trace = self.traces.get(trace_id as usize)?;
        let side = trace.exits.get(exit as usize)?;
        let snapshot = trace.snapshots.get(side.snapshot as usize)?;
        for slot in &snapshot.slots {
            if !irref_is_const(slot.ir) {
                continue;
            }
            let (payload, tag) = match trace.consts.get(slot.ir as usize)? {
                IrConst::Int(i) => {
                    let tag = match slot.ty {
                        IrType::True => TypeTag::True,
                        IrType::False => TypeTag::False,
                        _ => TypeTag::Int,
                    };
                    (*i, tag as u8)
                }
                IrConst::Num(n) => (n.to_bits() as i64, TypeTag::Float as u8),
                IrConst::Ptr(p) => (*p as i64, TypeTag::LightUserdata as u8),
            };
            let i = slot.slot as usize;
            if i < frame.nslots {
                // Safety: bounds checked against the frame extent
                unsafe {
                    *frame.payloads.add(i) = payload;
                    *frame.tags.add(i) = tag;
                }
            }
        }
        Some(snapshot.pc)
    }

    /// Trace registered for `(proto, pc)`, if any
    pub fn find_trace(&self, proto_id: u32, pc: u32) -> Option<&Trace> {
        let id = self.trace_map.get(&(proto_id, pc))?;
        self.traces.get(*id as usize)
    }

    /// Trace by id
    pub fn trace(&self, id: u32) -> Option<&Trace> {
        self.traces.get(id as usize)
    }

    /// Block state of a code address, for invariant checks
    pub fn mcode_state(&self, addr: usize) -> Option<crate::jit::mem::BlockState> {
        self.mem.state_of(addr as *const u8)
    }

    /// Release every registered trace and reset the memory manager
    /// (the first block survives, writable again)
    pub fn flush(&mut self) {
        tracing::debug!(traces = self.traces.len(), "jit flush");
        self.traces.clear();
        self.trace_map.clear();
        self.blacklist.clear();
        self.hotcounts.reset();
        self.recorder.reset();
        self.mem.reset();
        self.mem_exhausted = false;
        self.stats.mcode_size = 0;
    }

    /// Apply one `key=value` option
    pub fn opt_set(&mut self, option: &str) -> Result<(), String> {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| format!("malformed option {option:?}"))?;
        let value: u64 = value
            .trim()
            .parse()
            .map_err(|_| format!("bad value in {option:?}"))?;
        match key.trim() {
            "hotloop" => {
                self.options.hotloop = value as u16;
                self.hotcounts.hotloop = value as u16;
            }
            "hotcall" => {
                self.options.hotcall = value as u16;
                self.hotcounts.hotcall = value as u16;
            }
            "hotexit" => {
                self.options.hotexit = value as u16;
                self.hotcounts.hotexit = value as u16;
            }
            "maxtrace" => self.options.maxtrace = value as u32,
            "maxrecord" => self.options.maxrecord = value as u32,
            "maxirconst" => self.options.maxirconst = value as u32,
            "maxside" => self.options.maxside = value as u32,
            "maxsnap" => self.options.maxsnap = value as u32,
            "maxmcode" => self.options.maxmcode = value as usize,
            other => return Err(format!("unknown option {other:?}")),
        }
        Ok(())
    }

    /// Current option values
    pub fn options(&self) -> &JitOptions {
        &self.options
    }
}
