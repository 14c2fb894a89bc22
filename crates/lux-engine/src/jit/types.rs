//! JIT core types: IR instructions, traces, snapshots
//!
//! The IR is a linear buffer of fixed-size instructions addressed by
//! 16-bit references. References below [`IRREF_BIAS`] index the trace's
//! constant pool; references at or above it index computed instructions.
//! The buffer is forward-reference-free: every operand reference is
//! strictly smaller than its consumer's position.

/// 16-bit IR reference
pub type IrRef = u16;

/// Constants live below the bias, instructions at or above it
pub const IRREF_BIAS: IrRef = 0x8000;

/// Null reference
pub const IRREF_NIL: IrRef = 0;

/// Whether a reference names a constant
#[inline]
pub fn irref_is_const(r: IrRef) -> bool {
    r < IRREF_BIAS
}

/// Whether a reference names a computed instruction
#[inline]
pub fn irref_is_ins(r: IrRef) -> bool {
    r >= IRREF_BIAS
}

/// Result type of an IR value, aligned with the interpreter's tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    Nil = 0,
    False,
    True,
    Int,
    Num,
    Str,
    Tab,
    Func,
    Udata,
    Thread,
    Ptr,
    Unknown,
}

/// IR opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrOp {
    // ===== Constants & moves =====
    Nop = 0,
    Kint,
    Knum,
    Kptr,
    Mov,

    // ===== Type guards =====
    GuardType,
    GuardNil,
    GuardNotNil,
    GuardInt,
    GuardNum,
    GuardStr,
    GuardTab,
    GuardFunc,

    // ===== Integer arithmetic =====
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    NegInt,
    Band,
    Bor,
    Bxor,
    Bnot,
    Shl,
    Shr,

    // ===== Float arithmetic =====
    AddNum,
    SubNum,
    MulNum,
    DivNum,
    NegNum,
    PowNum,
    Floor,
    Ceil,

    // ===== Conversions =====
    ConvIntNum,
    ConvNumInt,

    // ===== Comparisons =====
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // ===== Control flow =====
    Jmp,
    Jmpt,
    Jmpf,
    Loop,
    Phi,
    Ret,

    // ===== Memory =====
    Load,
    Store,
    Aref,
    Href,
    Uref,

    // ===== Tables =====
    Tget,
    Tset,
    Tnew,
    Tlen,

    // ===== Strings =====
    Strcat,
    Strlen,

    // ===== Calls =====
    Call,
    Tailcall,
    Callc,

    // ===== Meta =====
    Snapshot,
    SideExit,
}

impl IrOp {
    /// Pure ops have no side effects and are eligible for CSE, folding,
    /// and dead-code elimination
    pub fn is_pure(self) -> bool {
        use IrOp::*;
        matches!(
            self,
            Kint | Knum
                | Kptr
                | Mov
                | AddInt
                | SubInt
                | MulInt
                | DivInt
                | ModInt
                | NegInt
                | Band
                | Bor
                | Bxor
                | Bnot
                | Shl
                | Shr
                | AddNum
                | SubNum
                | MulNum
                | DivNum
                | NegNum
                | PowNum
                | Floor
                | Ceil
                | ConvIntNum
                | ConvNumInt
                | Eq
                | Ne
                | Lt
                | Le
                | Gt
                | Ge
                | Load
                | Aref
                | Href
                | Uref
                | Tlen
                | Strlen
        )
    }

    /// Binary pure ops, the CSE-eligible subset
    pub fn is_pure_binary(self) -> bool {
        use IrOp::*;
        self.is_pure()
            && matches!(
                self,
                AddInt
                    | SubInt
                    | MulInt
                    | DivInt
                    | ModInt
                    | Band
                    | Bor
                    | Bxor
                    | Shl
                    | Shr
                    | AddNum
                    | SubNum
                    | MulNum
                    | DivNum
                    | PowNum
                    | Eq
                    | Ne
                    | Lt
                    | Le
                    | Gt
                    | Ge
                    | Aref
                    | Href
            )
    }

    /// Guards conditionally branch to a side exit
    pub fn is_guard(self) -> bool {
        use IrOp::*;
        matches!(
            self,
            GuardType | GuardNil | GuardNotNil | GuardInt | GuardNum | GuardStr | GuardTab
                | GuardFunc
        )
    }

    /// Control-flow ops anchor liveness during DCE
    pub fn is_control(self) -> bool {
        use IrOp::*;
        matches!(self, Jmp | Jmpt | Jmpf | Loop | Phi | Ret | Snapshot | SideExit)
    }
}

/// One IR instruction: opcode, result type, two operand references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrIns {
    pub op: IrOp,
    pub ty: IrType,
    pub op1: IrRef,
    pub op2: IrRef,
}

impl IrIns {
    /// A NOP placeholder, used when passes retire an instruction
    pub fn nop() -> Self {
        IrIns {
            op: IrOp::Nop,
            ty: IrType::Nil,
            op1: IRREF_NIL,
            op2: IRREF_NIL,
        }
    }
}

/// An IR constant-pool entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IrConst {
    Int(i64),
    Num(f64),
    Ptr(usize),
}

/// Why a recording attempt was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Recorded bytecode count exceeded the limit
    MaxIns,
    /// Call-inline depth exceeded
    MaxDepth,
    /// Unrecognised opcode
    Nyi,
    /// Location blacklisted after repeated aborts
    Blacklist,
    /// Operand types changed between iterations
    TypeUnstable,
    /// IR constant pool, snapshot, or side-exit budget exceeded
    SideExit,
    /// Malformed instruction stream
    BadInstr,
}

/// Trace kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// Started at a hot loop back-edge
    Root,
    /// Started at a hot side exit of a parent trace
    Side,
    /// Stitched to a completed trace
    Stitch,
}

/// One live stack slot captured by a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapSlot {
    /// Interpreter stack slot
    pub slot: u16,
    /// IR value the slot holds at the snapshot point
    pub ir: IrRef,
    /// Type observed at recording time
    pub ty: IrType,
}

/// Interpreter state captured at a potential side exit: enough to rebuild
/// the stack and resume at `pc` should the following guard fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Bytecode pc to resume at
    pub pc: u32,
    /// Sparse live-slot bindings
    pub slots: Vec<SnapSlot>,
}

/// A side exit, pairing an exit index with its snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideExit {
    /// Bytecode pc of the exit
    pub pc: u32,
    /// Index into the trace's snapshot list
    pub snapshot: u16,
}

/// Compiled machine code owned by the executable-memory manager
#[derive(Debug, Clone, Copy)]
pub struct McodeRef {
    /// Entry address inside a protected block
    pub addr: usize,
    /// Code length in bytes
    pub size: usize,
}

/// A recorded and possibly compiled trace
#[derive(Debug)]
pub struct Trace {
    /// Trace id, unique within the owning engine
    pub id: u32,
    pub kind: TraceKind,
    /// Owning prototype (engine-assigned id)
    pub proto_id: u32,
    /// Bytecode pc the trace starts at
    pub start_pc: u32,

    /// IR buffer, copied out of the builder on commit
    pub ir: Vec<IrIns>,
    /// IR constant pool
    pub consts: Vec<IrConst>,
    /// Side-exit snapshot descriptors
    pub snapshots: Vec<Snapshot>,
    /// Side exits
    pub exits: Vec<SideExit>,

    /// Generated machine code, if compilation succeeded
    pub mcode: Option<McodeRef>,

    /// Successor trace (loop back-edge or stitch)
    pub link: Option<u32>,
    /// Parent trace and exit index, for side traces
    pub parent: Option<(u32, u32)>,
}

impl Trace {
    /// A fresh root trace with empty buffers
    pub fn root(id: u32, proto_id: u32, start_pc: u32) -> Self {
        Trace {
            id,
            kind: TraceKind::Root,
            proto_id,
            start_pc,
            ir: Vec::new(),
            consts: Vec::new(),
            snapshots: Vec::new(),
            exits: Vec::new(),
            mcode: None,
            link: None,
            parent: None,
        }
    }
}
