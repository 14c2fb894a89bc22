//! IR builder with common-subexpression elimination
//!
//! The builder owns the IR buffer and constant pool that are reused across
//! trace attempts; committing a trace copies both out. Pure binary ops are
//! deduplicated through a hash table keyed by `(op, op1, op2)` — a probe
//! that hits returns the existing reference instead of emitting. Stores,
//! calls, guards, snapshots, and control flow always emit.

use rustc_hash::FxHashMap;

use crate::error::JitError;

use super::types::{IrConst, IrIns, IrOp, IrRef, IrType, IRREF_BIAS};

/// Constant-pool key; floats are hashed by bit pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    NumBits(u64),
    Ptr(usize),
}

/// Linear IR builder, reused across recordings
pub struct IrBuilder {
    ir: Vec<IrIns>,
    consts: Vec<IrConst>,
    /// CSE table over pure binary ops
    cse: FxHashMap<(IrOp, IrRef, IrRef), IrRef>,
    /// Constant dedup table
    kcache: FxHashMap<ConstKey, IrRef>,
    max_ir: usize,
    max_consts: usize,
}

impl IrBuilder {
    /// Create a builder with the given buffer limits
    pub fn new(max_ir: usize, max_consts: usize) -> Self {
        IrBuilder {
            ir: Vec::new(),
            consts: Vec::new(),
            cse: FxHashMap::default(),
            kcache: FxHashMap::default(),
            max_ir: max_ir.min((u16::MAX - IRREF_BIAS) as usize),
            max_consts: max_consts.min(IRREF_BIAS as usize),
        }
    }

    /// Clear all buffers for a fresh recording
    pub fn reset(&mut self) {
        self.ir.clear();
        self.consts.clear();
        self.cse.clear();
        self.kcache.clear();
    }

    /// Number of emitted instructions
    pub fn len(&self) -> usize {
        self.ir.len()
    }

    /// Whether nothing has been emitted yet
    pub fn is_empty(&self) -> bool {
        self.ir.is_empty()
    }

    /// Adjust the buffer limits (from `opt_start` configuration)
    pub fn set_limits(&mut self, max_ir: usize, max_consts: usize) {
        self.max_ir = max_ir.min((u16::MAX - IRREF_BIAS) as usize);
        self.max_consts = max_consts.min(IRREF_BIAS as usize);
    }

    /// Instruction behind a computed reference
    #[inline]
    pub fn ins(&self, r: IrRef) -> &IrIns {
        debug_assert!(r >= IRREF_BIAS);
        &self.ir[(r - IRREF_BIAS) as usize]
    }

    /// Constant behind a constant reference
    #[inline]
    pub fn const_val(&self, r: IrRef) -> IrConst {
        debug_assert!(r < IRREF_BIAS);
        self.consts[r as usize]
    }

    /// The whole IR buffer
    pub fn ir(&self) -> &[IrIns] {
        &self.ir
    }

    /// Mutable IR buffer, for the optimiser
    pub fn ir_mut(&mut self) -> &mut [IrIns] {
        &mut self.ir
    }

    /// The constant pool
    pub fn consts(&self) -> &[IrConst] {
        &self.consts
    }

    /// Copy the buffers out for a committed trace
    pub fn snapshot_buffers(&self) -> (Vec<IrIns>, Vec<IrConst>) {
        (self.ir.clone(), self.consts.clone())
    }

    fn push(&mut self, ins: IrIns) -> Result<IrRef, JitError> {
        if self.ir.len() >= self.max_ir {
            return Err(JitError::TraceLimit);
        }
        let r = IRREF_BIAS + self.ir.len() as IrRef;
        self.ir.push(ins);
        Ok(r)
    }

    fn intern_const(&mut self, key: ConstKey, value: IrConst) -> Result<IrRef, JitError> {
        if let Some(&r) = self.kcache.get(&key) {
            return Ok(r);
        }
        if self.consts.len() >= self.max_consts {
            return Err(JitError::TraceLimit);
        }
        let r = self.consts.len() as IrRef;
        self.consts.push(value);
        self.kcache.insert(key, r);
        Ok(r)
    }

    /// Intern an integer constant
    pub fn kint(&mut self, value: i64) -> Result<IrRef, JitError> {
        self.intern_const(ConstKey::Int(value), IrConst::Int(value))
    }

    /// Intern a float constant
    pub fn knum(&mut self, value: f64) -> Result<IrRef, JitError> {
        self.intern_const(ConstKey::NumBits(value.to_bits()), IrConst::Num(value))
    }

    /// Intern a pointer constant
    pub fn kptr(&mut self, value: usize) -> Result<IrRef, JitError> {
        self.intern_const(ConstKey::Ptr(value), IrConst::Ptr(value))
    }

    /// Emit a no-operand instruction
    pub fn emit0(&mut self, op: IrOp, ty: IrType) -> Result<IrRef, JitError> {
        self.push(IrIns {
            op,
            ty,
            op1: 0,
            op2: 0,
        })
    }

    /// Emit a single-operand instruction
    pub fn emit1(&mut self, op: IrOp, ty: IrType, op1: IrRef) -> Result<IrRef, JitError> {
        self.push(IrIns { op, ty, op1, op2: 0 })
    }

    /// Emit a two-operand instruction, probing the CSE table first for
    /// pure binary ops
    pub fn emit2(&mut self, op: IrOp, ty: IrType, op1: IrRef, op2: IrRef) -> Result<IrRef, JitError> {
        if op.is_pure_binary() {
            if let Some(&r) = self.cse.get(&(op, op1, op2)) {
                return Ok(r);
            }
        }
        let r = self.push(IrIns { op, ty, op1, op2 })?;
        if op.is_pure_binary() {
            self.cse.insert((op, op1, op2), r);
        }
        Ok(r)
    }

    /// Invalidate CSE entries; called after a pass rewrites instructions
    /// in place, since the table may now point at NOPs
    pub fn invalidate_cse(&mut self) {
        self.cse.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> IrBuilder {
        IrBuilder::new(4096, 4096)
    }

    #[test]
    fn test_refs_are_forward_free() {
        let mut b = builder();
        let k1 = b.kint(1).unwrap();
        let k2 = b.kint(2).unwrap();
        let add = b.emit2(IrOp::AddInt, IrType::Int, k1, k2).unwrap();
        assert!(k1 < IRREF_BIAS && k2 < IRREF_BIAS);
        assert!(add >= IRREF_BIAS);
        // every operand reference precedes its consumer
        let ins = b.ins(add);
        assert!(ins.op1 < add && ins.op2 < add);
    }

    #[test]
    fn test_constants_dedup() {
        let mut b = builder();
        let a = b.kint(42).unwrap();
        let c = b.kint(42).unwrap();
        assert_eq!(a, c);
        assert_eq!(b.consts().len(), 1);

        // distinct bit patterns stay distinct
        let z1 = b.knum(0.0).unwrap();
        let z2 = b.knum(-0.0).unwrap();
        assert_ne!(z1, z2);
    }

    #[test]
    fn test_cse_reuses_pure_binary() {
        let mut b = builder();
        let k1 = b.kint(1).unwrap();
        let k2 = b.kint(2).unwrap();
        let first = b.emit2(IrOp::AddInt, IrType::Int, k1, k2).unwrap();
        let second = b.emit2(IrOp::AddInt, IrType::Int, k1, k2).unwrap();
        assert_eq!(first, second);
        assert_eq!(b.len(), 1);

        // different operand order is a different expression
        let third = b.emit2(IrOp::AddInt, IrType::Int, k2, k1).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_non_pure_ops_bypass_cse() {
        let mut b = builder();
        let k1 = b.kint(0).unwrap();
        let s1 = b.emit2(IrOp::Store, IrType::Nil, k1, k1).unwrap();
        let s2 = b.emit2(IrOp::Store, IrType::Nil, k1, k1).unwrap();
        assert_ne!(s1, s2);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_ir_limit() {
        let mut b = IrBuilder::new(2, 16);
        b.emit0(IrOp::Loop, IrType::Nil).unwrap();
        b.emit0(IrOp::Loop, IrType::Nil).unwrap();
        assert_eq!(
            b.emit0(IrOp::Loop, IrType::Nil).unwrap_err(),
            JitError::TraceLimit
        );
    }

    #[test]
    fn test_const_limit() {
        let mut b = IrBuilder::new(16, 1);
        b.kint(1).unwrap();
        assert_eq!(b.kint(2).unwrap_err(), JitError::TraceLimit);
        // the cached constant is still reachable
        assert!(b.kint(1).is_ok());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut b = builder();
        let k = b.kint(7).unwrap();
        b.emit1(IrOp::NegInt, IrType::Int, k).unwrap();
        b.reset();
        assert!(b.is_empty());
        assert!(b.consts().is_empty());
        // CSE table was cleared too: same emission gets a fresh slot
        let k2 = b.kint(7).unwrap();
        assert_eq!(k2, 0);
    }
}
