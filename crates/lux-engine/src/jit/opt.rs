//! IR optimisation passes
//!
//! Each pass implements [`OptPass`] and rewrites the builder's IR buffer
//! in place. The driver runs the enabled passes in a fixed-point loop,
//! bounded by `max_iterations`, and exits early once an iteration reports
//! no change.
//!
//! Retired instructions become NOPs rather than being spliced out, so
//! every recorded reference stays valid; the emitter skips NOPs.

use crate::jit::ir::IrBuilder;
use crate::jit::types::{irref_is_const, IrConst, IrIns, IrOp, IrRef, IrType, IRREF_BIAS};

/// An optimisation pass over the linear IR
pub trait OptPass {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass, returning the number of instructions changed
    fn run(&self, builder: &mut IrBuilder) -> usize;
}

/// Optimiser configuration
#[derive(Debug, Clone, Copy)]
pub struct OptConfig {
    pub enable_fold: bool,
    pub enable_narrow: bool,
    pub enable_dce: bool,
    pub enable_licm: bool,
    /// Fixed-point iteration bound
    pub max_iterations: u32,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            enable_fold: true,
            enable_narrow: true,
            enable_dce: true,
            enable_licm: true,
            max_iterations: 3,
        }
    }
}

/// Pass statistics accumulated over one optimisation run
#[derive(Debug, Default, Clone, Copy)]
pub struct OptStats {
    pub folded: usize,
    pub narrowed: usize,
    pub eliminated: usize,
    /// Loop-invariant candidates identified
    pub hoistable: usize,
    pub iterations: u32,
}

/// Optimiser driver
pub struct Optimizer {
    config: OptConfig,
}

impl Optimizer {
    pub fn new(config: OptConfig) -> Self {
        Optimizer { config }
    }

    /// Run all enabled passes to a fixed point
    pub fn run(&self, builder: &mut IrBuilder) -> OptStats {
        let mut stats = OptStats::default();
        for _ in 0..self.config.max_iterations {
            let mut changed = 0;
            stats.iterations += 1;

            if self.config.enable_fold {
                let n = ConstantFolding.run(builder);
                stats.folded += n;
                changed += n;
            }
            if self.config.enable_narrow {
                let n = TypeNarrowing.run(builder);
                stats.narrowed += n;
                changed += n;
            }
            if self.config.enable_dce {
                let n = DeadCodeElimination.run(builder);
                stats.eliminated += n;
                changed += n;
            }
            if self.config.enable_licm {
                // LICM only identifies candidates; it never reports a
                // change, so it cannot keep the fixed point spinning
                stats.hoistable = LoopInvariantMotion.run(builder);
            }

            if changed == 0 {
                break;
            }
            builder.invalidate_cse();
        }
        stats
    }
}

/// Resolve an operand to an integer constant if possible
fn const_int(builder: &IrBuilder, r: IrRef) -> Option<i64> {
    if irref_is_const(r) {
        match builder.const_val(r) {
            IrConst::Int(i) => Some(i),
            _ => None,
        }
    } else {
        None
    }
}

/// Resolve an operand to a float constant if possible
fn const_num(builder: &IrBuilder, r: IrRef) -> Option<f64> {
    if irref_is_const(r) {
        match builder.const_val(r) {
            IrConst::Num(n) => Some(n),
            _ => None,
        }
    } else {
        None
    }
}

// ===== Pass 1: Constant folding =====

/// Evaluates pure binary ops whose operands are both constants, replacing
/// the instruction with a reference to a new constant and retiring the
/// original to a NOP.
pub struct ConstantFolding;

fn fold_int(op: IrOp, a: i64, b: i64) -> Option<i64> {
    use IrOp::*;
    Some(match op {
        AddInt => a.wrapping_add(b),
        SubInt => a.wrapping_sub(b),
        MulInt => a.wrapping_mul(b),
        DivInt => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        ModInt => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        Band => a & b,
        Bor => a | b,
        Bxor => a ^ b,
        Shl => a.wrapping_shl(b as u32 & 63),
        Shr => a.wrapping_shr(b as u32 & 63),
        Eq => (a == b) as i64,
        Ne => (a != b) as i64,
        Lt => (a < b) as i64,
        Le => (a <= b) as i64,
        Gt => (a > b) as i64,
        Ge => (a >= b) as i64,
        _ => return None,
    })
}

fn fold_num(op: IrOp, a: f64, b: f64) -> Option<IrConst> {
    use IrOp::*;
    Some(match op {
        AddNum => IrConst::Num(a + b),
        SubNum => IrConst::Num(a - b),
        MulNum => IrConst::Num(a * b),
        DivNum => IrConst::Num(a / b),
        PowNum => IrConst::Num(a.powf(b)),
        Eq => IrConst::Int((a == b) as i64),
        Ne => IrConst::Int((a != b) as i64),
        Lt => IrConst::Int((a < b) as i64),
        Le => IrConst::Int((a <= b) as i64),
        Gt => IrConst::Int((a > b) as i64),
        Ge => IrConst::Int((a >= b) as i64),
        _ => return None,
    })
}

impl OptPass for ConstantFolding {
    fn name(&self) -> &str {
        "fold"
    }

    fn run(&self, builder: &mut IrBuilder) -> usize {
        let len = builder.len();
        let mut subst: Vec<Option<IrRef>> = vec![None; len];
        let mut changed = 0;

        for idx in 0..len {
            let ins = builder.ir()[idx];
            if !ins.op.is_pure_binary() {
                continue;
            }

            // operands may themselves have been folded this iteration
            let resolve = |r: IrRef, subst: &[Option<IrRef>]| -> IrRef {
                if r >= IRREF_BIAS {
                    subst[(r - IRREF_BIAS) as usize].unwrap_or(r)
                } else {
                    r
                }
            };
            let op1 = resolve(ins.op1, &subst);
            let op2 = resolve(ins.op2, &subst);

            let folded = if let (Some(a), Some(b)) = (const_int(builder, op1), const_int(builder, op2))
            {
                fold_int(ins.op, a, b).map(IrConst::Int)
            } else if let (Some(a), Some(b)) = (const_num(builder, op1), const_num(builder, op2)) {
                fold_num(ins.op, a, b)
            } else {
                None
            };

            if let Some(value) = folded {
                let kref = match value {
                    IrConst::Int(i) => builder.kint(i),
                    IrConst::Num(n) => builder.knum(n),
                    IrConst::Ptr(p) => builder.kptr(p),
                };
                // a full constant pool just leaves the op unfolded
                if let Ok(kref) = kref {
                    subst[idx] = Some(kref);
                    builder.ir_mut()[idx] = IrIns::nop();
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            // rewrite consumers of folded instructions
            for idx in 0..len {
                let ins = &mut builder.ir_mut()[idx];
                if ins.op1 >= IRREF_BIAS {
                    if let Some(k) = subst[(ins.op1 - IRREF_BIAS) as usize] {
                        ins.op1 = k;
                    }
                }
                if ins.op2 >= IRREF_BIAS {
                    if let Some(k) = subst[(ins.op2 - IRREF_BIAS) as usize] {
                        ins.op2 = k;
                    }
                }
            }
        }
        changed
    }
}

// ===== Pass 2: Type narrowing =====

/// Rewrites float ops into integer ops when both operands prove integral:
/// an integer-typed instruction, an integer constant, or a float constant
/// with no fractional part.
pub struct TypeNarrowing;

fn narrow_op(op: IrOp) -> Option<IrOp> {
    use IrOp::*;
    Some(match op {
        AddNum => AddInt,
        SubNum => SubInt,
        MulNum => MulInt,
        NegNum => NegInt,
        _ => return None,
    })
}

impl TypeNarrowing {
    /// An operand proves integral if it is an Int const, an integral Num
    /// const, or an instruction already typed Int
    fn integral_operand(builder: &IrBuilder, r: IrRef) -> Option<Option<i64>> {
        if irref_is_const(r) {
            match builder.const_val(r) {
                IrConst::Int(_) => Some(None),
                IrConst::Num(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                    Some(Some(n as i64))
                }
                _ => None,
            }
        } else if builder.ins(r).ty == IrType::Int {
            Some(None)
        } else {
            None
        }
    }
}

impl OptPass for TypeNarrowing {
    fn name(&self) -> &str {
        "narrow"
    }

    fn run(&self, builder: &mut IrBuilder) -> usize {
        let len = builder.len();
        let mut changed = 0;

        for idx in 0..len {
            let ins = builder.ir()[idx];
            let Some(int_op) = narrow_op(ins.op) else {
                continue;
            };

            let lhs = Self::integral_operand(builder, ins.op1);
            let rhs = if ins.op == IrOp::NegNum {
                Some(None) // unary: only the single operand matters
            } else {
                Self::integral_operand(builder, ins.op2)
            };
            let (Some(lhs_conv), Some(rhs_conv)) = (lhs, rhs) else {
                continue;
            };

            // re-intern integral float constants as integers
            let op1 = match lhs_conv {
                Some(i) => match builder.kint(i) {
                    Ok(k) => k,
                    Err(_) => continue,
                },
                None => ins.op1,
            };
            let op2 = match rhs_conv {
                Some(i) => match builder.kint(i) {
                    Ok(k) => k,
                    Err(_) => continue,
                },
                None => ins.op2,
            };

            builder.ir_mut()[idx] = IrIns {
                op: int_op,
                ty: IrType::Int,
                op1,
                op2,
            };
            changed += 1;
        }
        changed
    }
}

// ===== Pass 3: Dead code elimination =====

/// Marks every non-pure or control instruction live, propagates liveness
/// backward through operand edges, and retires unreferenced pure ops.
/// The buffer is forward-reference-free, so one reverse sweep reaches the
/// fixed point.
pub struct DeadCodeElimination;

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dce"
    }

    fn run(&self, builder: &mut IrBuilder) -> usize {
        let len = builder.len();
        let mut live = vec![false; len];

        for idx in (0..len).rev() {
            let ins = builder.ir()[idx];
            if ins.op == IrOp::Nop {
                continue;
            }
            if !ins.op.is_pure() || ins.op.is_control() || ins.op.is_guard() {
                live[idx] = true;
            }
            if live[idx] {
                if ins.op1 >= IRREF_BIAS {
                    live[(ins.op1 - IRREF_BIAS) as usize] = true;
                }
                if ins.op2 >= IRREF_BIAS {
                    live[(ins.op2 - IRREF_BIAS) as usize] = true;
                }
            }
        }

        let mut changed = 0;
        for idx in 0..len {
            let ins = builder.ir()[idx];
            if ins.op != IrOp::Nop && ins.op.is_pure() && !live[idx] {
                builder.ir_mut()[idx] = IrIns::nop();
                changed += 1;
            }
        }
        changed
    }
}

// ===== Pass 4: Loop-invariant code motion =====

/// Flags pure ops inside the loop body whose operands are all defined
/// before the `Loop` marker (or are constants, or are themselves
/// invariant). This implementation only identifies candidates; the
/// emitter is free to schedule them ahead of the loop header.
pub struct LoopInvariantMotion;

impl OptPass for LoopInvariantMotion {
    fn name(&self) -> &str {
        "licm"
    }

    fn run(&self, builder: &mut IrBuilder) -> usize {
        let len = builder.len();
        let loop_pos = builder
            .ir()
            .iter()
            .position(|ins| ins.op == IrOp::Loop);
        let Some(loop_pos) = loop_pos else {
            return 0;
        };

        let mut invariant = vec![false; len];
        let mut count = 0;
        for idx in loop_pos + 1..len {
            let ins = builder.ir()[idx];
            // memory reads are never invariant without alias analysis
            let hoist_eligible = ins.op.is_pure()
                && !matches!(
                    ins.op,
                    IrOp::Load | IrOp::Aref | IrOp::Href | IrOp::Uref | IrOp::Tlen | IrOp::Strlen
                );
            if !hoist_eligible {
                continue;
            }
            let operand_invariant = |r: IrRef| {
                if r < IRREF_BIAS {
                    true
                } else {
                    let pos = (r - IRREF_BIAS) as usize;
                    pos < loop_pos || invariant[pos]
                }
            };
            if operand_invariant(ins.op1) && operand_invariant(ins.op2) {
                invariant[idx] = true;
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> IrBuilder {
        IrBuilder::new(4096, 4096)
    }

    #[test]
    fn test_constant_folding() {
        let mut b = builder();
        let k1 = b.kint(3).unwrap();
        let k2 = b.kint(5).unwrap();
        let add = b.emit2(IrOp::AddInt, IrType::Int, k1, k2).unwrap();
        let store = b.emit2(IrOp::Store, IrType::Nil, k1, add).unwrap();

        let n = ConstantFolding.run(&mut b);
        assert_eq!(n, 1);

        // the add became a NOP and the store now reads the folded constant
        assert_eq!(b.ins(add).op, IrOp::Nop);
        let folded = b.ins(store).op2;
        assert!(irref_is_const(folded));
        assert_eq!(b.const_val(folded), IrConst::Int(8));
    }

    #[test]
    fn test_folding_cascades_within_one_run() {
        let mut b = builder();
        let k1 = b.kint(2).unwrap();
        let k2 = b.kint(3).unwrap();
        let add = b.emit2(IrOp::AddInt, IrType::Int, k1, k2).unwrap();
        let mul = b.emit2(IrOp::MulInt, IrType::Int, add, k2).unwrap();
        let store = b.emit2(IrOp::Store, IrType::Nil, k1, mul).unwrap();

        ConstantFolding.run(&mut b);
        let folded = b.ins(store).op2;
        assert!(irref_is_const(folded));
        assert_eq!(b.const_val(folded), IrConst::Int(15));
    }

    #[test]
    fn test_folding_skips_division_by_zero() {
        let mut b = builder();
        let k1 = b.kint(1).unwrap();
        let k0 = b.kint(0).unwrap();
        let div = b.emit2(IrOp::DivInt, IrType::Int, k1, k0).unwrap();
        assert_eq!(ConstantFolding.run(&mut b), 0);
        assert_eq!(b.ins(div).op, IrOp::DivInt);
    }

    #[test]
    fn test_type_narrowing() {
        let mut b = builder();
        let load = b.emit1(IrOp::Load, IrType::Int, 0).unwrap();
        let k = b.knum(2.0).unwrap();
        let add = b.emit2(IrOp::AddNum, IrType::Num, load, k).unwrap();

        assert_eq!(TypeNarrowing.run(&mut b), 1);
        let ins = *b.ins(add);
        assert_eq!(ins.op, IrOp::AddInt);
        assert_eq!(ins.ty, IrType::Int);
        assert_eq!(b.const_val(ins.op2), IrConst::Int(2));
    }

    #[test]
    fn test_narrowing_keeps_fractional_floats() {
        let mut b = builder();
        let load = b.emit1(IrOp::Load, IrType::Int, 0).unwrap();
        let k = b.knum(2.5).unwrap();
        let add = b.emit2(IrOp::AddNum, IrType::Num, load, k).unwrap();
        assert_eq!(TypeNarrowing.run(&mut b), 0);
        assert_eq!(b.ins(add).op, IrOp::AddNum);
    }

    #[test]
    fn test_dce_drops_unreferenced_pure_ops() {
        let mut b = builder();
        let k1 = b.kint(1).unwrap();
        let k2 = b.kint(2).unwrap();
        let dead = b.emit2(IrOp::AddInt, IrType::Int, k1, k2).unwrap();
        let live = b.emit2(IrOp::SubInt, IrType::Int, k1, k2).unwrap();
        b.emit2(IrOp::Store, IrType::Nil, k1, live).unwrap();

        assert_eq!(DeadCodeElimination.run(&mut b), 1);
        assert_eq!(b.ins(dead).op, IrOp::Nop);
        assert_eq!(b.ins(live).op, IrOp::SubInt);
    }

    #[test]
    fn test_dce_keeps_guards() {
        let mut b = builder();
        let load = b.emit1(IrOp::Load, IrType::Unknown, 0).unwrap();
        let guard = b.emit1(IrOp::GuardInt, IrType::Int, load).unwrap();
        assert_eq!(DeadCodeElimination.run(&mut b), 0);
        assert_eq!(b.ins(guard).op, IrOp::GuardInt);
        assert_eq!(b.ins(load).op, IrOp::Load);
    }

    #[test]
    fn test_dce_soundness_after_fold() {
        // after folding, operands of the folded op become dead unless
        // referenced elsewhere; DCE must not leave unreachable pure ops
        let mut b = builder();
        let la = b.emit1(IrOp::Load, IrType::Int, 0).unwrap();
        let k2 = b.kint(2).unwrap();
        let k3 = b.kint(3).unwrap();
        let add = b.emit2(IrOp::AddInt, IrType::Int, k2, k3).unwrap();
        let mul = b.emit2(IrOp::MulInt, IrType::Int, la, add).unwrap();
        b.emit2(IrOp::Store, IrType::Nil, la, mul).unwrap();

        let opt = Optimizer::new(OptConfig::default());
        let stats = opt.run(&mut b);
        assert!(stats.folded >= 1);

        // no non-NOP pure op may be unreachable from a live instruction
        let len = b.len();
        let mut referenced = vec![false; len];
        for idx in 0..len {
            let ins = b.ir()[idx];
            if ins.op == IrOp::Nop {
                continue;
            }
            for r in [ins.op1, ins.op2] {
                if r >= IRREF_BIAS {
                    referenced[(r - IRREF_BIAS) as usize] = true;
                }
            }
        }
        for idx in 0..len {
            let ins = b.ir()[idx];
            if ins.op != IrOp::Nop && ins.op.is_pure() && !referenced[idx] {
                panic!("unreachable pure op survived at {idx}: {ins:?}");
            }
        }
    }

    #[test]
    fn test_licm_counts_invariants() {
        let mut b = builder();
        let pre = b.emit1(IrOp::Load, IrType::Int, 0).unwrap();
        b.emit0(IrOp::Loop, IrType::Nil).unwrap();
        let k = b.kint(10).unwrap();
        // invariant: both operands defined before the loop
        b.emit2(IrOp::MulInt, IrType::Int, pre, k).unwrap();
        // variant: depends on an in-loop memory read
        let var = b.emit1(IrOp::Load, IrType::Int, 1).unwrap();
        b.emit2(IrOp::AddInt, IrType::Int, var, k).unwrap();

        assert_eq!(LoopInvariantMotion.run(&mut b), 1);
    }

    #[test]
    fn test_fixed_point_terminates_early() {
        let mut b = builder();
        let k1 = b.kint(1).unwrap();
        b.emit2(IrOp::Store, IrType::Nil, k1, k1).unwrap();
        let opt = Optimizer::new(OptConfig::default());
        let stats = opt.run(&mut b);
        // nothing to do: a single iteration suffices
        assert_eq!(stats.iterations, 1);
    }
}
