//! AArch64 trace emitter
//!
//! Same lowering contract as the x86-64 backend, with fixed-width A64
//! encodings. Branches use word-relative 19-bit (conditional) and 26-bit
//! (unconditional) offsets, patched by an arch-local fixup list rather
//! than the shared rel32 mechanism.
//!
//! Frame registers: the payload base lives in x19 and the tag base in
//! x20 (both callee-saved, preserved by the prologue). x9..x15 are the
//! allocatable scratch pool; d0..d7 carry floats. The exit index is
//! returned in w0.

use crate::error::JitError;
use crate::jit::types::{irref_is_const, IrConst, IrOp, IrRef, IrType, IRREF_BIAS};
use crate::value::TypeTag;

use super::{CodeBuffer, EmitInput, Label};

const XZR: u8 = 31;
const PAYLOAD_BASE: u8 = 19;
const TAG_BASE: u8 = 20;

/// Allocatable general-purpose registers (caller-saved scratch)
const GPR_POOL: [u8; 7] = [9, 10, 11, 12, 13, 14, 15];
/// Allocatable double registers
const FPR_POOL: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

const SPILL_AREA: u32 = 256;
const MAX_SPILL: u16 = 31;

/// A64 condition codes
mod cond {
    pub const EQ: u8 = 0x0;
    pub const NE: u8 = 0x1;
    pub const CC: u8 = 0x3; // unsigned lower (fcmp lt)
    pub const LS: u8 = 0x9; // unsigned lower-or-same
    pub const HI: u8 = 0x8;
    pub const CS: u8 = 0x2;
    pub const GE: u8 = 0xA;
    pub const LT: u8 = 0xB;
    pub const GT: u8 = 0xC;
    pub const LE: u8 = 0xD;

    /// Invert, as `cset` encodes the inverted condition
    pub fn invert(c: u8) -> u8 {
        c ^ 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    None,
    Gpr(u8),
    Fpr(u8),
    Spill(u16),
}

#[derive(Debug, Clone, Copy)]
enum FixKind {
    /// b imm26
    Branch,
    /// b.cond imm19
    CondBranch,
}

struct Fixup {
    /// Byte offset of the instruction word
    at: usize,
    target: Label,
    kind: FixKind,
}

struct A64 {
    buf: CodeBuffer,
    fixups: Vec<Fixup>,
    loc: Vec<Loc>,
    last_use: Vec<usize>,
    free_gpr: u16,
    free_fpr: u16,
    spill_next: u16,
    locked: Vec<Loc>,
    exit_labels: Vec<Label>,
    epilogue: Label,
    body: Label,
    cur_snapshot: usize,
}

impl A64 {
    #[inline]
    fn word(&mut self, w: u32) {
        self.buf.emit_u32(w);
    }

    // ===== Encoders =====

    /// movz/movk sequence materialising a 64-bit immediate
    fn mov_ri(&mut self, rd: u8, imm: i64) {
        let bits = imm as u64;
        self.word(0xD280_0000 | ((bits & 0xFFFF) as u32) << 5 | rd as u32);
        for hw in 1..4u32 {
            let part = (bits >> (16 * hw)) & 0xFFFF;
            if part != 0 {
                self.word(0xF280_0000 | hw << 21 | (part as u32) << 5 | rd as u32);
            }
        }
    }

    /// orr rd, xzr, rm
    fn mov_rr(&mut self, rd: u8, rm: u8) {
        self.word(0xAA00_03E0 | (rm as u32) << 16 | rd as u32);
    }

    /// ldr rd, [rn, #imm] (scaled by 8)
    fn ldr(&mut self, rd: u8, rn: u8, imm: u32) {
        debug_assert_eq!(imm % 8, 0);
        self.word(0xF940_0000 | (imm / 8) << 10 | (rn as u32) << 5 | rd as u32);
    }

    /// str rd, [rn, #imm]
    fn str(&mut self, rd: u8, rn: u8, imm: u32) {
        debug_assert_eq!(imm % 8, 0);
        self.word(0xF900_0000 | (imm / 8) << 10 | (rn as u32) << 5 | rd as u32);
    }

    /// ldrb wd, [rn, #imm]
    fn ldrb(&mut self, rd: u8, rn: u8, imm: u32) {
        self.word(0x3940_0000 | imm << 10 | (rn as u32) << 5 | rd as u32);
    }

    /// Three-register data op; base picks add/sub/and/orr/eor/etc
    fn rrr(&mut self, base: u32, rd: u8, rn: u8, rm: u8) {
        self.word(base | (rm as u32) << 16 | (rn as u32) << 5 | rd as u32);
    }

    /// cmp rn, rm (subs xzr, rn, rm)
    fn cmp_rr(&mut self, rn: u8, rm: u8) {
        self.rrr(0xEB00_0000, XZR, rn, rm);
    }

    /// cmp rn, #imm12
    fn cmp_ri(&mut self, rn: u8, imm: u32) {
        self.word(0xF100_0000 | imm << 10 | (rn as u32) << 5 | XZR as u32);
    }

    /// cset rd, cond
    fn cset(&mut self, rd: u8, c: u8) {
        self.word(0x9A9F_07E0 | (cond::invert(c) as u32) << 12 | rd as u32);
    }

    fn b(&mut self, target: Label) {
        self.fixups.push(Fixup {
            at: self.buf.pos(),
            target,
            kind: FixKind::Branch,
        });
        self.word(0x1400_0000);
    }

    fn b_cond(&mut self, c: u8, target: Label) {
        self.fixups.push(Fixup {
            at: self.buf.pos(),
            target,
            kind: FixKind::CondBranch,
        });
        self.word(0x5400_0000 | c as u32);
    }

    /// movz w0, #imm16 (the exit index)
    fn mov_w0(&mut self, imm: u16) {
        self.word(0x5280_0000 | (imm as u32) << 5);
    }

    /// ldr dd, [rn, #imm]
    fn fldr(&mut self, dd: u8, rn: u8, imm: u32) {
        self.word(0xFD40_0000 | (imm / 8) << 10 | (rn as u32) << 5 | dd as u32);
    }

    /// str dd, [rn, #imm]
    fn fstr(&mut self, dd: u8, rn: u8, imm: u32) {
        self.word(0xFD00_0000 | (imm / 8) << 10 | (rn as u32) << 5 | dd as u32);
    }

    /// fmov dd, xn
    fn fmov_d_x(&mut self, dd: u8, xn: u8) {
        self.word(0x9E67_0000 | (xn as u32) << 5 | dd as u32);
    }

    /// Scalar double arithmetic (fadd 0x1E602800 etc.)
    fn frrr(&mut self, base: u32, dd: u8, dn: u8, dm: u8) {
        self.word(base | (dm as u32) << 16 | (dn as u32) << 5 | dd as u32);
    }

    /// fcmp dn, dm
    fn fcmp(&mut self, dn: u8, dm: u8) {
        self.word(0x1E60_2000 | (dm as u32) << 16 | (dn as u32) << 5);
    }

    /// scvtf dd, xn
    fn scvtf(&mut self, dd: u8, xn: u8) {
        self.word(0x9E62_0000 | (xn as u32) << 5 | dd as u32);
    }

    /// fcvtzs xd, dn
    fn fcvtzs(&mut self, xd: u8, dn: u8) {
        self.word(0x9E78_0000 | (dn as u32) << 5 | xd as u32);
    }

    // ===== Register allocation (same scheme as x64) =====

    fn lock(&mut self, loc: Loc) {
        self.locked.push(loc);
    }

    fn is_locked(&self, loc: Loc) -> bool {
        self.locked.contains(&loc)
    }

    fn spill_off(slot: u16) -> u32 {
        8 * slot as u32
    }

    fn alloc_gpr(&mut self) -> Result<u8, JitError> {
        for &reg in &GPR_POOL {
            if self.free_gpr & (1 << reg) != 0 {
                self.free_gpr &= !(1 << reg);
                return Ok(reg);
            }
        }
        let victim = (0..self.loc.len())
            .find(|&i| matches!(self.loc[i], Loc::Gpr(r) if !self.is_locked(Loc::Gpr(r))));
        let Some(victim) = victim else {
            return Err(JitError::NotYetImplemented);
        };
        let Loc::Gpr(reg) = self.loc[victim] else {
            unreachable!()
        };
        if self.spill_next >= MAX_SPILL {
            return Err(JitError::NotYetImplemented);
        }
        let slot = self.spill_next;
        self.spill_next += 1;
        self.str(reg, 31, Self::spill_off(slot)); // [sp, #off]
        self.loc[victim] = Loc::Spill(slot);
        Ok(reg)
    }

    fn alloc_fpr(&mut self) -> Result<u8, JitError> {
        for &reg in &FPR_POOL {
            if self.free_fpr & (1 << reg) != 0 {
                self.free_fpr &= !(1 << reg);
                return Ok(reg);
            }
        }
        Err(JitError::NotYetImplemented)
    }

    fn release(&mut self, loc: Loc) {
        match loc {
            Loc::Gpr(r) => self.free_gpr |= 1 << r,
            Loc::Fpr(d) => self.free_fpr |= 1 << d,
            _ => {}
        }
    }

    fn free_dead(&mut self, idx: usize, op1: IrRef, op2: IrRef) {
        for r in [op1, op2] {
            if r >= IRREF_BIAS {
                let pos = (r - IRREF_BIAS) as usize;
                if self.last_use[pos] == idx {
                    let loc = self.loc[pos];
                    self.release(loc);
                    self.loc[pos] = Loc::None;
                }
            }
        }
    }

    fn release_transients(&mut self) {
        for loc in std::mem::take(&mut self.locked) {
            match loc {
                Loc::Gpr(r) => {
                    if GPR_POOL.contains(&r) && !self.loc.contains(&Loc::Gpr(r)) {
                        self.free_gpr |= 1 << r;
                    }
                }
                Loc::Fpr(d) => {
                    if !self.loc.contains(&Loc::Fpr(d)) {
                        self.free_fpr |= 1 << d;
                    }
                }
                _ => {}
            }
        }
    }

    // ===== Operands =====

    fn const_of(&self, input: &EmitInput<'_>, r: IrRef) -> Option<IrConst> {
        if irref_is_const(r) {
            input.consts.get(r as usize).copied()
        } else {
            None
        }
    }

    fn to_gpr(&mut self, input: &EmitInput<'_>, r: IrRef) -> Result<u8, JitError> {
        if let Some(k) = self.const_of(input, r) {
            let imm = match k {
                IrConst::Int(i) => i,
                IrConst::Ptr(p) => p as i64,
                IrConst::Num(_) => return Err(JitError::NotYetImplemented),
            };
            let reg = self.alloc_gpr()?;
            self.mov_ri(reg, imm);
            self.lock(Loc::Gpr(reg));
            return Ok(reg);
        }
        let pos = (r - IRREF_BIAS) as usize;
        match self.loc[pos] {
            Loc::Gpr(reg) => {
                self.lock(Loc::Gpr(reg));
                Ok(reg)
            }
            Loc::Spill(slot) => {
                let reg = self.alloc_gpr()?;
                self.ldr(reg, 31, Self::spill_off(slot));
                self.loc[pos] = Loc::Gpr(reg);
                self.lock(Loc::Gpr(reg));
                Ok(reg)
            }
            _ => Err(JitError::NotYetImplemented),
        }
    }

    fn to_fpr(&mut self, input: &EmitInput<'_>, r: IrRef) -> Result<u8, JitError> {
        if let Some(k) = self.const_of(input, r) {
            let bits = match k {
                IrConst::Num(n) => n.to_bits() as i64,
                IrConst::Int(i) => (i as f64).to_bits() as i64,
                IrConst::Ptr(_) => return Err(JitError::NotYetImplemented),
            };
            let d = self.alloc_fpr()?;
            self.mov_ri(8, bits); // x8 scratch
            self.fmov_d_x(d, 8);
            self.lock(Loc::Fpr(d));
            return Ok(d);
        }
        let pos = (r - IRREF_BIAS) as usize;
        match self.loc[pos] {
            Loc::Fpr(d) => {
                self.lock(Loc::Fpr(d));
                Ok(d)
            }
            Loc::Spill(slot) => {
                let d = self.alloc_fpr()?;
                self.fldr(d, 31, Self::spill_off(slot));
                self.loc[pos] = Loc::Fpr(d);
                self.lock(Loc::Fpr(d));
                Ok(d)
            }
            _ => Err(JitError::NotYetImplemented),
        }
    }

    fn slot_of_load(&self, input: &EmitInput<'_>, r: IrRef) -> Result<u32, JitError> {
        if r < IRREF_BIAS {
            return Err(JitError::NotYetImplemented);
        }
        let ins = input.ir[(r - IRREF_BIAS) as usize];
        if ins.op != IrOp::Load {
            return Err(JitError::NotYetImplemented);
        }
        match self.const_of(input, ins.op1) {
            Some(IrConst::Int(slot)) if slot >= 0 => Ok(slot as u32),
            _ => Err(JitError::NotYetImplemented),
        }
    }

    fn resolve_fixups(mut self) -> Result<Vec<u8>, JitError> {
        let fixups = std::mem::take(&mut self.fixups);
        for fix in &fixups {
            let target = self.buf.label_pos(fix.target).ok_or(JitError::Memory)?;
            let delta_words = (target as i64 - fix.at as i64) / 4;
            let code = self.buf.code_mut();
            let mut word = u32::from_le_bytes(code[fix.at..fix.at + 4].try_into().unwrap());
            match fix.kind {
                FixKind::Branch => {
                    let imm26 = (delta_words as u32) & 0x03FF_FFFF;
                    word |= imm26;
                }
                FixKind::CondBranch => {
                    let imm19 = (delta_words as u32) & 0x0007_FFFF;
                    word |= imm19 << 5;
                }
            }
            code[fix.at..fix.at + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.buf.finish()
    }
}

fn tag_byte(ty: IrType) -> Option<u8> {
    Some(match ty {
        IrType::Nil => TypeTag::Nil as u8,
        IrType::False => TypeTag::False as u8,
        IrType::True => TypeTag::True as u8,
        IrType::Int => TypeTag::Int as u8,
        IrType::Num => TypeTag::Float as u8,
        IrType::Str => TypeTag::ShortStr as u8,
        IrType::Tab => TypeTag::Table as u8,
        IrType::Func => TypeTag::Closure as u8,
        _ => return None,
    })
}

/// Emit a complete trace body with exit stubs and epilogue
pub fn emit(input: &EmitInput<'_>) -> Result<Vec<u8>, JitError> {
    let len = input.ir.len();
    let mut e = A64 {
        buf: CodeBuffer::new(),
        fixups: Vec::new(),
        loc: vec![Loc::None; len],
        last_use: vec![0; len],
        free_gpr: GPR_POOL.iter().fold(0u16, |m, &r| m | 1 << r),
        free_fpr: FPR_POOL.iter().fold(0u16, |m, &r| m | 1 << r),
        spill_next: 0,
        locked: Vec::new(),
        exit_labels: Vec::new(),
        epilogue: Label(0),
        body: Label(0),
        cur_snapshot: 0,
    };

    for (idx, ins) in input.ir.iter().enumerate() {
        if ins.op == IrOp::Snapshot {
            continue;
        }
        for r in [ins.op1, ins.op2] {
            if r >= IRREF_BIAS {
                e.last_use[(r - IRREF_BIAS) as usize] = idx;
            }
        }
    }

    e.epilogue = e.buf.new_label();
    e.body = e.buf.new_label();
    for _ in input.exits {
        let l = e.buf.new_label();
        e.exit_labels.push(l);
    }

    // ===== Prologue =====
    e.word(0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
    e.word(0x9100_03FD); // mov x29, sp
    e.word(0xA9BF_53F3); // stp x19, x20, [sp, #-16]!
    e.word(0xD100_03FF | SPILL_AREA << 10); // sub sp, sp, #SPILL_AREA
    e.ldr(PAYLOAD_BASE, 0, 0); // x19 = frame->payloads
    e.ldr(TAG_BASE, 0, 8); // x20 = frame->tags
    let body = e.body;
    e.buf.bind(body);

    // ===== Body =====
    for idx in 0..len {
        let ins = input.ir[idx];
        e.locked.clear();

        match ins.op {
            IrOp::Nop => {}
            IrOp::Snapshot => e.cur_snapshot = ins.op1 as usize,
            IrOp::Loop => {
                let body = e.body;
                e.b(body);
            }
            IrOp::Ret => {
                let exit = e
                    .exit_labels
                    .get(e.cur_snapshot)
                    .copied()
                    .ok_or(JitError::NotYetImplemented)?;
                e.b(exit);
            }
            IrOp::Load => {
                let slot = match e.const_of(input, ins.op1) {
                    Some(IrConst::Int(s)) if s >= 0 => s as u32,
                    _ => return Err(JitError::NotYetImplemented),
                };
                if ins.ty == IrType::Num {
                    let d = e.alloc_fpr()?;
                    e.fldr(d, PAYLOAD_BASE, slot * 8);
                    e.loc[idx] = Loc::Fpr(d);
                } else {
                    let r = e.alloc_gpr()?;
                    e.ldr(r, PAYLOAD_BASE, slot * 8);
                    e.loc[idx] = Loc::Gpr(r);
                }
            }
            IrOp::Store => {
                let slot = match e.const_of(input, ins.op1) {
                    Some(IrConst::Int(s)) if s >= 0 => s as u32,
                    _ => return Err(JitError::NotYetImplemented),
                };
                let tag = tag_byte(ins.ty).ok_or(JitError::NotYetImplemented)?;
                if ins.ty == IrType::Num {
                    let d = e.to_fpr(input, ins.op2)?;
                    e.fstr(d, PAYLOAD_BASE, slot * 8);
                } else {
                    let r = e.to_gpr(input, ins.op2)?;
                    e.str(r, PAYLOAD_BASE, slot * 8);
                }
                // strb w8, [x20, #slot] with the tag in w8
                e.mov_ri(8, tag as i64);
                e.word(0x3900_0000 | slot << 10 | (TAG_BASE as u32) << 5 | 8);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::AddInt | IrOp::SubInt | IrOp::MulInt | IrOp::Band | IrOp::Bor | IrOp::Bxor
            | IrOp::Shl | IrOp::Shr => {
                let lhs = e.to_gpr(input, ins.op1)?;
                let rhs = e.to_gpr(input, ins.op2)?;
                let dst = e.alloc_gpr()?;
                e.lock(Loc::Gpr(dst));
                match ins.op {
                    IrOp::AddInt => e.rrr(0x8B00_0000, dst, lhs, rhs),
                    IrOp::SubInt => e.rrr(0xCB00_0000, dst, lhs, rhs),
                    IrOp::MulInt => e.rrr(0x9B00_7C00, dst, lhs, rhs),
                    IrOp::Band => e.rrr(0x8A00_0000, dst, lhs, rhs),
                    IrOp::Bor => e.rrr(0xAA00_0000, dst, lhs, rhs),
                    IrOp::Bxor => e.rrr(0xCA00_0000, dst, lhs, rhs),
                    IrOp::Shl => e.rrr(0x9AC0_2000, dst, lhs, rhs),
                    IrOp::Shr => e.rrr(0x9AC0_2400, dst, lhs, rhs),
                    _ => unreachable!(),
                }
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::DivInt | IrOp::ModInt => {
                let lhs = e.to_gpr(input, ins.op1)?;
                let rhs = e.to_gpr(input, ins.op2)?;
                let dst = e.alloc_gpr()?;
                e.lock(Loc::Gpr(dst));
                if ins.op == IrOp::DivInt {
                    e.rrr(0x9AC0_0C00, dst, lhs, rhs); // sdiv
                } else {
                    e.rrr(0x9AC0_0C00, 8, lhs, rhs); // sdiv x8, lhs, rhs
                    // msub dst, x8, rhs, lhs
                    e.word(0x9B00_8000 | (rhs as u32) << 16 | (lhs as u32) << 10 | 8 << 5 | dst as u32);
                }
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::NegInt => {
                let src = e.to_gpr(input, ins.op1)?;
                let dst = e.alloc_gpr()?;
                e.rrr(0xCB00_0000, dst, XZR, src); // sub dst, xzr, src
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::AddNum | IrOp::SubNum | IrOp::MulNum | IrOp::DivNum => {
                let lhs = e.to_fpr(input, ins.op1)?;
                let rhs = e.to_fpr(input, ins.op2)?;
                let dst = e.alloc_fpr()?;
                e.lock(Loc::Fpr(dst));
                let base = match ins.op {
                    IrOp::AddNum => 0x1E60_2800,
                    IrOp::SubNum => 0x1E60_3800,
                    IrOp::MulNum => 0x1E60_0800,
                    IrOp::DivNum => 0x1E60_1800,
                    _ => unreachable!(),
                };
                e.frrr(base, dst, lhs, rhs);
                e.loc[idx] = Loc::Fpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::NegNum => {
                let src = e.to_fpr(input, ins.op1)?;
                let dst = e.alloc_fpr()?;
                e.word(0x1E61_4000 | (src as u32) << 5 | dst as u32); // fneg
                e.loc[idx] = Loc::Fpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::ConvIntNum => {
                let src = e.to_gpr(input, ins.op1)?;
                let dst = e.alloc_fpr()?;
                e.scvtf(dst, src);
                e.loc[idx] = Loc::Fpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::ConvNumInt => {
                let src = e.to_fpr(input, ins.op1)?;
                let dst = e.alloc_gpr()?;
                e.fcvtzs(dst, src);
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::Eq | IrOp::Ne | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge => {
                let float = operand_is_num(input, ins.op1) || operand_is_num(input, ins.op2);
                let c = if float {
                    let lhs = e.to_fpr(input, ins.op1)?;
                    let rhs = e.to_fpr(input, ins.op2)?;
                    e.fcmp(lhs, rhs);
                    match ins.op {
                        IrOp::Eq => cond::EQ,
                        IrOp::Ne => cond::NE,
                        IrOp::Lt => cond::CC,
                        IrOp::Le => cond::LS,
                        IrOp::Gt => cond::HI,
                        IrOp::Ge => cond::CS,
                        _ => unreachable!(),
                    }
                } else {
                    let lhs = e.to_gpr(input, ins.op1)?;
                    if let Some(IrConst::Int(i)) = e.const_of(input, ins.op2) {
                        if (0..4096).contains(&i) {
                            e.cmp_ri(lhs, i as u32);
                        } else {
                            let rhs = e.to_gpr(input, ins.op2)?;
                            e.cmp_rr(lhs, rhs);
                        }
                    } else {
                        let rhs = e.to_gpr(input, ins.op2)?;
                        e.cmp_rr(lhs, rhs);
                    }
                    match ins.op {
                        IrOp::Eq => cond::EQ,
                        IrOp::Ne => cond::NE,
                        IrOp::Lt => cond::LT,
                        IrOp::Le => cond::LE,
                        IrOp::Gt => cond::GT,
                        IrOp::Ge => cond::GE,
                        _ => unreachable!(),
                    }
                };
                let dst = e.alloc_gpr()?;
                e.cset(dst, c);
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::Jmpt | IrOp::Jmpf => {
                let cond_reg = e.to_gpr(input, ins.op1)?;
                let exit = e
                    .exit_labels
                    .get(e.cur_snapshot)
                    .copied()
                    .ok_or(JitError::NotYetImplemented)?;
                e.cmp_ri(cond_reg, 0);
                e.b_cond(
                    if ins.op == IrOp::Jmpt {
                        cond::EQ
                    } else {
                        cond::NE
                    },
                    exit,
                );
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            op if op.is_guard() => {
                let expected = match op {
                    IrOp::GuardInt => TypeTag::Int as u8,
                    IrOp::GuardNum => TypeTag::Float as u8,
                    IrOp::GuardStr => TypeTag::ShortStr as u8,
                    IrOp::GuardTab => TypeTag::Table as u8,
                    IrOp::GuardFunc => TypeTag::Closure as u8,
                    IrOp::GuardNil => TypeTag::Nil as u8,
                    IrOp::GuardType => match tag_byte(ins.ty) {
                        Some(t) => t,
                        None => return Err(JitError::NotYetImplemented),
                    },
                    _ => return Err(JitError::NotYetImplemented),
                };
                let slot = e.slot_of_load(input, ins.op1)?;
                let exit = e
                    .exit_labels
                    .get(e.cur_snapshot)
                    .copied()
                    .ok_or(JitError::NotYetImplemented)?;
                e.ldrb(8, TAG_BASE, slot);
                // cmp w8, #expected
                e.word(0x7100_0000 | (expected as u32) << 10 | 8 << 5 | XZR as u32);
                e.b_cond(cond::NE, exit);
            }
            _ => return Err(JitError::NotYetImplemented),
        }
    }

    // ===== Exit stubs =====
    for (i, &label) in e.exit_labels.clone().iter().enumerate() {
        e.buf.bind(label);
        e.mov_w0(i as u16);
        let epilogue = e.epilogue;
        e.b(epilogue);
    }

    // ===== Epilogue =====
    let epilogue = e.epilogue;
    e.buf.bind(epilogue);
    e.word(0x9100_03FF | SPILL_AREA << 10); // add sp, sp, #SPILL_AREA
    e.word(0xA8C1_53F3); // ldp x19, x20, [sp], #16
    e.word(0xA8C1_7BFD); // ldp x29, x30, [sp], #16
    e.word(0xD65F_03C0); // ret

    e.resolve_fixups()
}

fn operand_is_num(input: &EmitInput<'_>, r: IrRef) -> bool {
    if r < IRREF_BIAS {
        matches!(input.consts.get(r as usize), Some(IrConst::Num(_)))
    } else {
        input.ir[(r - IRREF_BIAS) as usize].ty == IrType::Num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::IrBuilder;
    use crate::jit::types::SideExit;

    #[test]
    fn test_emits_word_aligned_code() {
        let mut b = IrBuilder::new(256, 64);
        let slot = b.kint(0).unwrap();
        let load = b.emit1(IrOp::Load, IrType::Int, slot).unwrap();
        b.emit1(IrOp::Snapshot, IrType::Nil, 0).unwrap();
        b.emit1(IrOp::GuardInt, IrType::Int, load).unwrap();
        let one = b.kint(1).unwrap();
        let add = b.emit2(IrOp::AddInt, IrType::Int, load, one).unwrap();
        b.emit2(IrOp::Store, IrType::Int, slot, add).unwrap();
        b.emit0(IrOp::Loop, IrType::Nil).unwrap();
        let (ir, consts) = b.snapshot_buffers();

        let code = emit(&EmitInput {
            ir: &ir,
            consts: &consts,
            exits: &[SideExit { pc: 0, snapshot: 0 }],
        })
        .unwrap();
        assert_eq!(code.len() % 4, 0);
        // prologue starts with stp x29, x30, [sp, #-16]!
        assert_eq!(&code[0..4], &0xA9BF_7BFDu32.to_le_bytes());
        // the final word is ret
        assert_eq!(&code[code.len() - 4..], &0xD65F_03C0u32.to_le_bytes());
    }

    #[test]
    fn test_unsupported_ir_reports_nyi() {
        let mut b = IrBuilder::new(64, 16);
        let k = b.kint(0).unwrap();
        b.emit2(IrOp::Strcat, IrType::Str, k, k).unwrap();
        let (ir, consts) = b.snapshot_buffers();
        assert_eq!(
            emit(&EmitInput {
                ir: &ir,
                consts: &consts,
                exits: &[],
            })
            .unwrap_err(),
            JitError::NotYetImplemented
        );
    }
}
