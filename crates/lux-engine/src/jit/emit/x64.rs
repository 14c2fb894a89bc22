//! x86-64 trace emitter
//!
//! Lowers the linear IR into position-independent machine code. The
//! register allocator is one-pass over the IR with a free-GPR/free-XMM
//! bitset; operands are freed at their last use, and when no register is
//! free the live binding with the lowest IR reference is spilled to the
//! frame (the first-in-allocation-order choice). Guards compare slot tags
//! against the frame's tag bytes and branch to per-snapshot exit stubs
//! emitted after the body; every stub loads its exit index and jumps to
//! the shared epilogue.
//!
//! Frame registers: the payload base pointer lives in RBX, the tag base
//! pointer in R13, both loaded from the `TraceFrame` argument. RAX, RCX,
//! and RDX are scratch (setcc, shifts, idiv); everything else general
//! purpose is allocatable.

use crate::error::JitError;
use crate::jit::types::{irref_is_const, IrConst, IrOp, IrRef, IrType, IRREF_BIAS};
use crate::value::TypeTag;

use super::{CodeBuffer, EmitInput, Label};

// GPR numbering
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

/// First integer argument register of the host ABI
#[cfg(windows)]
const ARG0: u8 = RCX;
#[cfg(not(windows))]
const ARG0: u8 = RDI;

/// Allocatable general-purpose registers
const GPR_POOL: [u8; 8] = [RSI, RDI, R8, R9, R10, R11, R14, R15];
/// Allocatable XMM registers
const XMM_POOL: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Fixed spill area inside the frame
const FRAME_SIZE: i32 = 256;
const SPILL_BASE: i32 = 40;
const MAX_SPILL: u16 = 31;

/// Where an IR value currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    None,
    Gpr(u8),
    Xmm(u8),
    Spill(u16),
}

struct X64 {
    buf: CodeBuffer,
    loc: Vec<Loc>,
    last_use: Vec<usize>,
    free_gpr: u16,
    free_xmm: u16,
    spill_next: u16,
    /// Registers pinned for the instruction being lowered
    locked: Vec<Loc>,
    exit_labels: Vec<Label>,
    epilogue: Label,
    body: Label,
    cur_snapshot: usize,
}

#[inline]
fn rex(w: bool, reg: u8, rm: u8) -> u8 {
    0x40 | (w as u8) << 3 | (reg >> 3) << 2 | (rm >> 3)
}

#[inline]
fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    md << 6 | (reg & 7) << 3 | (rm & 7)
}

/// Condition codes for setcc/jcc
mod cc {
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const B: u8 = 0x2;
    pub const BE: u8 = 0x6;
    pub const A: u8 = 0x7;
    pub const AE: u8 = 0x3;
    pub const L: u8 = 0xC;
    pub const GE: u8 = 0xD;
    pub const LE: u8 = 0xE;
    pub const G: u8 = 0xF;
}

impl X64 {
    // ===== Instruction encoders =====

    fn mov_ri(&mut self, reg: u8, imm: i64) {
        self.buf.emit_u8(rex(true, 0, reg));
        self.buf.emit_u8(0xB8 + (reg & 7));
        self.buf.emit_u64(imm as u64);
    }

    fn mov_rr(&mut self, dst: u8, src: u8) {
        self.buf.emit_u8(rex(true, src, dst));
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(modrm(3, src, dst));
    }

    /// mov dst, [base + disp32]
    fn mov_r_mem(&mut self, dst: u8, base: u8, disp: i32) {
        self.buf.emit_u8(rex(true, dst, base));
        self.buf.emit_u8(0x8B);
        self.buf.emit_u8(modrm(2, dst, base));
        self.buf.emit_u32(disp as u32);
    }

    /// mov [base + disp32], src
    fn mov_mem_r(&mut self, base: u8, disp: i32, src: u8) {
        self.buf.emit_u8(rex(true, src, base));
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(modrm(2, src, base));
        self.buf.emit_u32(disp as u32);
    }

    /// mov byte [base + disp32], imm8
    fn mov_mem8_imm(&mut self, base: u8, disp: i32, imm: u8) {
        if base >= 8 {
            self.buf.emit_u8(rex(false, 0, base));
        }
        self.buf.emit_u8(0xC6);
        self.buf.emit_u8(modrm(2, 0, base));
        self.buf.emit_u32(disp as u32);
        self.buf.emit_u8(imm);
    }

    /// cmp byte [base + disp32], imm8
    fn cmp_mem8_imm(&mut self, base: u8, disp: i32, imm: u8) {
        if base >= 8 {
            self.buf.emit_u8(rex(false, 0, base));
        }
        self.buf.emit_u8(0x80);
        self.buf.emit_u8(modrm(2, 7, base));
        self.buf.emit_u32(disp as u32);
        self.buf.emit_u8(imm);
    }

    /// Two-register ALU op (add 0x01, sub 0x29, and 0x21, or 0x09,
    /// xor 0x31, cmp 0x39)
    fn alu_rr(&mut self, opcode: u8, dst: u8, src: u8) {
        self.buf.emit_u8(rex(true, src, dst));
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(modrm(3, src, dst));
    }

    /// ALU op with imm32 (slash = opcode extension)
    fn alu_ri(&mut self, slash: u8, dst: u8, imm: i32) {
        self.buf.emit_u8(rex(true, 0, dst));
        self.buf.emit_u8(0x81);
        self.buf.emit_u8(modrm(3, slash, dst));
        self.buf.emit_u32(imm as u32);
    }

    fn imul_rr(&mut self, dst: u8, src: u8) {
        self.buf.emit_u8(rex(true, dst, src));
        self.buf.emit_bytes(&[0x0F, 0xAF]);
        self.buf.emit_u8(modrm(3, dst, src));
    }

    fn neg_r(&mut self, reg: u8) {
        self.buf.emit_u8(rex(true, 0, reg));
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(modrm(3, 3, reg));
    }

    fn test_rr(&mut self, a: u8, b: u8) {
        self.buf.emit_u8(rex(true, b, a));
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(modrm(3, b, a));
    }

    /// Shift dst by CL (shl /4, shr /5, sar /7)
    fn shift_cl(&mut self, slash: u8, dst: u8) {
        self.buf.emit_u8(rex(true, 0, dst));
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(modrm(3, slash, dst));
    }

    fn cqo(&mut self) {
        self.buf.emit_bytes(&[0x48, 0x99]);
    }

    fn idiv_r(&mut self, reg: u8) {
        self.buf.emit_u8(rex(true, 0, reg));
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(modrm(3, 7, reg));
    }

    /// setcc al
    fn setcc_al(&mut self, cond: u8) {
        self.buf.emit_bytes(&[0x0F, 0x90 + cond]);
        self.buf.emit_u8(modrm(3, 0, RAX));
    }

    /// movzx dst, al
    fn movzx_r_al(&mut self, dst: u8) {
        self.buf.emit_u8(rex(true, dst, RAX));
        self.buf.emit_bytes(&[0x0F, 0xB6]);
        self.buf.emit_u8(modrm(3, dst, RAX));
    }

    fn jcc(&mut self, cond: u8, target: Label) {
        self.buf.emit_bytes(&[0x0F, 0x80 + cond]);
        self.buf.emit_rel32(target);
    }

    fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_rel32(target);
    }

    fn push_r(&mut self, reg: u8) {
        if reg >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + (reg & 7));
    }

    fn pop_r(&mut self, reg: u8) {
        if reg >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + (reg & 7));
    }

    // SSE scalar-double helpers; the mandatory prefix precedes REX

    fn movsd_x_mem(&mut self, x: u8, base: u8, disp: i32) {
        self.buf.emit_u8(0xF2);
        if x >= 8 || base >= 8 {
            self.buf.emit_u8(rex(false, x, base));
        }
        self.buf.emit_bytes(&[0x0F, 0x10]);
        self.buf.emit_u8(modrm(2, x, base));
        self.buf.emit_u32(disp as u32);
    }

    fn movsd_mem_x(&mut self, base: u8, disp: i32, x: u8) {
        self.buf.emit_u8(0xF2);
        if x >= 8 || base >= 8 {
            self.buf.emit_u8(rex(false, x, base));
        }
        self.buf.emit_bytes(&[0x0F, 0x11]);
        self.buf.emit_u8(modrm(2, x, base));
        self.buf.emit_u32(disp as u32);
    }

    fn movsd_xx(&mut self, dst: u8, src: u8) {
        self.buf.emit_u8(0xF2);
        if dst >= 8 || src >= 8 {
            self.buf.emit_u8(rex(false, dst, src));
        }
        self.buf.emit_bytes(&[0x0F, 0x10]);
        self.buf.emit_u8(modrm(3, dst, src));
    }

    /// addsd 0x58, mulsd 0x59, subsd 0x5C, divsd 0x5E
    fn sse_arith(&mut self, opcode: u8, dst: u8, src: u8) {
        self.buf.emit_u8(0xF2);
        if dst >= 8 || src >= 8 {
            self.buf.emit_u8(rex(false, dst, src));
        }
        self.buf.emit_bytes(&[0x0F, opcode]);
        self.buf.emit_u8(modrm(3, dst, src));
    }

    fn ucomisd(&mut self, a: u8, b: u8) {
        self.buf.emit_u8(0x66);
        if a >= 8 || b >= 8 {
            self.buf.emit_u8(rex(false, a, b));
        }
        self.buf.emit_bytes(&[0x0F, 0x2E]);
        self.buf.emit_u8(modrm(3, a, b));
    }

    fn cvtsi2sd(&mut self, x: u8, r: u8) {
        self.buf.emit_u8(0xF2);
        self.buf.emit_u8(rex(true, x, r));
        self.buf.emit_bytes(&[0x0F, 0x2A]);
        self.buf.emit_u8(modrm(3, x, r));
    }

    fn cvttsd2si(&mut self, r: u8, x: u8) {
        self.buf.emit_u8(0xF2);
        self.buf.emit_u8(rex(true, r, x));
        self.buf.emit_bytes(&[0x0F, 0x2C]);
        self.buf.emit_u8(modrm(3, r, x));
    }

    /// movq xmm, r64
    fn movq_x_r(&mut self, x: u8, r: u8) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(rex(true, x, r));
        self.buf.emit_bytes(&[0x0F, 0x6E]);
        self.buf.emit_u8(modrm(3, x, r));
    }

    /// btc r64, imm8 (used to flip the sign bit for float negation)
    fn btc_ri(&mut self, reg: u8, bit: u8) {
        self.buf.emit_u8(rex(true, 0, reg));
        self.buf.emit_bytes(&[0x0F, 0xBA]);
        self.buf.emit_u8(modrm(3, 7, reg));
        self.buf.emit_u8(bit);
    }

    /// movq r64, xmm
    fn movq_r_x(&mut self, r: u8, x: u8) {
        self.buf.emit_u8(0x66);
        self.buf.emit_u8(rex(true, x, r));
        self.buf.emit_bytes(&[0x0F, 0x7E]);
        self.buf.emit_u8(modrm(3, x, r));
    }

    // ===== Register allocation =====

    fn lock(&mut self, loc: Loc) {
        self.locked.push(loc);
    }

    fn is_locked(&self, loc: Loc) -> bool {
        self.locked.contains(&loc)
    }

    fn spill_slot(&mut self) -> Result<u16, JitError> {
        if self.spill_next >= MAX_SPILL {
            return Err(JitError::NotYetImplemented);
        }
        let slot = self.spill_next;
        self.spill_next += 1;
        Ok(slot)
    }

    fn spill_off(slot: u16) -> i32 {
        -(SPILL_BASE + 8 * slot as i32)
    }

    fn alloc_gpr(&mut self) -> Result<u8, JitError> {
        for &reg in &GPR_POOL {
            if self.free_gpr & (1 << reg) != 0 {
                self.free_gpr &= !(1 << reg);
                return Ok(reg);
            }
        }
        // spill the live binding with the lowest IR reference
        let victim = (0..self.loc.len()).find(|&i| {
            matches!(self.loc[i], Loc::Gpr(r) if !self.is_locked(Loc::Gpr(r)))
        });
        let Some(victim) = victim else {
            return Err(JitError::NotYetImplemented);
        };
        let Loc::Gpr(reg) = self.loc[victim] else {
            unreachable!()
        };
        let slot = self.spill_slot()?;
        self.mov_mem_r(RBP, Self::spill_off(slot), reg);
        self.loc[victim] = Loc::Spill(slot);
        Ok(reg)
    }

    fn alloc_xmm(&mut self) -> Result<u8, JitError> {
        for &reg in &XMM_POOL {
            if self.free_xmm & (1 << reg) != 0 {
                self.free_xmm &= !(1 << reg);
                return Ok(reg);
            }
        }
        Err(JitError::NotYetImplemented)
    }

    fn release(&mut self, loc: Loc) {
        match loc {
            Loc::Gpr(r) => self.free_gpr |= 1 << r,
            Loc::Xmm(x) => self.free_xmm |= 1 << x,
            _ => {}
        }
    }

    /// Free operand registers whose value dies at `idx`
    fn free_dead(&mut self, idx: usize, ins_op1: IrRef, ins_op2: IrRef) {
        for r in [ins_op1, ins_op2] {
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

    // ===== Operand access =====

    fn const_of<'a>(&self, input: &EmitInput<'a>, r: IrRef) -> Option<IrConst> {
        if irref_is_const(r) {
            input.consts.get(r as usize).copied()
        } else {
            None
        }
    }

    /// Bring an integer-valued operand into a GPR
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
                self.mov_r_mem(reg, RBP, Self::spill_off(slot));
                self.loc[pos] = Loc::Gpr(reg);
                self.lock(Loc::Gpr(reg));
                Ok(reg)
            }
            _ => Err(JitError::NotYetImplemented),
        }
    }

    /// Bring a float-valued operand into an XMM register
    fn to_xmm(&mut self, input: &EmitInput<'_>, r: IrRef) -> Result<u8, JitError> {
        if let Some(k) = self.const_of(input, r) {
            let bits = match k {
                IrConst::Num(n) => n.to_bits() as i64,
                IrConst::Int(i) => (i as f64).to_bits() as i64,
                IrConst::Ptr(_) => return Err(JitError::NotYetImplemented),
            };
            let x = self.alloc_xmm()?;
            self.mov_ri(RAX, bits);
            self.movq_x_r(x, RAX);
            self.lock(Loc::Xmm(x));
            return Ok(x);
        }
        let pos = (r - IRREF_BIAS) as usize;
        match self.loc[pos] {
            Loc::Xmm(x) => {
                self.lock(Loc::Xmm(x));
                Ok(x)
            }
            Loc::Spill(slot) => {
                let x = self.alloc_xmm()?;
                self.movsd_x_mem(x, RBP, Self::spill_off(slot));
                self.loc[pos] = Loc::Xmm(x);
                self.lock(Loc::Xmm(x));
                Ok(x)
            }
            _ => Err(JitError::NotYetImplemented),
        }
    }

    /// Slot number behind a `Load` operand (for guards and stores)
    fn slot_of_load(&self, input: &EmitInput<'_>, r: IrRef) -> Result<i32, JitError> {
        if r < IRREF_BIAS {
            return Err(JitError::NotYetImplemented);
        }
        let ins = input.ir[(r - IRREF_BIAS) as usize];
        if ins.op != IrOp::Load {
            return Err(JitError::NotYetImplemented);
        }
        match self.const_of(input, ins.op1) {
            Some(IrConst::Int(slot)) => Ok(slot as i32),
            _ => Err(JitError::NotYetImplemented),
        }
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
    let mut e = X64 {
        buf: CodeBuffer::new(),
        loc: vec![Loc::None; len],
        last_use: vec![0; len],
        free_gpr: GPR_POOL.iter().fold(0u16, |m, &r| m | 1 << r),
        free_xmm: XMM_POOL.iter().fold(0u16, |m, &r| m | 1 << r),
        spill_next: 0,
        locked: Vec::new(),
        exit_labels: Vec::new(),
        epilogue: Label(0),
        body: Label(0),
        cur_snapshot: 0,
    };

    // last-use positions drive register freeing
    for (idx, ins) in input.ir.iter().enumerate() {
        if ins.op == IrOp::Snapshot {
            continue; // snapshot refs never occupy registers
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
    e.push_r(RBP);
    e.mov_rr(RBP, 4); // mov rbp, rsp
    e.push_r(RBX);
    e.push_r(R13);
    e.push_r(R14);
    e.push_r(R15);
    e.alu_ri(5, 4, FRAME_SIZE); // sub rsp, FRAME_SIZE
    e.mov_r_mem(RBX, ARG0, 0); // payload base
    e.mov_r_mem(R13, ARG0, 8); // tag base
    let body = e.body;
    e.buf.bind(body);

    // ===== Body =====
    for idx in 0..len {
        let ins = input.ir[idx];
        e.locked.clear();

        match ins.op {
            IrOp::Nop => {}
            IrOp::Snapshot => {
                e.cur_snapshot = ins.op1 as usize;
            }
            IrOp::Loop => {
                let body = e.body;
                e.jmp(body);
            }
            IrOp::Ret => {
                let exit = e
                    .exit_labels
                    .get(e.cur_snapshot)
                    .copied()
                    .ok_or(JitError::NotYetImplemented)?;
                e.jmp(exit);
            }
            IrOp::Load => {
                let slot = match e.const_of(input, ins.op1) {
                    Some(IrConst::Int(s)) => s as i32,
                    _ => return Err(JitError::NotYetImplemented),
                };
                if ins.ty == IrType::Num {
                    let x = e.alloc_xmm()?;
                    e.movsd_x_mem(x, RBX, slot * 8);
                    e.loc[idx] = Loc::Xmm(x);
                } else {
                    let r = e.alloc_gpr()?;
                    e.mov_r_mem(r, RBX, slot * 8);
                    e.loc[idx] = Loc::Gpr(r);
                }
            }
            IrOp::Store => {
                let slot = match e.const_of(input, ins.op1) {
                    Some(IrConst::Int(s)) => s as i32,
                    _ => return Err(JitError::NotYetImplemented),
                };
                let tag = tag_byte(ins.ty).ok_or(JitError::NotYetImplemented)?;
                if ins.ty == IrType::Num {
                    let x = e.to_xmm(input, ins.op2)?;
                    e.movsd_mem_x(RBX, slot * 8, x);
                } else {
                    let r = e.to_gpr(input, ins.op2)?;
                    e.mov_mem_r(RBX, slot * 8, r);
                }
                e.mov_mem8_imm(R13, slot, tag);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::AddInt | IrOp::SubInt | IrOp::MulInt | IrOp::Band | IrOp::Bor | IrOp::Bxor => {
                let lhs = e.to_gpr(input, ins.op1)?;
                let dst = e.alloc_gpr()?;
                e.lock(Loc::Gpr(dst));
                e.mov_rr(dst, lhs);
                // immediate fast path for a constant rhs
                if let Some(IrConst::Int(i)) = e.const_of(input, ins.op2) {
                    if let Ok(imm) = i32::try_from(i) {
                        let slash = match ins.op {
                            IrOp::AddInt => 0,
                            IrOp::SubInt => 5,
                            IrOp::Band => 4,
                            IrOp::Bor => 1,
                            IrOp::Bxor => 6,
                            IrOp::MulInt => 8, // no imm form here; fall through
                            _ => unreachable!(),
                        };
                        if slash < 8 {
                            e.alu_ri(slash, dst, imm);
                            e.loc[idx] = Loc::Gpr(dst);
                            e.free_dead(idx, ins.op1, ins.op2);
                            e.release_transients();
                            continue;
                        }
                    }
                }
                let rhs = e.to_gpr(input, ins.op2)?;
                match ins.op {
                    IrOp::AddInt => e.alu_rr(0x01, dst, rhs),
                    IrOp::SubInt => e.alu_rr(0x29, dst, rhs),
                    IrOp::Band => e.alu_rr(0x21, dst, rhs),
                    IrOp::Bor => e.alu_rr(0x09, dst, rhs),
                    IrOp::Bxor => e.alu_rr(0x31, dst, rhs),
                    IrOp::MulInt => e.imul_rr(dst, rhs),
                    _ => unreachable!(),
                }
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::Shl | IrOp::Shr => {
                let lhs = e.to_gpr(input, ins.op1)?;
                let rhs = e.to_gpr(input, ins.op2)?;
                let dst = e.alloc_gpr()?;
                e.lock(Loc::Gpr(dst));
                e.mov_rr(dst, lhs);
                e.mov_rr(RCX, rhs);
                e.shift_cl(if ins.op == IrOp::Shl { 4 } else { 5 }, dst);
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::DivInt | IrOp::ModInt => {
                let lhs = e.to_gpr(input, ins.op1)?;
                let rhs = e.to_gpr(input, ins.op2)?;
                let dst = e.alloc_gpr()?;
                e.lock(Loc::Gpr(dst));
                e.mov_rr(RAX, lhs);
                e.cqo();
                e.idiv_r(rhs);
                e.mov_rr(dst, if ins.op == IrOp::DivInt { RAX } else { RDX });
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::NegInt => {
                let src = e.to_gpr(input, ins.op1)?;
                let dst = e.alloc_gpr()?;
                e.lock(Loc::Gpr(dst));
                e.mov_rr(dst, src);
                e.neg_r(dst);
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::AddNum | IrOp::SubNum | IrOp::MulNum | IrOp::DivNum => {
                let lhs = e.to_xmm(input, ins.op1)?;
                let rhs = e.to_xmm(input, ins.op2)?;
                let dst = e.alloc_xmm()?;
                e.lock(Loc::Xmm(dst));
                e.movsd_xx(dst, lhs);
                let opcode = match ins.op {
                    IrOp::AddNum => 0x58,
                    IrOp::SubNum => 0x5C,
                    IrOp::MulNum => 0x59,
                    IrOp::DivNum => 0x5E,
                    _ => unreachable!(),
                };
                e.sse_arith(opcode, dst, rhs);
                e.loc[idx] = Loc::Xmm(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::NegNum => {
                let src = e.to_xmm(input, ins.op1)?;
                let dst = e.alloc_xmm()?;
                e.lock(Loc::Xmm(dst));
                e.movq_r_x(RAX, src);
                e.btc_ri(RAX, 63);
                e.movq_x_r(dst, RAX);
                e.loc[idx] = Loc::Xmm(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::ConvIntNum => {
                let src = e.to_gpr(input, ins.op1)?;
                let dst = e.alloc_xmm()?;
                e.cvtsi2sd(dst, src);
                e.loc[idx] = Loc::Xmm(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::ConvNumInt => {
                let src = e.to_xmm(input, ins.op1)?;
                let dst = e.alloc_gpr()?;
                e.cvttsd2si(dst, src);
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::Eq | IrOp::Ne | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge => {
                let float = e.operand_is_num(input, ins.op1) || e.operand_is_num(input, ins.op2);
                let cond = if float {
                    let lhs = e.to_xmm(input, ins.op1)?;
                    let rhs = e.to_xmm(input, ins.op2)?;
                    e.ucomisd(lhs, rhs);
                    match ins.op {
                        IrOp::Eq => cc::E,
                        IrOp::Ne => cc::NE,
                        IrOp::Lt => cc::B,
                        IrOp::Le => cc::BE,
                        IrOp::Gt => cc::A,
                        IrOp::Ge => cc::AE,
                        _ => unreachable!(),
                    }
                } else {
                    let lhs = e.to_gpr(input, ins.op1)?;
                    if let Some(IrConst::Int(i)) = e.const_of(input, ins.op2) {
                        if let Ok(imm) = i32::try_from(i) {
                            e.alu_ri(7, lhs, imm);
                        } else {
                            let rhs = e.to_gpr(input, ins.op2)?;
                            e.alu_rr(0x39, lhs, rhs);
                        }
                    } else {
                        let rhs = e.to_gpr(input, ins.op2)?;
                        e.alu_rr(0x39, lhs, rhs);
                    }
                    match ins.op {
                        IrOp::Eq => cc::E,
                        IrOp::Ne => cc::NE,
                        IrOp::Lt => cc::L,
                        IrOp::Le => cc::LE,
                        IrOp::Gt => cc::G,
                        IrOp::Ge => cc::GE,
                        _ => unreachable!(),
                    }
                };
                let dst = e.alloc_gpr()?;
                e.setcc_al(cond);
                e.movzx_r_al(dst);
                e.loc[idx] = Loc::Gpr(dst);
                e.free_dead(idx, ins.op1, ins.op2);
                e.release_transients();
            }
            IrOp::Jmpt | IrOp::Jmpf => {
                let cond = e.to_gpr(input, ins.op1)?;
                let exit = e
                    .exit_labels
                    .get(e.cur_snapshot)
                    .copied()
                    .ok_or(JitError::NotYetImplemented)?;
                e.test_rr(cond, cond);
                // Jmpt guards the condition true: exit when it is zero
                e.jcc(if ins.op == IrOp::Jmpt { cc::E } else { cc::NE }, exit);
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
                e.cmp_mem8_imm(R13, slot, expected);
                e.jcc(cc::NE, exit);
            }
            _ => return Err(JitError::NotYetImplemented),
        }
    }

    // ===== Exit stubs =====
    for (i, &label) in e.exit_labels.clone().iter().enumerate() {
        e.buf.bind(label);
        e.buf.emit_u8(0xB8); // mov eax, imm32
        e.buf.emit_u32(i as u32);
        let epilogue = e.epilogue;
        e.jmp(epilogue);
    }

    // ===== Epilogue =====
    let epilogue = e.epilogue;
    e.buf.bind(epilogue);
    // lea rsp, [rbp - 32]
    e.buf.emit_bytes(&[0x48, 0x8D, 0xA5]);
    e.buf.emit_u32((-32i32) as u32);
    e.pop_r(R15);
    e.pop_r(R14);
    e.pop_r(R13);
    e.pop_r(RBX);
    e.pop_r(RBP);
    e.buf.emit_u8(0xC3);

    e.buf.finish()
}

impl X64 {
    /// Release registers that were materialised for constants during the
    /// current instruction and never became a live binding
    fn release_transients(&mut self) {
        for loc in std::mem::take(&mut self.locked) {
            match loc {
                Loc::Gpr(r) => {
                    if GPR_POOL.contains(&r) && !self.loc.contains(&Loc::Gpr(r)) {
                        self.free_gpr |= 1 << r;
                    }
                }
                Loc::Xmm(x) => {
                    if !self.loc.contains(&Loc::Xmm(x)) {
                        self.free_xmm |= 1 << x;
                    }
                }
                _ => {}
            }
        }
    }

    fn operand_is_num(&self, input: &EmitInput<'_>, r: IrRef) -> bool {
        if let Some(k) = self.const_of(input, r) {
            matches!(k, IrConst::Num(_))
        } else if r >= IRREF_BIAS {
            input.ir[(r - IRREF_BIAS) as usize].ty == IrType::Num
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::IrBuilder;

    fn build_simple_loop() -> (Vec<crate::jit::types::IrIns>, Vec<IrConst>, Vec<crate::jit::types::SideExit>) {
        // slot1 = slot1 + 1; guard slot1 < 1000; loop
        let mut b = IrBuilder::new(1024, 256);
        let slot = b.kint(1).unwrap();
        let load = b.emit1(IrOp::Load, IrType::Int, slot).unwrap();
        b.emit1(IrOp::Snapshot, IrType::Nil, 0).unwrap();
        b.emit1(IrOp::GuardInt, IrType::Int, load).unwrap();
        let one = b.kint(1).unwrap();
        let add = b.emit2(IrOp::AddInt, IrType::Int, load, one).unwrap();
        b.emit2(IrOp::Store, IrType::Int, slot, add).unwrap();
        let limit = b.kint(1000).unwrap();
        let cmp = b.emit2(IrOp::Lt, IrType::Int, add, limit).unwrap();
        b.emit1(IrOp::Snapshot, IrType::Nil, 1).unwrap();
        b.emit1(IrOp::Jmpt, IrType::Nil, cmp).unwrap();
        b.emit0(IrOp::Loop, IrType::Nil).unwrap();
        let (ir, consts) = b.snapshot_buffers();
        let exits = vec![
            crate::jit::types::SideExit { pc: 1, snapshot: 0 },
            crate::jit::types::SideExit { pc: 2, snapshot: 1 },
        ];
        (ir, consts, exits)
    }

    #[test]
    fn test_emits_prologue_and_ret() {
        let (ir, consts, exits) = build_simple_loop();
        let code = emit(&EmitInput {
            ir: &ir,
            consts: &consts,
            exits: &exits,
        })
        .unwrap();
        assert!(!code.is_empty());
        // push rbp is the first byte, and a ret must be present
        assert_eq!(code[0], 0x55);
        assert!(code.contains(&0xC3));
    }

    #[test]
    fn test_unsupported_ir_reports_nyi() {
        let mut b = IrBuilder::new(64, 16);
        let k = b.kint(0).unwrap();
        b.emit2(IrOp::Tget, IrType::Unknown, k, k).unwrap();
        let (ir, consts) = b.snapshot_buffers();
        let result = emit(&EmitInput {
            ir: &ir,
            consts: &consts,
            exits: &[],
        });
        assert_eq!(result.unwrap_err(), JitError::NotYetImplemented);
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    mod native {
        use super::*;
        use crate::jit::emit::{TraceEntry, TraceFrame};
        use crate::jit::mem::JitMem;

        /// Copy code into executable memory and run it over a frame
        fn run(code: &[u8], payloads: &mut [i64], tags: &mut [u8]) -> u32 {
            let mut mem = JitMem::new(0);
            let (addr, avail) = mem.reserve(code.len()).unwrap();
            assert!(avail >= code.len());
            unsafe {
                std::ptr::copy_nonoverlapping(code.as_ptr(), addr, code.len());
            }
            mem.commit(code.len());
            mem.protect_exec(addr, code.len()).unwrap();
            JitMem::flush_icache(addr, code.len());

            let mut frame = TraceFrame {
                payloads: payloads.as_mut_ptr(),
                tags: tags.as_mut_ptr(),
                nslots: payloads.len(),
            };
            let entry: TraceEntry = unsafe { std::mem::transmute(addr as usize) };
            entry(&mut frame)
        }

        #[test]
        fn test_loop_trace_runs_to_guard_exit() {
            let (ir, consts, exits) = build_simple_loop();
            let code = emit(&EmitInput {
                ir: &ir,
                consts: &consts,
                exits: &exits,
            })
            .unwrap();

            let mut payloads = vec![0i64, 5];
            let mut tags = vec![TypeTag::Nil as u8, TypeTag::Int as u8];
            let exit = run(&code, &mut payloads, &mut tags);

            // the loop runs until the Lt guard fails at 1000
            assert_eq!(exit, 1);
            assert_eq!(payloads[1], 1000);
            assert_eq!(tags[1], TypeTag::Int as u8);
        }

        #[test]
        fn test_type_guard_exits_without_corruption() {
            let (ir, consts, exits) = build_simple_loop();
            let code = emit(&EmitInput {
                ir: &ir,
                consts: &consts,
                exits: &exits,
            })
            .unwrap();

            // slot 1 holds a float: the entry guard must fire before any
            // store, leaving the payload bits intact
            let float_bits = 2.5f64.to_bits() as i64;
            let mut payloads = vec![0i64, float_bits];
            let mut tags = vec![TypeTag::Nil as u8, TypeTag::Float as u8];
            let exit = run(&code, &mut payloads, &mut tags);

            assert_eq!(exit, 0);
            assert_eq!(payloads[1], float_bits);
            assert_eq!(tags[1], TypeTag::Float as u8);
        }
    }
}
