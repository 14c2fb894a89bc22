//! Control-flow flattening
//!
//! Rewrites a prototype's control-flow graph into a single dispatcher
//! loop over a fresh state register:
//!
//! ```text
//!   LOADI state, entry_state
//! dispatcher:
//!   EQI state, s0, k=1 ; JMP block0
//!   EQI state, s1, k=1 ; JMP block1
//!   ...
//!   JMP dispatcher
//! block_i:
//!   <body without terminator>
//!   LOADI state, next_state
//!   JMP dispatcher
//! ```
//!
//! Conditional blocks keep their test and select between two state loads
//! with a local skip jump; exit blocks keep their return unchanged.
//! Optional passes shuffle the state-id assignment (entry pinned),
//! encode state values through a linear bijection, and wire bogus blocks
//! into the dispatcher.
//!
//! The pass refuses prototypes containing loop-terminator opcodes and
//! prototypes that write at or above the chosen state register; protos
//! that are too short to be worth flattening are skipped, not errors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lux_bytecode::instr::{self, Instruction, Opcode};
use lux_bytecode::proto::obf_mode;
use lux_bytecode::{verify_proto, Proto};

use crate::error::ObfuscateError;

use super::ObfLog;

/// Magic number recorded on flattened prototypes
pub const CFF_MAGIC: u32 = 0x4C43_4646; // "LCFF"

/// Bogus blocks generated per real block
const BOGUS_RATIO: usize = 2;
const BOGUS_MIN_INSTS: usize = 3;
const BOGUS_MAX_INSTS: usize = 8;

/// State-encoding parameters: `prime` is coprime with `range`, so the
/// map `s -> (s*prime + offset) mod range` is a bijection
const ENCODE_RANGE: i64 = 30000;
const ENCODE_PRIME: i64 = 7919;

/// A basic block over the original bytecode, half-open `[start, end)`
#[derive(Debug, Clone)]
struct BasicBlock {
    start_pc: usize,
    end_pc: usize,
    state_id: usize,
    /// Jump-target successor block, if the block ends in a jump
    original_target: Option<usize>,
    /// Sequential successor block
    fall_through: Option<usize>,
    is_entry: bool,
    is_exit: bool,
}

/// Metadata recorded for a flattened prototype, enough to interpret the
/// transformation or map states back to original pcs
#[derive(Debug, Clone)]
pub struct CffMetadata {
    pub num_blocks: usize,
    pub state_reg: u16,
    pub dispatcher_pc: usize,
    /// state id -> original start pc
    pub block_mapping: Vec<usize>,
    pub seed: u32,
}

/// Encode a state value through the linear bijection
pub fn encode_state(state: i64, seed: u32) -> i64 {
    let offset = (seed as i64) % ENCODE_RANGE;
    let mut encoded = ((state * ENCODE_PRIME) % ENCODE_RANGE + offset) % ENCODE_RANGE;
    if encoded < 0 {
        encoded += ENCODE_RANGE;
    }
    encoded
}

/// Pick the state value emitted for a block, applying encoding if enabled
fn emitted_state(state: usize, flags: u32, seed: u32) -> i64 {
    if flags & obf_mode::STATE_ENCODE != 0 {
        encode_state(state as i64, seed)
    } else {
        state as i64
    }
}

/// Registers written by an instruction; used for the state-register
/// clash refusal
fn written_register(inst: Instruction) -> Option<u16> {
    use Opcode::*;
    let op = instr::get_opcode(inst)?;
    match op {
        Move | LoadI | LoadF | LoadK | LoadFalse | LoadTrue | GetUpval | GetTable | GetI
        | GetField | NewTable | Add | Sub | Mul | Div | Mod | Pow | Unm | Not | Len | AddI
        | BAnd | BOr | BXor | BNot | Shl | Shr | Concat | Closure => Some(instr::get_a(inst)),
        LoadNil => Some(instr::get_a(inst) + instr::get_b(inst)),
        _ => None,
    }
}

/// Identify leaders and partition the code into basic blocks
fn identify_blocks(code: &[Instruction], log: &mut ObfLog) -> Vec<BasicBlock> {
    let len = code.len();
    let mut leader = vec![false; len];
    leader[0] = true;

    for (pc, &inst) in code.iter().enumerate() {
        let Some(op) = instr::get_opcode(inst) else {
            continue;
        };
        if op.is_jump() {
            let target = instr::jump_target(inst, pc);
            if (0..len as i64).contains(&target) {
                leader[target as usize] = true;
            }
        }
        if op.is_conditional_test() && pc + 2 < len {
            // a test always skips over the jump that follows it
            leader[pc + 2] = true;
        }
        if op.is_return() && pc + 1 < len {
            leader[pc + 1] = true;
        }
    }

    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut start = 0;
    for pc in 1..=len {
        if pc == len || leader[pc] {
            blocks.push(BasicBlock {
                start_pc: start,
                end_pc: pc,
                state_id: blocks.len(),
                original_target: None,
                fall_through: None,
                is_entry: start == 0,
                is_exit: false,
            });
            start = pc;
        }
    }

    let find_block_at = |blocks: &[BasicBlock], pc: usize| -> Option<usize> {
        blocks.iter().position(|b| b.start_pc == pc)
    };

    for i in 0..blocks.len() {
        let last_pc = blocks[i].end_pc - 1;
        let inst = code[last_pc];
        let Some(op) = instr::get_opcode(inst) else {
            continue;
        };

        if op.is_return() {
            blocks[i].is_exit = true;
            continue;
        }
        if op.is_jump() {
            let target = instr::jump_target(inst, last_pc);
            blocks[i].original_target = find_block_at(&blocks, target as usize);
        } else if !op.is_block_terminator() && blocks[i].end_pc < len {
            blocks[i].fall_through = find_block_at(&blocks, blocks[i].end_pc);
        }
    }

    log.line(|| format!("identified {} basic blocks", blocks.len()));
    blocks
}

/// Fisher–Yates shuffle of the state-id assignment, entry block pinned
/// at state 0. Ids are swapped, not the blocks themselves.
fn shuffle_states(blocks: &mut [BasicBlock], rng: &mut StdRng, log: &mut ObfLog) {
    if blocks.len() <= 2 {
        return;
    }
    for i in (2..blocks.len()).rev() {
        let j = rng.gen_range(1..=i);
        let tmp = blocks[i].state_id;
        blocks[i].state_id = blocks[j].state_id;
        blocks[j].state_id = tmp;
    }
    log.line(|| {
        let ids: Vec<usize> = blocks.iter().map(|b| b.state_id).collect();
        format!("shuffled state ids: {ids:?}")
    });
}

/// A side-effect-free filler instruction touching only registers below
/// the state register
fn bogus_instruction(state_reg: u16, rng: &mut StdRng) -> Instruction {
    let max_reg = state_reg.max(1);
    let reg = rng.gen_range(0..max_reg);
    match rng.gen_range(0..4) {
        0 => instr::asbx(Opcode::LoadI, reg, rng.gen_range(-500..500)),
        1 => instr::absck(Opcode::AddI, reg, reg, rng.gen_range(-100..100), false),
        2 => {
            let src = rng.gen_range(0..max_reg);
            instr::abc(Opcode::Move, reg, src, 0)
        }
        _ => instr::asbx(Opcode::LoadI, reg, rng.gen_range(0..2000)),
    }
}

/// Flatten a prototype in place.
///
/// Returns `Ok(true)` when the transformation was applied, `Ok(false)`
/// when the prototype was skipped as not worth flattening (too short or a
/// single block).
pub fn flatten(
    proto: &mut Proto,
    flags: u32,
    seed: u32,
    log: &mut ObfLog,
) -> Result<bool, ObfuscateError> {
    if flags & obf_mode::CFF == 0 {
        return Ok(false);
    }
    if proto.is_locked() {
        return Err(ObfuscateError::Locked);
    }
    // too short to be worth the dispatcher
    if proto.code.len() < 4 {
        log.line(|| format!("skipping: only {} instructions", proto.code.len()));
        return Ok(false);
    }

    // refusal: loop terminators cannot be relocated
    for &inst in &proto.code {
        if let Some(op) = instr::get_opcode(inst) {
            if op.is_loop_terminator() {
                return Err(ObfuscateError::LoopOpcode);
            }
        }
    }

    let state_reg = proto.max_stack_size as u16;
    if state_reg >= u8::MAX as u16 {
        return Err(ObfuscateError::StateRegisterClash(state_reg));
    }
    // refusal: the original code must never touch the state register
    for &inst in &proto.code {
        if let Some(reg) = written_register(inst) {
            if reg >= state_reg {
                return Err(ObfuscateError::StateRegisterClash(reg));
            }
        }
    }

    let mut blocks = identify_blocks(&proto.code, log);
    if blocks.len() < 2 {
        log.line(|| "skipping: fewer than two blocks".to_string());
        return Ok(false);
    }

    let mut rng = StdRng::seed_from_u64(seed as u64);
    if flags & obf_mode::BLOCK_SHUFFLE != 0 {
        shuffle_states(&mut blocks, &mut rng, log);
    }

    let num_bogus = if flags & obf_mode::BOGUS_BLOCKS != 0 {
        blocks.len() * BOGUS_RATIO
    } else {
        0
    };
    let total_states = blocks.len() + num_bogus;

    let mut code: Vec<Instruction> = Vec::with_capacity(proto.code.len() * 2);

    // entry state initialisation
    let entry_state = blocks
        .iter()
        .find(|b| b.is_entry)
        .map(|b| b.state_id)
        .unwrap_or(0);
    code.push(instr::asbx(
        Opcode::LoadI,
        state_reg,
        emitted_state(entry_state, flags, seed),
    ));

    // dispatcher fan: one (EQI, JMP) pair per real and bogus state
    let dispatcher_pc = code.len();
    let mut arm_jmp_pcs: Vec<usize> = Vec::with_capacity(total_states);
    for state in 0..total_states {
        let value = emitted_state(state, flags, seed);
        code.push(instr::asbck(Opcode::EqI, state_reg, value as i32, 0, true));
        arm_jmp_pcs.push(code.len());
        code.push(instr::sj(Opcode::Jmp, 0)); // patched later
    }
    // default arm: spin back to the dispatcher
    let loop_back = dispatcher_pc as i64 - code.len() as i64 - 1;
    code.push(instr::sj(Opcode::Jmp, loop_back));
    log.line(|| format!("dispatcher at pc {dispatcher_pc}, {total_states} arms"));

    // relocated block bodies, indexed by state id
    let mut state_starts: Vec<usize> = vec![0; total_states];
    for block in &blocks {
        state_starts[block.state_id] = code.len();

        let last_pc = block.end_pc - 1;
        let last_op = instr::get_opcode(proto.code[last_pc]);

        // conditional pattern: a test immediately before a trailing jump
        let has_cond = last_op == Some(Opcode::Jmp)
            && last_pc > block.start_pc
            && instr::get_opcode(proto.code[last_pc - 1])
                .is_some_and(|op| op.is_conditional_test());

        let copy_end = if has_cond {
            last_pc - 1
        } else if last_op == Some(Opcode::Jmp) {
            last_pc
        } else {
            block.end_pc
        };
        for pc in block.start_pc..copy_end {
            code.push(proto.code[pc]);
        }

        if block.is_exit {
            // keep the original return sequence
            for pc in copy_end..block.end_pc {
                code.push(proto.code[pc]);
            }
        } else if has_cond {
            // two-branch state selector with a local skip jump:
            //   <test>            ; true skips the next jump
            //   JMP +2            ; false path -> else state load
            //   LOADI state, then ; JMP dispatcher
            //   LOADI state, else ; JMP dispatcher
            let jmp_target = instr::jump_target(proto.code[last_pc], last_pc) as usize;
            let else_block = blocks.iter().find(|b| b.start_pc == jmp_target);
            let then_block = blocks.iter().find(|b| b.start_pc == last_pc + 1);
            let then_state = then_block.map(|b| b.state_id).unwrap_or(0);
            let else_state = else_block.map(|b| b.state_id).unwrap_or(0);

            code.push(proto.code[last_pc - 1]);
            code.push(instr::sj(Opcode::Jmp, 2));
            code.push(instr::asbx(
                Opcode::LoadI,
                state_reg,
                emitted_state(then_state, flags, seed),
            ));
            let off = dispatcher_pc as i64 - code.len() as i64 - 1;
            code.push(instr::sj(Opcode::Jmp, off));
            code.push(instr::asbx(
                Opcode::LoadI,
                state_reg,
                emitted_state(else_state, flags, seed),
            ));
            let off = dispatcher_pc as i64 - code.len() as i64 - 1;
            code.push(instr::sj(Opcode::Jmp, off));
        } else {
            let next = block.original_target.or(block.fall_through);
            if let Some(next) = next {
                let next_state = blocks[next].state_id;
                code.push(instr::asbx(
                    Opcode::LoadI,
                    state_reg,
                    emitted_state(next_state, flags, seed),
                ));
                let off = dispatcher_pc as i64 - code.len() as i64 - 1;
                code.push(instr::sj(Opcode::Jmp, off));
            }
        }
    }

    // bogus block bodies: filler instructions chained through other
    // bogus states, always returning to the dispatcher
    for bogus in 0..num_bogus {
        let state = blocks.len() + bogus;
        state_starts[state] = code.len();
        let count = rng.gen_range(BOGUS_MIN_INSTS..=BOGUS_MAX_INSTS);
        for _ in 0..count {
            code.push(bogus_instruction(state_reg, &mut rng));
        }
        let next = blocks.len() + (bogus + 1 + rng.gen_range(0..3)) % num_bogus;
        code.push(instr::asbx(
            Opcode::LoadI,
            state_reg,
            emitted_state(next, flags, seed),
        ));
        let off = dispatcher_pc as i64 - code.len() as i64 - 1;
        code.push(instr::sj(Opcode::Jmp, off));
    }

    // fix up the dispatcher arms now every body position is known
    for (state, &jmp_pc) in arm_jmp_pcs.iter().enumerate() {
        let offset = state_starts[state] as i64 - jmp_pc as i64 - 1;
        code[jmp_pc] = instr::set_sj(code[jmp_pc], offset);
    }

    log.line(|| {
        format!(
            "flattening grew {} -> {} instructions",
            proto.code.len(),
            code.len()
        )
    });
    debug_assert!(code.len() >= proto.code.len());

    let metadata = CffMetadata {
        num_blocks: blocks.len(),
        state_reg,
        dispatcher_pc,
        block_mapping: {
            let mut mapping = vec![0; total_states];
            for block in &blocks {
                mapping[block.state_id] = block.start_pc;
            }
            mapping
        },
        seed,
    };

    proto.code = code;
    proto.max_stack_size = state_reg as u8 + 1;
    if !proto.line_info.is_empty() {
        proto.line_info.resize(proto.code.len(), 0);
    }
    proto.obf_mode |= flags & (obf_mode::CFF
        | obf_mode::BLOCK_SHUFFLE
        | obf_mode::BOGUS_BLOCKS
        | obf_mode::STATE_ENCODE);
    proto.obf_magic = CFF_MAGIC;
    proto.obf_data = ((metadata.num_blocks as u64) << 32) | seed as u64;

    verify_proto(proto).map_err(|e| ObfuscateError::BadOutput(e.to_string()))?;
    tracing::debug!(
        blocks = metadata.num_blocks,
        states = total_states,
        "proto flattened"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lux_bytecode::instr::{abc, asbck, asbx, sj};
    use lux_bytecode::Constant;

    /// function(x) if x > 0 then return x else return -x end
    fn abs_proto() -> Proto {
        let mut p = Proto::new(1, 2);
        p.code = vec![
            asbck(Opcode::GtI, 0, 0, 0, false), // (x > 0) != 0 -> skip jmp
            sj(Opcode::Jmp, 1),                 // -> pc 3 (else)
            abc(Opcode::Return1, 0, 0, 0),      // then: return x
            abc(Opcode::Unm, 1, 0, 0),          // else: r1 = -x
            abc(Opcode::Return1, 1, 0, 0),
        ];
        p
    }

    #[test]
    fn test_block_identification() {
        let p = abs_proto();
        let mut log = ObfLog::disabled();
        let blocks = identify_blocks(&p.code, &mut log);
        // [0,2) cond+jmp, [2,3) then-return, [3,5) else
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].is_entry);
        assert!(blocks[1].is_exit);
        assert!(blocks[2].is_exit);
        assert_eq!(blocks[0].original_target, Some(2));
    }

    #[test]
    fn test_flatten_grows_code() {
        let mut p = abs_proto();
        let before = p.code.len();
        let mut log = ObfLog::disabled();
        let applied = flatten(&mut p, obf_mode::CFF, 0xDEAD_BEEF, &mut log).unwrap();
        assert!(applied);
        assert!(p.code.len() > before);
        assert_eq!(p.max_stack_size, 3); // the state register was added
        assert_eq!(p.obf_magic, CFF_MAGIC);
        assert!(p.obf_mode & obf_mode::CFF != 0);
    }

    #[test]
    fn test_flatten_with_all_subflags() {
        let flags =
            obf_mode::CFF | obf_mode::BLOCK_SHUFFLE | obf_mode::BOGUS_BLOCKS | obf_mode::STATE_ENCODE;
        let mut p = abs_proto();
        let before = p.code.len();
        let mut log = ObfLog::enabled();
        assert!(flatten(&mut p, flags, 0xDEAD_BEEF, &mut log).unwrap());
        assert!(p.code.len() > before);
        assert!(!log.lines().is_empty());
    }

    #[test]
    fn test_flatten_is_deterministic_per_seed() {
        let flags = obf_mode::CFF | obf_mode::BLOCK_SHUFFLE | obf_mode::BOGUS_BLOCKS;
        let mut a = abs_proto();
        let mut b = abs_proto();
        let mut log = ObfLog::disabled();
        flatten(&mut a, flags, 42, &mut log).unwrap();
        flatten(&mut b, flags, 42, &mut log).unwrap();
        assert_eq!(a.code, b.code);

        let mut c = abs_proto();
        flatten(&mut c, flags, 43, &mut log).unwrap();
        assert_ne!(a.code, c.code);
    }

    #[test]
    fn test_refuses_loop_opcodes() {
        let mut p = Proto::new(0, 4);
        p.code = vec![
            asbx(Opcode::LoadI, 0, 0),
            lux_bytecode::instr::abx(Opcode::ForPrep, 0, 1),
            lux_bytecode::instr::abx(Opcode::ForLoop, 0, 1),
            abc(Opcode::Return0, 0, 0, 0),
        ];
        let mut log = ObfLog::disabled();
        assert_eq!(
            flatten(&mut p, obf_mode::CFF, 1, &mut log).unwrap_err(),
            ObfuscateError::LoopOpcode
        );
    }

    #[test]
    fn test_refuses_state_register_writes() {
        // max_stack_size claims 1 register, but the code writes r3
        let mut p = Proto::new(0, 1);
        p.code = vec![
            asbx(Opcode::LoadI, 3, 1),
            asbx(Opcode::LoadI, 0, 2),
            abc(Opcode::Add, 0, 0, 0),
            abc(Opcode::Return0, 0, 0, 0),
        ];
        let mut log = ObfLog::disabled();
        assert_eq!(
            flatten(&mut p, obf_mode::CFF, 1, &mut log).unwrap_err(),
            ObfuscateError::StateRegisterClash(3)
        );
    }

    #[test]
    fn test_skips_short_protos() {
        let mut p = Proto::new(0, 2);
        p.code = vec![asbx(Opcode::LoadI, 0, 1), abc(Opcode::Return1, 0, 0, 0)];
        let mut log = ObfLog::disabled();
        assert!(!flatten(&mut p, obf_mode::CFF, 1, &mut log).unwrap());
        assert_eq!(p.code.len(), 2); // untouched
    }

    #[test]
    fn test_locked_proto_is_refused() {
        let mut p = abs_proto();
        p.lock();
        let mut log = ObfLog::disabled();
        assert_eq!(
            flatten(&mut p, obf_mode::CFF, 1, &mut log).unwrap_err(),
            ObfuscateError::Locked
        );
    }

    #[test]
    fn test_state_encoding_is_bijective() {
        let seed = 0xDEAD_BEEF;
        let mut seen = std::collections::HashSet::new();
        for s in 0..2000 {
            assert!(seen.insert(encode_state(s, seed)), "collision at {s}");
        }
    }

    #[test]
    fn test_every_state_has_one_dispatcher_arm() {
        let flags = obf_mode::CFF | obf_mode::BOGUS_BLOCKS;
        let mut p = abs_proto();
        let mut log = ObfLog::disabled();
        flatten(&mut p, flags, 7, &mut log).unwrap();

        // count EQI arms in the dispatcher: 3 real + 6 bogus states
        let arms = p
            .code
            .iter()
            .filter(|&&i| instr::get_opcode(i) == Some(Opcode::EqI))
            .count();
        assert_eq!(arms, 9);

        // and each compares against a distinct state value
        let mut values: Vec<i32> = p
            .code
            .iter()
            .filter(|&&i| instr::get_opcode(i) == Some(Opcode::EqI))
            .map(|&i| instr::get_sb(i))
            .collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 9);
    }

    #[test]
    fn test_flattened_constants_untouched() {
        let mut p = abs_proto();
        p.constants = vec![Constant::Int(7)];
        let mut log = ObfLog::disabled();
        flatten(&mut p, obf_mode::CFF, 1, &mut log).unwrap();
        assert_eq!(p.constants, vec![Constant::Int(7)]);
    }
}
