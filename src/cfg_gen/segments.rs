use crate::cfg_gen::dasm::Instruction;
use crate::cfg_gen::state::AState;
use crate::cfg_gen::wp::{wpre_ins, Condition};
use crate::cfg_gen::*;
use revm::interpreter::opcode::{JUMP, JUMPI, RETURN};
use std::fmt::{Debug, Display};
use tracing::trace;

/// How control leaves a segment, read off its last instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentKind {
    /// falls through into the next segment
    Cont,
    Jump,
    Jumpi,
    Return,
    /// STOP, REVERT or SELFDESTRUCT
    Stop,
    Invalid,
}

impl SegmentKind {
    pub fn of(last: &Instruction) -> Self {
        match last.op.opcode {
            JUMP => SegmentKind::Jump,
            JUMPI => SegmentKind::Jumpi,
            RETURN => SegmentKind::Return,
            code if HALTING_U8.contains(&code) => SegmentKind::Stop,
            _ if last.op.category == OpCategory::Invalid => SegmentKind::Invalid,
            _ => SegmentKind::Cont,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentKind::Return | SegmentKind::Stop | SegmentKind::Invalid)
    }
}

/// A maximal straight-line run of instructions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    kind: SegmentKind,
    instructions: Vec<Instruction>,
    net_op_effect: i32,
}

impl Segment {
    /// `None` for an empty instruction list.
    pub fn new(instructions: Vec<Instruction>) -> Option<Self> {
        let kind = SegmentKind::of(instructions.last()?);
        let net_op_effect = instructions.iter().map(Instruction::stack_effect).sum();
        Some(Self {
            kind,
            instructions,
            net_op_effect,
        })
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn last(&self) -> &Instruction {
        &self.instructions[self.instructions.len() - 1]
    }

    /// Everything before the last instruction.
    pub fn body(&self) -> &[Instruction] {
        &self.instructions[..self.instructions.len() - 1]
    }

    pub fn start_address(&self) -> usize {
        self.instructions[0].address
    }

    /// Address right after the last instruction.
    pub fn start_address_next_seg(&self) -> usize {
        self.last().next_address()
    }

    pub fn net_op_effect(&self) -> i32 {
        self.net_op_effect
    }

    pub fn net_cap_effect(&self) -> i32 {
        -self.net_op_effect
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Whether the segment can leave with branch outcome `exit`.
    pub fn has_exit(&self, exit: bool) -> bool {
        match self.kind {
            SegmentKind::Jump => exit,
            SegmentKind::Jumpi => true,
            SegmentKind::Cont => !exit,
            _ => false,
        }
    }

    /// Tag agrees with the last instruction, only the last instruction may be terminal
    /// and the instructions are laid out back to back.
    pub fn is_valid(&self) -> bool {
        SegmentKind::of(self.last()) == self.kind
            && self.body().iter().all(|ins| !ins.is_terminal())
            && self
                .instructions
                .windows(2)
                .all(|pair| pair[0].next_address() == pair[1].address)
    }

    pub fn wpre(&self, post: &Condition) -> Condition {
        wpre_ins(&self.instructions, post)
    }

    /// Minimum stack size on entry so that `post` items are on the stack at exit.
    pub fn weakest_pre_operands(&self, post: usize) -> usize {
        self.instructions
            .iter()
            .rev()
            .fold(post, |acc, ins| ins.weakest_pre_operands(acc))
    }

    /// Minimum free stack capacity on entry so that `post` slots are free at exit.
    pub fn weakest_pre_capacity(&self, post: usize) -> usize {
        self.instructions
            .iter()
            .rev()
            .fold(post, |acc, ins| ins.weakest_pre_capacity(acc))
    }

    /// Precondition on entry for this segment, leaving with outcome `exit`, to
    /// transfer control to `target`.
    pub fn leads_to(&self, target: usize, exit: bool) -> Condition {
        let fallthrough = || {
            if target == self.start_address_next_seg() {
                Condition::StTrue
            } else {
                Condition::StFalse
            }
        };
        match (self.kind, exit) {
            (SegmentKind::Jump | SegmentKind::Jumpi, true) => {
                wpre_ins(self.body(), &Condition::slot(0, target.into()))
            }
            (SegmentKind::Jump, false) => Condition::StFalse,
            (SegmentKind::Jumpi, false) | (SegmentKind::Cont, false) => fallthrough(),
            (SegmentKind::Cont, true) => Condition::StFalse,
            (SegmentKind::Return | SegmentKind::Stop, _) => Condition::StTrue,
            (SegmentKind::Invalid, _) => Condition::StFalse,
        }
    }

    /// Abstract execution: the body falls through, the last instruction leaves with `exit`.
    pub fn run(&self, state: &AState, exit: bool) -> AState {
        let state = self
            .body()
            .iter()
            .fold(state.clone(), |s, ins| ins.next_state(&s, false));
        self.last().next_state(&state, exit)
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:?} segment @{}", self.kind, format_pc(self.start_address()))?;
        for ins in &self.instructions {
            writeln!(f, "  {ins:?}")?;
        }
        Ok(())
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{}", self.kind, format_pc(self.start_address()))
    }
}

/// Cuts the instruction stream into segments: after every terminal instruction, and
/// before every JUMPDEST that does not already open a segment.
pub fn split_segments(instructions: &[Instruction]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current: Vec<Instruction> = Vec::new();
    for ins in instructions {
        if ins.is_jump_dest() && !current.is_empty() {
            segments.extend(Segment::new(std::mem::take(&mut current)));
        }
        current.push(ins.clone());
        if ins.is_terminal() {
            segments.extend(Segment::new(std::mem::take(&mut current)));
        }
    }
    segments.extend(Segment::new(current));
    trace!("split {} instructions into {} segments", instructions.len(), segments.len());
    segments
}

/// Index of the segment starting exactly at `pc`.
pub fn pc_to_seg(segments: &[Segment], pc: usize) -> Option<usize> {
    segments.binary_search_by_key(&pc, Segment::start_address).ok()
}

/// Start addresses of the segments opened by a JUMPDEST.
pub fn collect_jump_dests(segments: &[Segment]) -> Vec<usize> {
    segments
        .iter()
        .filter(|seg| seg.instructions[0].is_jump_dest())
        .map(Segment::start_address)
        .collect()
}

/// Weakest precondition of a path of `(segment index, exit)` steps ending in `target`,
/// for `post` to hold once `target` is reached.
pub fn wpre_seq_segs(
    segments: &[Segment],
    path: &[(usize, bool)],
    post: &Condition,
    target: usize,
) -> Condition {
    let mut cond = post.clone();
    let mut target = target;
    for &(index, exit) in path.iter().rev() {
        let seg = &segments[index];
        cond = seg.wpre(&cond).and(&seg.leads_to(target, exit));
        if cond.is_false() {
            break;
        }
        target = seg.start_address();
    }
    cond
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_gen::dasm::disassemble;
    use ethers::types::U256;

    fn segs(code: &str) -> Vec<Segment> {
        split_segments(&disassemble(&hex::decode(code).unwrap()))
    }

    #[test]
    fn push_jump_is_one_jump_segment() {
        let s = segs("600556");
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].kind(), SegmentKind::Jump);
        assert_eq!(s[0].leads_to(5, true), Condition::StTrue);
        assert_eq!(s[0].leads_to(6, true), Condition::StFalse);
        assert_eq!(s[0].leads_to(5, false), Condition::StFalse);
    }

    #[test]
    fn jumpdest_then_stop() {
        let s = segs("5b00");
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].kind(), SegmentKind::Stop);
        assert!(!s[0].instructions()[0].is_terminal());
        assert!(s[0].instructions()[1].is_terminal());
        assert_eq!(collect_jump_dests(&s), vec![0]);
    }

    #[test]
    fn jumpdest_opens_new_segment() {
        // PUSH1 1, JUMPDEST, STOP
        let s = segs("60015b00");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].kind(), SegmentKind::Cont);
        assert_eq!(s[0].start_address_next_seg(), 2);
        assert_eq!(s[0].leads_to(2, false), Condition::StTrue);
        assert_eq!(s[0].leads_to(3, false), Condition::StFalse);
        assert_eq!(pc_to_seg(&s, 2), Some(1));
        assert_eq!(pc_to_seg(&s, 1), None);
    }

    #[test]
    fn truncated_push_segment_is_well_formed() {
        let s = segs("600056006101");
        assert_eq!(s.len(), 3);
        let last = &s[2];
        assert!(last.is_valid());
        assert_eq!(last.kind(), SegmentKind::Cont);
        assert!(!last.instructions()[0].is_valid());
    }

    #[test]
    fn kinds_follow_last_instruction() {
        let s = segs("00f3fdff fe0c 5757".replace(' ', "").as_str());
        let kinds: Vec<_> = s.iter().map(Segment::kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Stop,
                SegmentKind::Return,
                SegmentKind::Stop,
                SegmentKind::Stop,
                SegmentKind::Invalid,
                SegmentKind::Invalid,
                SegmentKind::Jumpi,
                SegmentKind::Jumpi,
            ]
        );
        assert!(s.iter().all(Segment::is_valid));
    }

    #[test]
    fn jumpi_leads_to_both_sides() {
        // PUSH1 1, PUSH1 8, JUMPI
        let s = segs("6001600857");
        let seg = &s[0];
        assert_eq!(seg.leads_to(8, true), Condition::StTrue);
        assert_eq!(seg.leads_to(5, false), Condition::StTrue);
        assert_eq!(seg.leads_to(8, false), Condition::StFalse);
        assert!(seg.has_exit(true) && seg.has_exit(false));
    }

    #[test]
    fn unknown_target_needs_entry_constraint() {
        // SWAP1, JUMP: target comes from slot 1 on entry
        let s = segs("9056");
        assert_eq!(s[0].leads_to(0x42, true), Condition::slot(1, U256::from(0x42)));
    }

    #[test]
    fn net_effects() {
        let s = segs("6001600201600356");
        assert_eq!(s[0].net_op_effect(), 1);
        assert_eq!(s[0].net_cap_effect(), -1);
        assert_eq!(s[0].weakest_pre_operands(0), 0);
        // SWAP1 then POP
        let s = segs("905000");
        assert_eq!(s[0].net_op_effect(), -1);
        assert_eq!(s[0].weakest_pre_operands(0), 2);
    }

    #[test]
    fn path_condition_checks_every_hop() {
        // 0: PUSH1 0x08 PUSH1 0x06 JUMP ; 5: STOP ; 6: JUMPDEST JUMP ; 8: JUMPDEST STOP
        let s = segs("6008600656005b565b00");
        let a = pc_to_seg(&s, 0).unwrap();
        let stop = pc_to_seg(&s, 5).unwrap();
        let b = pc_to_seg(&s, 6).unwrap();
        let path = [(a, true), (b, true)];
        assert_eq!(wpre_seq_segs(&s, &path, &Condition::StTrue, 8), Condition::StTrue);
        assert_eq!(wpre_seq_segs(&s, &path, &Condition::StTrue, 9), Condition::StFalse);
        // the first segment never jumps to 5
        let detour = [(a, true), (stop, false)];
        assert_eq!(
            wpre_seq_segs(&s, &detour, &Condition::StTrue, 0),
            Condition::StFalse
        );
    }

    #[test]
    fn path_condition_resolves_return_address() {
        // 0: PUSH1 0x06 PUSH1 0x08 JUMP ; 5: INVALID ; 6: JUMPDEST STOP ; 8: JUMPDEST JUMP
        let s = segs("6006600856fe5b005b56");
        let a = pc_to_seg(&s, 0).unwrap();
        let d = pc_to_seg(&s, 8).unwrap();
        let path = [(a, true), (d, true)];
        assert_eq!(wpre_seq_segs(&s, &path, &Condition::StTrue, 6), Condition::StTrue);
        assert_eq!(wpre_seq_segs(&s, &path, &Condition::StTrue, 5), Condition::StFalse);
        // without the first segment the return address is still open
        assert_eq!(
            wpre_seq_segs(&s, &path[1..], &Condition::StTrue, 6),
            Condition::slot(0, U256::from(6))
        );
    }

    #[test]
    fn run_follows_jump() {
        let s = segs("6006600856fe5b005b56");
        let state = s[0].run(&AState::default(), true);
        assert_eq!(state.pc(), Some(8));
        let state = s[pc_to_seg(&s, 8).unwrap()].run(&state, true);
        assert_eq!(state.pc(), Some(6));
    }
}
