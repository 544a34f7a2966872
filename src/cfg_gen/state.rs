use crate::cfg_gen::dasm::Instruction;
use crate::cfg_gen::*;
use ethers::types::U256;
use revm::interpreter::opcode::{JUMP, JUMPDEST, JUMPI};
use std::collections::VecDeque;
use std::fmt::Debug;

/// A stack slot: a known word, or an opaque value labelled with where it came from.
#[derive(Clone)]
pub enum StackElem {
    Value(U256),
    Random(String),
}

impl StackElem {
    pub fn value(&self) -> Option<U256> {
        match self {
            StackElem::Value(v) => Some(*v),
            StackElem::Random(_) => None,
        }
    }
}

// two opaque values are never known to be equal
impl PartialEq for StackElem {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StackElem::Value(a), StackElem::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl Debug for StackElem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackElem::Value(v) => write!(f, "{v:#x}"),
            StackElem::Random(label) => write!(f, "?{label}"),
        }
    }
}

/// Abstract execution state. Index 0 of the stack is the top.
#[derive(Clone, Debug, PartialEq)]
pub enum AState {
    Live { pc: usize, stack: VecDeque<StackElem> },
    Error(String),
}

impl Default for AState {
    fn default() -> Self {
        AState::Live {
            pc: 0,
            stack: VecDeque::new(),
        }
    }
}

impl AState {
    pub fn new(pc: usize, stack: impl IntoIterator<Item = StackElem>) -> Self {
        AState::Live {
            pc,
            stack: stack.into_iter().collect(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        AState::Error(msg.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AState::Error(_))
    }

    pub fn pc(&self) -> Option<usize> {
        match self {
            AState::Live { pc, .. } => Some(*pc),
            AState::Error(_) => None,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            AState::Live { stack, .. } => stack.len(),
            AState::Error(_) => 0,
        }
    }

    pub fn peek(&self, n: usize) -> Option<&StackElem> {
        match self {
            AState::Live { stack, .. } => stack.get(n),
            AState::Error(_) => None,
        }
    }

    /// Known-value view of the stack, used to recognise a state seen before on a path.
    pub fn known_stack(&self) -> Option<Vec<Option<U256>>> {
        match self {
            AState::Live { stack, .. } => Some(stack.iter().map(StackElem::value).collect()),
            AState::Error(_) => None,
        }
    }

    fn map_live(self, f: impl FnOnce(usize, VecDeque<StackElem>) -> AState) -> AState {
        match self {
            AState::Live { pc, stack } => f(pc, stack),
            err => err,
        }
    }

    pub fn pop_n(self, n: usize) -> AState {
        self.map_live(|pc, mut stack| {
            if stack.len() < n {
                return AState::error("stack underflow");
            }
            stack.drain(..n);
            AState::Live { pc, stack }
        })
    }

    pub fn push(self, elem: StackElem) -> AState {
        self.map_live(|pc, mut stack| {
            if stack.len() >= MAX_STACK_SIZE {
                return AState::error("stack overflow");
            }
            stack.push_front(elem);
            AState::Live { pc, stack }
        })
    }

    pub fn push_n_random(self, n: usize, label: &str) -> AState {
        (0..n).fold(self, |state, i| state.push(StackElem::Random(format!("{label}.{i}"))))
    }

    pub fn skip(self, n: usize) -> AState {
        self.map_live(|pc, stack| AState::Live { pc: pc + n, stack })
    }

    pub fn goto(self, target: &StackElem) -> AState {
        self.map_live(|_, stack| match target.value() {
            Some(v) if v <= U256::from(usize::MAX) => AState::Live {
                pc: v.as_usize(),
                stack,
            },
            Some(v) => AState::error(format!("jump target {v:#x} out of range")),
            None => AState::error("jump to unknown target"),
        })
    }

    /// Copies slot `n - 1` to the top.
    pub fn dup(self, n: usize) -> AState {
        let source = n.checked_sub(1).and_then(|i| self.peek(i)).cloned();
        match source {
            Some(elem) => self.push(elem),
            None => self.map_live(|_, _| AState::error("stack underflow")),
        }
    }

    /// Exchanges the top with slot `n`.
    pub fn swap(self, n: usize) -> AState {
        self.map_live(|pc, mut stack| {
            if stack.len() <= n {
                return AState::error("stack underflow");
            }
            stack.swap(0, n);
            AState::Live { pc, stack }
        })
    }
}

impl Instruction {
    /// Abstract transition. `exit` selects the taken branch of a jump; any other
    /// instruction asked to branch is an error. `Error` states are left untouched.
    pub fn next_state(&self, state: &AState, exit: bool) -> AState {
        let state = state.clone();
        if state.is_error() {
            return state;
        }
        let op = self.op;
        let width = 1 + self.arg.len();
        if state.size() < op.pops as usize {
            let at = format_pc(self.address);
            return AState::error(format!("stack underflow at {at} {}", op.name));
        }
        match op.opcode {
            JUMP => {
                if !exit {
                    return AState::error("JUMP cannot fall through");
                }
                let target = state.peek(0).cloned();
                match target {
                    Some(target) => state.pop_n(1).goto(&target),
                    None => AState::error("stack underflow"),
                }
            }
            // the target is checked on both branches
            JUMPI => match state.peek(0).cloned() {
                Some(StackElem::Random(_)) => AState::error("jump to unknown target"),
                Some(target) if exit => state.pop_n(2).goto(&target),
                Some(_) => state.pop_n(2).skip(width),
                None => AState::error("stack underflow"),
            },
            _ if exit => AState::error(format!("{} cannot branch", op.name)),
            JUMPDEST => state.skip(width),
            _ if op.category == OpCategory::Invalid => {
                AState::error(format!("invalid opcode {:#04x}", op.opcode))
            }
            _ if op.is_push() => state.push(StackElem::Value(self.arg_value())).skip(width),
            _ if op.is_dup() => state.dup(op.pops as usize).skip(width),
            _ if op.is_swap() => state.swap(op.pops as usize - 1).skip(width),
            _ => {
                let label = format!("{}@{}", op.name, format_pc(self.address));
                state
                    .pop_n(op.pops as usize)
                    .push_n_random(op.pushes as usize, &label)
                    .skip(width)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_gen::dasm::disassemble;
    use revm::interpreter::opcode::{PUSH0, PUSH1};

    fn run(code: &str, state: AState) -> AState {
        let ins = disassemble(&hex::decode(code).unwrap());
        let last = ins.len() - 1;
        ins.iter().enumerate().fold(state, |s, (i, ins)| {
            let exit = i == last && ins.op.category == OpCategory::Jump && !ins.is_jump_dest();
            ins.next_state(&s, exit)
        })
    }

    #[test]
    fn push_jump_lands_on_target() {
        let state = run("600556", AState::default());
        assert_eq!(state.pc(), Some(5));
        assert_eq!(state.size(), 0);
    }

    #[test]
    fn jump_to_unknown_is_error() {
        let state = run("3656", AState::default());
        assert!(state.is_error());
    }

    #[test]
    fn underflow_is_error() {
        let ins = disassemble(&[0x01]);
        assert!(ins[0].next_state(&AState::default(), false).is_error());
    }

    #[test]
    fn error_is_absorbing() {
        let ins = disassemble(&[PUSH1, 0x01]);
        let err = AState::error("boom");
        assert_eq!(ins[0].next_state(&err, false), err);
    }

    #[test]
    fn non_jump_cannot_branch() {
        let ins = disassemble(&[PUSH1, 0x01]);
        assert!(ins[0].next_state(&AState::default(), true).is_error());
    }

    #[test]
    fn jumpi_branches() {
        let ins = disassemble(&hex::decode("57").unwrap());
        let state = AState::new(
            0,
            [StackElem::Value(U256::from(9)), StackElem::Random("c".into())],
        );
        assert_eq!(ins[0].next_state(&state, true).pc(), Some(9));
        let fall = ins[0].next_state(&state, false);
        assert_eq!(fall.pc(), Some(1));
        assert_eq!(fall.size(), 0);
    }

    #[test]
    fn jumpi_to_unknown_target_fails_both_ways() {
        let ins = disassemble(&hex::decode("57").unwrap());
        let state = AState::new(
            0,
            [StackElem::Random("t".into()), StackElem::Value(U256::one())],
        );
        assert!(ins[0].next_state(&state, true).is_error());
        assert!(ins[0].next_state(&state, false).is_error());
    }

    #[test]
    fn dup_and_swap_move_known_values() {
        // PUSH1 1, PUSH1 2, DUP2, SWAP1
        let state = run("600160028190", AState::default());
        assert_eq!(
            state.known_stack(),
            Some(vec![Some(U256::from(2)), Some(U256::from(1)), Some(U256::from(1))])
        );
        assert_eq!(state.pc(), Some(6));
    }

    #[test]
    fn opaque_results_are_unknown() {
        let state = run("36600101", AState::default());
        assert_eq!(state.known_stack(), Some(vec![None]));
        assert_ne!(state.peek(0), state.peek(0));
    }

    #[test]
    fn jumpdest_only_falls_through() {
        let ins = disassemble(&[JUMPDEST]);
        assert_eq!(ins[0].next_state(&AState::default(), false).pc(), Some(1));
        assert!(ins[0].next_state(&AState::default(), true).is_error());
    }

    #[test]
    fn stack_overflow_is_error() {
        let full = AState::new(0, (0..MAX_STACK_SIZE).map(|i| StackElem::Value(U256::from(i))));
        let ins = disassemble(&[PUSH0]);
        assert!(ins[0].next_state(&full, false).is_error());
    }
}
