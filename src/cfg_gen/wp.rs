use crate::cfg_gen::dasm::Instruction;
use crate::cfg_gen::state::{AState, StackElem};
use crate::cfg_gen::*;
use ethers::types::U256;
use itertools::Itertools;
use revm::interpreter::opcode::{JUMP, JUMPDEST, JUMPI};
use std::fmt::Display;

/// A conjunction of `stack[pos] == val` constraints, or one of the trivial conditions.
///
/// Positions are relative to the top of the stack at the program point the condition
/// talks about. `tracked_pos` is kept sorted and free of duplicates, and is parallel to
/// `tracked_vals`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Condition {
    StTrue,
    StFalse,
    StCond {
        tracked_pos: Vec<usize>,
        tracked_vals: Vec<U256>,
    },
}

impl Condition {
    /// Builds a normalised condition. No constraints is `StTrue`, two different values
    /// required on one slot is `StFalse`.
    pub fn new(constraints: impl IntoIterator<Item = (usize, U256)>) -> Self {
        let mut sorted: Vec<(usize, U256)> = constraints.into_iter().collect();
        sorted.sort_by_key(|(pos, _)| *pos);
        let mut tracked_pos: Vec<usize> = Vec::with_capacity(sorted.len());
        let mut tracked_vals: Vec<U256> = Vec::with_capacity(sorted.len());
        for (pos, val) in sorted {
            if tracked_pos.last() == Some(&pos) {
                if tracked_vals.last() != Some(&val) {
                    return Condition::StFalse;
                }
                continue;
            }
            tracked_pos.push(pos);
            tracked_vals.push(val);
        }
        if tracked_pos.is_empty() {
            Condition::StTrue
        } else {
            Condition::StCond {
                tracked_pos,
                tracked_vals,
            }
        }
    }

    /// Single constraint `stack[pos] == val`.
    pub fn slot(pos: usize, val: U256) -> Self {
        Self::new([(pos, val)])
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Condition::StTrue)
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Condition::StFalse)
    }

    pub fn constraints(&self) -> Vec<(usize, U256)> {
        match self {
            Condition::StCond {
                tracked_pos,
                tracked_vals,
            } => tracked_pos.iter().copied().zip(tracked_vals.iter().copied()).collect(),
            _ => vec![],
        }
    }

    /// Index of `pos` in the tracked positions.
    pub fn find(&self, pos: usize) -> Option<usize> {
        match self {
            Condition::StCond { tracked_pos, .. } => tracked_pos.binary_search(&pos).ok(),
            _ => None,
        }
    }

    pub fn tracked_val_at(&self, pos: usize) -> Option<U256> {
        match self {
            Condition::StCond { tracked_vals, .. } => self.find(pos).map(|i| tracked_vals[i]),
            _ => None,
        }
    }

    /// Moves every constraint by `delta` slots. A constraint pushed above the top of
    /// the stack cannot be satisfied.
    pub fn shift(&self, delta: isize) -> Self {
        match self {
            Condition::StCond { .. } => {
                let mut shifted = Vec::new();
                for (pos, val) in self.constraints() {
                    match pos.checked_add_signed(delta) {
                        Some(pos) => shifted.push((pos, val)),
                        None => return Condition::StFalse,
                    }
                }
                Condition::new(shifted)
            }
            trivial => trivial.clone(),
        }
    }

    fn without(&self, pos: usize) -> Self {
        Condition::new(self.constraints().into_iter().filter(|(p, _)| *p != pos))
    }

    pub fn and(&self, other: &Condition) -> Self {
        match (self, other) {
            (Condition::StFalse, _) | (_, Condition::StFalse) => Condition::StFalse,
            (Condition::StTrue, c) | (c, Condition::StTrue) => c.clone(),
            _ => Condition::new(self.constraints().into_iter().chain(other.constraints())),
        }
    }

    /// Discharges the constraints that `state` decides. Known equal values drop out,
    /// known different values or missing slots make the condition false, opaque
    /// values leave their constraint in place.
    pub fn eval_on(&self, state: &AState) -> Self {
        if state.is_error() {
            return Condition::StFalse;
        }
        let mut remaining = Vec::new();
        for (pos, val) in self.constraints() {
            match state.peek(pos) {
                None => return Condition::StFalse,
                Some(StackElem::Value(v)) if *v == val => {}
                Some(StackElem::Value(_)) => return Condition::StFalse,
                Some(StackElem::Random(_)) => remaining.push((pos, val)),
            }
        }
        match self {
            Condition::StCond { .. } => Condition::new(remaining),
            trivial => trivial.clone(),
        }
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::StTrue => write!(f, "true"),
            Condition::StFalse => write!(f, "false"),
            Condition::StCond { .. } => write!(
                f,
                "{}",
                self.constraints()
                    .iter()
                    .map(|(pos, val)| format!("s{pos}=={val:#x}"))
                    .join(" && ")
            ),
        }
    }
}

impl Instruction {
    /// Weakest precondition of this instruction for `post`.
    pub fn wpre(&self, post: &Condition) -> Condition {
        if !matches!(post, Condition::StCond { .. }) {
            return post.clone();
        }
        let op = self.op;
        match op.opcode {
            JUMPDEST => return post.clone(),
            JUMP => return post.shift(1),
            JUMPI => return post.shift(2),
            _ => {}
        }
        if op.category == OpCategory::Invalid {
            return Condition::StFalse;
        }
        if op.is_push() {
            return match post.tracked_val_at(0) {
                Some(val) if val == self.arg_value() => post.without(0).shift(-1),
                Some(_) => Condition::StFalse,
                None => post.shift(-1),
            };
        }
        if op.is_dup() {
            let n = op.pops as usize;
            return match (post.tracked_val_at(0), post.tracked_val_at(n)) {
                (None, _) => post.shift(-1),
                (Some(top), Some(source)) if top == source => post.without(0).shift(-1),
                (Some(_), Some(_)) => Condition::StFalse,
                (Some(top), None) => post.without(0).shift(-1).and(&Condition::slot(n - 1, top)),
            };
        }
        if op.is_swap() {
            let n = op.pops as usize - 1;
            let swapped = post.constraints().into_iter().map(|(pos, val)| match pos {
                0 => (n, val),
                p if p == n => (0, val),
                p => (p, val),
            });
            return Condition::new(swapped);
        }
        // every other opcode leaves opaque results in its top `pushes` slots
        if post.constraints().iter().any(|(pos, _)| *pos < op.pushes as usize) {
            return Condition::StFalse;
        }
        post.shift(op.pops as isize - op.pushes as isize)
    }

    /// Minimum stack size before this instruction so that `post` items remain after it.
    pub fn weakest_pre_operands(&self, post: usize) -> usize {
        let needed = (post + self.op.pops as usize).saturating_sub(self.op.pushes as usize);
        needed.max(self.op.min_operands as usize)
    }

    /// Minimum free capacity before this instruction so that `post` slots remain free after it.
    pub fn weakest_pre_capacity(&self, post: usize) -> usize {
        let needed = (post + self.op.pushes as usize).saturating_sub(self.op.pops as usize);
        needed.max(self.op.min_capacity as usize)
    }
}

/// Folds [`Instruction::wpre`] backwards over `instructions`, stopping as soon as the
/// condition becomes trivial.
pub fn wpre_ins(instructions: &[Instruction], post: &Condition) -> Condition {
    let mut cond = post.clone();
    for ins in instructions.iter().rev() {
        if !matches!(cond, Condition::StCond { .. }) {
            break;
        }
        cond = ins.wpre(&cond);
    }
    cond
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_gen::dasm::disassemble;

    fn ins(code: &str) -> Vec<Instruction> {
        disassemble(&hex::decode(code).unwrap())
    }

    fn w(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn new_normalises() {
        assert_eq!(Condition::new([]), Condition::StTrue);
        assert_eq!(Condition::new([(1, w(2)), (1, w(3))]), Condition::StFalse);
        assert_eq!(
            Condition::new([(3, w(1)), (0, w(2)), (3, w(1))]),
            Condition::StCond {
                tracked_pos: vec![0, 3],
                tracked_vals: vec![w(2), w(1)]
            }
        );
    }

    #[test]
    fn push_discharges_matching_top() {
        let push = &ins("6005")[0];
        assert_eq!(push.wpre(&Condition::slot(0, w(5))), Condition::StTrue);
        assert_eq!(push.wpre(&Condition::slot(0, w(6))), Condition::StFalse);
        assert_eq!(push.wpre(&Condition::slot(2, w(6))), Condition::slot(1, w(6)));
        assert_eq!(
            push.wpre(&Condition::new([(0, w(5)), (1, w(7))])),
            Condition::slot(0, w(7))
        );
    }

    #[test]
    fn dup_maps_top_to_source() {
        // DUP3
        let dup = &ins("82")[0];
        assert_eq!(dup.wpre(&Condition::slot(0, w(9))), Condition::slot(2, w(9)));
        assert_eq!(dup.wpre(&Condition::slot(1, w(9))), Condition::slot(0, w(9)));
        assert_eq!(
            dup.wpre(&Condition::new([(0, w(9)), (3, w(9))])),
            Condition::slot(2, w(9))
        );
        assert_eq!(dup.wpre(&Condition::new([(0, w(9)), (3, w(8))])), Condition::StFalse);
    }

    #[test]
    fn swap_exchanges_positions() {
        // SWAP2
        let swap = &ins("91")[0];
        assert_eq!(
            swap.wpre(&Condition::new([(0, w(1)), (1, w(5))])),
            Condition::new([(2, w(1)), (1, w(5))])
        );
        assert_eq!(swap.wpre(&Condition::slot(2, w(4))), Condition::slot(0, w(4)));
    }

    #[test]
    fn opaque_result_cannot_satisfy_top() {
        let add = &ins("01")[0];
        assert_eq!(add.wpre(&Condition::slot(0, w(1))), Condition::StFalse);
        assert_eq!(add.wpre(&Condition::slot(1, w(1))), Condition::slot(2, w(1)));
        let pop = &ins("50")[0];
        assert_eq!(pop.wpre(&Condition::slot(0, w(1))), Condition::slot(1, w(1)));
    }

    #[test]
    fn jumps_consume_metadata() {
        let code = ins("56575b");
        assert_eq!(code[0].wpre(&Condition::slot(0, w(1))), Condition::slot(1, w(1)));
        assert_eq!(code[1].wpre(&Condition::slot(0, w(1))), Condition::slot(2, w(1)));
        assert_eq!(code[2].wpre(&Condition::slot(0, w(1))), Condition::slot(0, w(1)));
    }

    #[test]
    fn trivial_conditions_pass_through() {
        let add = &ins("01")[0];
        assert_eq!(add.wpre(&Condition::StTrue), Condition::StTrue);
        assert_eq!(add.wpre(&Condition::StFalse), Condition::StFalse);
    }

    #[test]
    fn fold_over_push_swap() {
        // PUSH1 0x0a, PUSH1 0x01, SWAP1 leaves 0x0a on top
        let code = ins("600a600190");
        assert_eq!(wpre_ins(&code, &Condition::slot(0, w(10))), Condition::StTrue);
        assert_eq!(wpre_ins(&code, &Condition::slot(0, w(1))), Condition::StFalse);
        assert_eq!(wpre_ins(&code, &Condition::slot(2, w(1))), Condition::slot(0, w(1)));
    }

    #[test]
    fn and_merges_and_detects_conflicts() {
        let a = Condition::slot(0, w(1));
        assert_eq!(a.and(&Condition::StTrue), a);
        assert_eq!(a.and(&Condition::slot(0, w(2))), Condition::StFalse);
        assert_eq!(a.and(&Condition::slot(1, w(2))), Condition::new([(0, w(1)), (1, w(2))]));
    }

    #[test]
    fn eval_on_state() {
        let state = AState::new(0, [StackElem::Value(w(4)), StackElem::Random("x".into())]);
        assert_eq!(Condition::slot(0, w(4)).eval_on(&state), Condition::StTrue);
        assert_eq!(Condition::slot(0, w(5)).eval_on(&state), Condition::StFalse);
        assert_eq!(Condition::slot(1, w(5)).eval_on(&state), Condition::slot(1, w(5)));
        assert_eq!(Condition::slot(2, w(5)).eval_on(&state), Condition::StFalse);
        assert_eq!(Condition::StTrue.eval_on(&AState::error("e")), Condition::StFalse);
    }

    #[test]
    fn operand_and_capacity_requirements() {
        let code = ins("600182");
        // PUSH1 needs nothing, leaves one more
        assert_eq!(code[0].weakest_pre_operands(3), 2);
        assert_eq!(code[0].weakest_pre_capacity(0), 1);
        // DUP3 needs three operands no matter what follows
        assert_eq!(code[1].weakest_pre_operands(0), 3);
        assert_eq!(code[1].weakest_pre_operands(5), 4);
    }

    #[test]
    fn display() {
        assert_eq!(Condition::new([(0, w(5)), (2, w(16))]).to_string(), "s0==0x5 && s2==0x10");
    }
}
