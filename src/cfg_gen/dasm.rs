use crate::cfg_gen::*;
use ethers::types::U256;
use std::fmt::{Debug, Display};

/// A decoded instruction: opcode, immediate bytes and byte offset in the buffer.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: &'static Opcode,
    pub arg: Vec<u8>,
    pub address: usize,
}

impl Instruction {
    pub fn new(code: u8, arg: Vec<u8>, address: usize) -> Self {
        Self {
            op: opcode(code),
            arg,
            address,
        }
    }

    /// false for a push whose immediate was cut short by the end of the buffer,
    /// or for a non-push carrying argument bytes
    pub fn is_valid(&self) -> bool {
        self.arg.len() == self.op.push_width()
    }

    pub fn is_terminal(&self) -> bool {
        self.op.is_terminal()
    }

    pub fn is_jump_dest(&self) -> bool {
        self.op.is_jump_dest()
    }

    pub fn stack_effect(&self) -> i32 {
        self.op.stack_effect()
    }

    // missing leading bytes of a truncated immediate read as zero
    pub fn arg_value(&self) -> U256 {
        U256::from_big_endian(&self.arg)
    }

    /// Address of the instruction laid out right after this one.
    pub fn next_address(&self) -> usize {
        self.address + 1 + self.arg.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.arg.len());
        bytes.push(self.op.opcode);
        bytes.extend_from_slice(&self.arg);
        bytes
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.op.is_push() && !self.arg.is_empty() {
            write!(f, "{} 0x{}", self.op.name, hex::encode(&self.arg))
        } else {
            write!(f, "{}", self.op.name)
        }
    }
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", format_pc(self.address), self)
    }
}

/// Decodes the whole buffer. Never fails: unknown bytes become INVALID opcodes and a
/// push running past the end keeps whatever immediate bytes remain.
pub fn disassemble(bytecode: &[u8]) -> Vec<Instruction> {
    let mut pc: usize = 0;
    let mut instructions = Vec::new();
    while pc < bytecode.len() {
        let op = opcode(bytecode[pc]);
        let arg_end = (pc + 1 + op.push_width()).min(bytecode.len());
        let instruction = Instruction::new(bytecode[pc], bytecode[pc + 1..arg_end].to_vec(), pc);
        pc = instruction.next_address();
        instructions.push(instruction);
    }
    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use revm::interpreter::opcode::{PUSH0, STOP};

    #[test]
    fn decodes_push_then_jump() {
        let ins = disassemble(&hex::decode("600556").unwrap());
        assert_eq!(ins.len(), 2);
        assert_eq!(ins[0].op.name, "PUSH1");
        assert_eq!(ins[0].arg, vec![0x05]);
        assert_eq!(ins[0].arg_value(), U256::from(5));
        assert_eq!(ins[1].address, 2);
        assert_eq!(ins[1].op.name, "JUMP");
        assert!(ins[1].is_terminal());
    }

    #[test]
    fn truncated_push_is_kept_but_invalid() {
        let ins = disassemble(&hex::decode("00620102").unwrap());
        assert_eq!(ins.len(), 2);
        let push = &ins[1];
        assert_eq!(push.op.name, "PUSH3");
        assert_eq!(push.arg, vec![0x01, 0x02]);
        assert!(!push.is_valid());
        assert_eq!(push.arg_value(), U256::from(0x0102));
        assert_eq!(push.next_address(), 4);
    }

    #[test]
    fn push0_has_no_immediate() {
        let ins = disassemble(&[PUSH0, STOP]);
        assert_eq!(ins[0].arg.len(), 0);
        assert!(ins[0].is_valid());
        assert_eq!(ins[0].arg_value(), U256::zero());
        assert_eq!(ins[1].address, 1);
    }

    #[test]
    fn unknown_byte_decodes_as_invalid() {
        let ins = disassemble(&[0x0c]);
        assert_eq!(ins[0].op.category, OpCategory::Invalid);
        assert_eq!(ins[0].op.opcode, 0x0c);
        assert_eq!(ins[0].encode(), vec![0x0c]);
    }

    #[test]
    fn display_shows_immediate() {
        let ins = disassemble(&hex::decode("61abcd01").unwrap());
        assert_eq!(ins[0].to_string(), "PUSH2 0xabcd");
        assert_eq!(ins[1].to_string(), "ADD");
        assert_eq!(format!("{:?}", ins[1]), "[03] ADD");
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        assert!(disassemble(&[]).is_empty());
    }
}
