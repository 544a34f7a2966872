use lazy_static::lazy_static;
use revm::interpreter::opcode::{
    DUP1, DUP16, INVALID, JUMP, JUMPDEST, JUMPI, PUSH0, PUSH32, RETURN, REVERT, SELFDESTRUCT, STOP,
    SWAP1, SWAP16,
};
use std::fmt::Debug;

pub mod cfg_graph;
pub mod dasm;
pub mod error;
pub mod minimiser;
pub mod partition;
pub mod segments;
pub mod stack_solve;
pub mod state;
pub mod wp;

pub const BLOCK_ENDERS_U8: [u8; 7] = [JUMP, JUMPI, STOP, RETURN, REVERT, INVALID, SELFDESTRUCT];

// Opcodes that end a STOP-tagged segment
pub const HALTING_U8: [u8; 3] = [STOP, REVERT, SELFDESTRUCT];

pub const MAX_STACK_SIZE: usize = 1024;

/// Operation family of an opcode. Drives both the abstract transition and the
/// weakest-precondition rule applied to an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCategory {
    Arithmetic,
    Comparison,
    Bitwise,
    Hashing,
    Environment,
    Memory,
    Storage,
    Jump,
    Stack,
    Logging,
    Call,
    System,
    Invalid,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Opcode {
    pub name: String,
    pub opcode: u8,
    pub category: OpCategory,
    /// free stack slots the opcode needs before it runs
    pub min_capacity: u16,
    /// stack items the opcode needs before it runs
    pub min_operands: u16,
    pub pushes: u16,
    pub pops: u16,
}

impl Debug for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Opcode {
    fn new(
        name: impl Into<String>,
        opcode: u8,
        category: OpCategory,
        pops: u16,
        pushes: u16,
    ) -> Self {
        Self {
            name: name.into(),
            opcode,
            category,
            min_capacity: pushes.saturating_sub(pops),
            min_operands: pops,
            pushes,
            pops,
        }
    }

    pub fn is_push(&self) -> bool {
        (PUSH0..=PUSH32).contains(&self.opcode)
    }

    /// Number of immediate bytes following the opcode byte.
    pub fn push_width(&self) -> usize {
        if self.is_push() {
            (self.opcode - PUSH0) as usize
        } else {
            0
        }
    }

    pub fn is_dup(&self) -> bool {
        (DUP1..=DUP16).contains(&self.opcode)
    }

    pub fn is_swap(&self) -> bool {
        (SWAP1..=SWAP16).contains(&self.opcode)
    }

    pub fn is_jump_dest(&self) -> bool {
        self.opcode == JUMPDEST
    }

    pub fn is_terminal(&self) -> bool {
        BLOCK_ENDERS_U8.contains(&self.opcode) || self.category == OpCategory::Invalid
    }

    pub fn stack_effect(&self) -> i32 {
        self.pushes as i32 - self.pops as i32
    }
}

lazy_static! {
    /// One entry per byte value. Unassigned bytes decode to an INVALID-category opcode
    /// with zero arity.
    pub static ref OPCODE_TABLE: Vec<Opcode> = (0..=u8::MAX).map(build_opcode).collect();
}

// Returns the opcode for the given hexcode.
pub fn opcode(code: u8) -> &'static Opcode {
    &OPCODE_TABLE[code as usize]
}

fn build_opcode(code: u8) -> Opcode {
    use OpCategory::*;
    let op = |name: &str, category, pops, pushes| Opcode::new(name, code, category, pops, pushes);
    match code {
        0x00 => op("STOP", System, 0, 0),
        0x01 => op("ADD", Arithmetic, 2, 1),
        0x02 => op("MUL", Arithmetic, 2, 1),
        0x03 => op("SUB", Arithmetic, 2, 1),
        0x04 => op("DIV", Arithmetic, 2, 1),
        0x05 => op("SDIV", Arithmetic, 2, 1),
        0x06 => op("MOD", Arithmetic, 2, 1),
        0x07 => op("SMOD", Arithmetic, 2, 1),
        0x08 => op("ADDMOD", Arithmetic, 3, 1),
        0x09 => op("MULMOD", Arithmetic, 3, 1),
        0x0a => op("EXP", Arithmetic, 2, 1),
        0x0b => op("SIGNEXTEND", Arithmetic, 2, 1),
        0x10 => op("LT", Comparison, 2, 1),
        0x11 => op("GT", Comparison, 2, 1),
        0x12 => op("SLT", Comparison, 2, 1),
        0x13 => op("SGT", Comparison, 2, 1),
        0x14 => op("EQ", Comparison, 2, 1),
        0x15 => op("ISZERO", Comparison, 1, 1),
        0x16 => op("AND", Bitwise, 2, 1),
        0x17 => op("OR", Bitwise, 2, 1),
        0x18 => op("XOR", Bitwise, 2, 1),
        0x19 => op("NOT", Bitwise, 1, 1),
        0x1a => op("BYTE", Bitwise, 2, 1),
        0x1b => op("SHL", Bitwise, 2, 1),
        0x1c => op("SHR", Bitwise, 2, 1),
        0x1d => op("SAR", Bitwise, 2, 1),
        0x20 => op("KECCAK256", Hashing, 2, 1),
        0x30 => op("ADDRESS", Environment, 0, 1),
        0x31 => op("BALANCE", Environment, 1, 1),
        0x32 => op("ORIGIN", Environment, 0, 1),
        0x33 => op("CALLER", Environment, 0, 1),
        0x34 => op("CALLVALUE", Environment, 0, 1),
        0x35 => op("CALLDATALOAD", Environment, 1, 1),
        0x36 => op("CALLDATASIZE", Environment, 0, 1),
        0x37 => op("CALLDATACOPY", Environment, 3, 0),
        0x38 => op("CODESIZE", Environment, 0, 1),
        0x39 => op("CODECOPY", Environment, 3, 0),
        0x3a => op("GASPRICE", Environment, 0, 1),
        0x3b => op("EXTCODESIZE", Environment, 1, 1),
        0x3c => op("EXTCODECOPY", Environment, 4, 0),
        0x3d => op("RETURNDATASIZE", Environment, 0, 1),
        0x3e => op("RETURNDATACOPY", Environment, 3, 0),
        0x3f => op("EXTCODEHASH", Environment, 1, 1),
        0x40 => op("BLOCKHASH", Environment, 1, 1),
        0x41 => op("COINBASE", Environment, 0, 1),
        0x42 => op("TIMESTAMP", Environment, 0, 1),
        0x43 => op("NUMBER", Environment, 0, 1),
        0x44 => op("PREVRANDAO", Environment, 0, 1),
        0x45 => op("GASLIMIT", Environment, 0, 1),
        0x46 => op("CHAINID", Environment, 0, 1),
        0x47 => op("SELFBALANCE", Environment, 0, 1),
        0x48 => op("BASEFEE", Environment, 0, 1),
        0x49 => op("BLOBHASH", Environment, 1, 1),
        0x4a => op("BLOBBASEFEE", Environment, 0, 1),
        0x50 => op("POP", Stack, 1, 0),
        0x51 => op("MLOAD", Memory, 1, 1),
        0x52 => op("MSTORE", Memory, 2, 0),
        0x53 => op("MSTORE8", Memory, 2, 0),
        0x54 => op("SLOAD", Storage, 1, 1),
        0x55 => op("SSTORE", Storage, 2, 0),
        0x56 => op("JUMP", Jump, 1, 0),
        0x57 => op("JUMPI", Jump, 2, 0),
        0x58 => op("PC", Environment, 0, 1),
        0x59 => op("MSIZE", Memory, 0, 1),
        0x5a => op("GAS", Environment, 0, 1),
        0x5b => op("JUMPDEST", Jump, 0, 0),
        0x5c => op("TLOAD", Storage, 1, 1),
        0x5d => op("TSTORE", Storage, 2, 0),
        0x5e => op("MCOPY", Memory, 3, 0),
        0x5f..=0x7f => op(&format!("PUSH{}", code - PUSH0), Stack, 0, 1),
        0x80..=0x8f => {
            let n = (code - DUP1 + 1) as u16;
            op(&format!("DUP{n}"), Stack, n, n + 1)
        }
        0x90..=0x9f => {
            let n = (code - SWAP1 + 1) as u16;
            op(&format!("SWAP{n}"), Stack, n + 1, n + 1)
        }
        0xa0..=0xa4 => {
            let n = (code - 0xa0) as u16;
            op(&format!("LOG{n}"), Logging, n + 2, 0)
        }
        0xf0 => op("CREATE", Call, 3, 1),
        0xf1 => op("CALL", Call, 7, 1),
        0xf2 => op("CALLCODE", Call, 7, 1),
        0xf3 => op("RETURN", System, 2, 0),
        0xf4 => op("DELEGATECALL", Call, 6, 1),
        0xf5 => op("CREATE2", Call, 4, 1),
        0xfa => op("STATICCALL", Call, 6, 1),
        0xfd => op("REVERT", System, 2, 0),
        0xff => op("SELFDESTRUCT", System, 1, 0),
        _ => op("INVALID", Invalid, 0, 0),
    }
}

pub(crate) fn format_pc(pc: usize) -> String {
    let pad_width = if pc <= u8::MAX as usize { 2 } else { 4 };
    format!("{pc:0>pad_width$x}")
}
