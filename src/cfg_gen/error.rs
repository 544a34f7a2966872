//! Structural failures of the CFG construction.
//!
//! Decoding problems and per-path execution errors never surface here: they are
//! carried as INVALID opcodes and [`crate::cfg_gen::state::AState::Error`] values.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("Bytecode contains no segments")]
    NoSegments,

    #[error("Segment 0 does not start at address 0 (entry requested at {address:#x})")]
    EntryNotAtZero { address: usize },

    #[error("No segment starts at {address:#x}, the successor of the segment at {from:#x}")]
    MissingSegment { address: usize, from: usize },
}

pub type Result<T> = std::result::Result<T, CfgError>;
