pub mod cfg_gen;

use cfg_gen::cfg_graph::BoolCfg;
use cfg_gen::dasm::{disassemble, Instruction};
use cfg_gen::error::Result;
use cfg_gen::minimiser::minimise;
use cfg_gen::segments::{split_segments, Segment};
use cfg_gen::stack_solve::build_cfg;
use tracing::info;

/// Knobs of the CFG construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// how many segments deep exploration goes from the entry
    pub max_depth: usize,
    /// must be 0 for whole-program analysis
    pub entry_address: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_depth: 100,
            entry_address: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputHandler {
    pub show_timings: bool,
    pub show_instructions: bool,
    pub show_segments: bool,
    pub show_raw_cfg: bool,
}

impl OutputHandler {
    pub fn new(
        show_timings: bool,
        show_instructions: bool,
        show_segments: bool,
        show_raw_cfg: bool,
    ) -> Self {
        Self {
            show_timings,
            show_instructions,
            show_segments,
            show_raw_cfg,
        }
    }
}

/// Everything the pipeline produces for one bytecode buffer.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub instructions: Vec<Instruction>,
    pub segments: Vec<Segment>,
    pub raw_cfg: BoolCfg,
    pub cfg: BoolCfg,
}

/// Decode, segment, explore and minimise.
pub fn analyze(bytecode: &[u8], config: &AnalysisConfig) -> Result<Analysis> {
    let instructions = disassemble(bytecode);
    let segments = split_segments(&instructions);
    info!("{} instructions in {} segments", instructions.len(), segments.len());
    let raw_cfg = build_cfg(&segments, config)?;
    let cfg = minimise(&raw_cfg);
    info!(
        "raw cfg: {} nodes, {} edges; minimised: {} nodes, {} edges",
        raw_cfg.node_count(),
        raw_cfg.edge_count(),
        cfg.node_count(),
        cfg.edge_count()
    );
    Ok(Analysis {
        instructions,
        segments,
        raw_cfg,
        cfg,
    })
}
