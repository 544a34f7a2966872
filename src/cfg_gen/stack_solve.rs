use ethers::types::U256;
use fnv::FnvBuildHasher;
use petgraph::prelude::*;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

use crate::cfg_gen::cfg_graph::*;
use crate::cfg_gen::error::{CfgError, Result};
use crate::cfg_gen::segments::*;
use crate::cfg_gen::state::AState;
use crate::cfg_gen::wp::Condition;
use crate::AnalysisConfig;

type Fingerprint = Option<Vec<Option<U256>>>;

/// One pending exploration step: a node to expand, with how it was reached.
struct Traverser {
    node: NodeIndex,
    seg: usize,
    /// `(segment, exit)` steps taken from the entry to reach `seg`
    path: Vec<(usize, bool)>,
    /// nodes on the way here (this one included) with the known stack at their entry
    trail: Vec<(NodeIndex, usize, Fingerprint)>,
    state: AState,
    depth: usize,
}

impl Traverser {
    fn step(&self, exit: bool, node: NodeIndex, seg: usize, state: AState) -> Self {
        let mut path = self.path.clone();
        path.push((self.seg, exit));
        let mut trail = self.trail.clone();
        trail.push((node, seg, state.known_stack()));
        Self {
            node,
            seg,
            path,
            trail,
            state,
            depth: self.depth - 1,
        }
    }
}

/// Segments `from` provably jumps to when reached along `path` from the entry.
fn resolve_jump_targets(segments: &[Segment], path: &[(usize, bool)], from: usize) -> Vec<usize> {
    let seg = &segments[from];
    let mut full_path = path.to_vec();
    full_path.push((from, true));
    let entry = AState::default();
    (0..segments.len())
        .filter(|&candidate| {
            let target = segments[candidate].start_address();
            if seg.leads_to(target, true).is_false() {
                return false;
            }
            let cond =
                wpre_seq_segs(segments, &full_path, &Condition::StTrue, target).eval_on(&entry);
            trace!("jump {:?} -> {:?}: {}", seg, segments[candidate], cond);
            cond.is_true()
        })
        .collect()
}

/// Breadth-first exploration of the segments reachable from the entry, at most
/// `config.max_depth` segments deep. Jump edges are added only for targets whose
/// path precondition, evaluated on the empty entry stack, is `true`.
pub fn build_cfg(segments: &[Segment], config: &AnalysisConfig) -> Result<BoolCfg> {
    let first = segments.first().ok_or(CfgError::NoSegments)?;
    if config.entry_address != 0 || first.start_address() != 0 {
        let address = if config.entry_address != 0 {
            config.entry_address
        } else {
            first.start_address()
        };
        return Err(CfgError::EntryNotAtZero { address });
    }

    let entry_state = AState::default();
    let mut cfg = BoolCfg::new(CfgNode::for_segment(0, first, 0));
    let mut visited: HashMap<(usize, usize), NodeIndex, FnvBuildHasher> = HashMap::default();
    visited.insert((0, config.max_depth), cfg.entry);

    let mut unvisited_queue: VecDeque<Traverser> = VecDeque::new();
    unvisited_queue.push_back(Traverser {
        node: cfg.entry,
        seg: 0,
        path: vec![],
        trail: vec![(cfg.entry, 0, entry_state.known_stack())],
        state: entry_state,
        depth: config.max_depth,
    });

    while let Some(current) = unvisited_queue.pop_front() {
        let seg = &segments[current.seg];
        if seg.is_terminal() || current.depth == 0 {
            continue;
        }

        for exit in [false, true] {
            if !seg.has_exit(exit) {
                continue;
            }
            let next_state = seg.run(&current.state, exit);
            if let AState::Error(msg) = &next_state {
                trace!("path through {:?} dropped: {}", seg, msg);
                continue;
            }
            let successors = if exit {
                resolve_jump_targets(segments, &current.path, current.seg)
            } else {
                let address = seg.start_address_next_seg();
                let next = pc_to_seg(segments, address).ok_or(CfgError::MissingSegment {
                    address,
                    from: seg.start_address(),
                })?;
                vec![next]
            };
            for succ in successors {
                if next_state.pc() != Some(segments[succ].start_address()) {
                    trace!("path through {:?} does not reach {:?}", seg, segments[succ]);
                    continue;
                }

                let fingerprint = next_state.known_stack();
                if let Some((ancestor, ..)) = current
                    .trail
                    .iter()
                    .find(|(_, s, fp)| *s == succ && *fp == fingerprint)
                {
                    debug!("back edge {:?} -> {:?}", seg, segments[succ]);
                    cfg.add_edge(current.node, *ancestor, exit);
                    continue;
                }

                let key = (succ, current.depth - 1);
                if let Some(&existing) = visited.get(&key) {
                    cfg.add_edge(current.node, existing, exit);
                    continue;
                }

                let index = cfg.node_count();
                let node = cfg.add_node(CfgNode::for_segment(succ, &segments[succ], index));
                debug!("node {} for {:?} at depth {}", index, segments[succ], key.1);
                visited.insert(key, node);
                cfg.add_edge(current.node, node, exit);
                unvisited_queue.push_back(current.step(exit, node, succ, next_state.clone()));
            }
        }
    }
    Ok(cfg)
}
