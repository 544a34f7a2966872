use crate::cfg_gen::cfg_graph::{BoolCfg, CfgNode};
use crate::cfg_gen::partition::Partition;
use itertools::Itertools;
use petgraph::prelude::*;
use std::collections::BTreeSet;
use tracing::debug;

/// Class of every node under `partition`, indexed by node index.
fn class_map(partition: &Partition) -> Vec<usize> {
    let mut classes = vec![0; partition.n()];
    for (class, block) in partition.blocks().iter().enumerate() {
        for &x in block {
            classes[x] = class;
        }
    }
    classes
}

/// What a node can observe in one step: its labelled successors' classes.
fn signature(cfg: &BoolCfg, classes: &[usize], x: usize) -> Vec<(bool, usize)> {
    cfg.successors(NodeIndex::new(x))
        .into_iter()
        .map(|(label, target)| (label, classes[target.index()]))
        .sorted()
        .dedup()
        .collect()
}

/// Nodes are first told apart by the segment they run.
pub fn initial_partition(cfg: &BoolCfg) -> Partition {
    let segments: Vec<usize> = cfg.graph.node_weights().map(|node| node.segment).collect();
    Partition::from_classes(&segments)
}

/// No block holds two nodes with different signatures.
pub fn is_stable(cfg: &BoolCfg, partition: &Partition) -> bool {
    let classes = class_map(partition);
    partition.blocks().iter().all(|block| {
        block
            .iter()
            .map(|&x| signature(cfg, &classes, x))
            .all_equal()
    })
}

/// Moore refinement: split blocks by successor signature until nothing changes.
pub fn refine(cfg: &BoolCfg) -> Partition {
    let mut partition = initial_partition(cfg);
    'outer: loop {
        let classes = class_map(&partition);
        for index in 0..partition.len() {
            let split = partition.split_at(index, |x| signature(cfg, &classes, x));
            if split.len() > partition.len() {
                debug!("split block {index} into {} blocks", split.len() - partition.len() + 1);
                partition = split;
                continue 'outer;
            }
        }
        return partition;
    }
}

/// Quotient graph of `cfg` under `partition`. Blocks are numbered by their smallest
/// member, so the entry's block keeps index 0 when the entry is node 0.
pub fn quotient(cfg: &BoolCfg, partition: &Partition) -> BoolCfg {
    let blocks = partition
        .blocks()
        .iter()
        .sorted_by_key(|block| block.iter().next().copied())
        .collect_vec();
    let mut block_of = vec![0; partition.n()];
    for (i, block) in blocks.iter().enumerate() {
        for &x in block.iter() {
            block_of[x] = i;
        }
    }

    let merged = |block: &BTreeSet<usize>| {
        let members: Vec<usize> = block.iter().copied().collect();
        let addresses = members
            .iter()
            .flat_map(|&x| cfg.graph[NodeIndex::new(x)].addresses.iter().copied())
            .sorted()
            .dedup()
            .collect();
        let segment = cfg.graph[NodeIndex::new(members[0])].segment;
        CfgNode {
            addresses,
            segment,
            members,
        }
    };

    let entry_block = block_of[cfg.entry.index()];
    let mut graph = DiGraph::new();
    for &block in &blocks {
        graph.add_node(merged(block));
    }
    let mut minimised = BoolCfg {
        graph,
        entry: NodeIndex::new(entry_block),
    };
    for edge in cfg.graph.edge_references() {
        minimised.add_edge(
            NodeIndex::new(block_of[edge.source().index()]),
            NodeIndex::new(block_of[edge.target().index()]),
            *edge.weight(),
        );
    }
    minimised
}

pub fn minimise(cfg: &BoolCfg) -> BoolCfg {
    let partition = refine(cfg);
    debug!(
        "minimised {} nodes into {} classes",
        cfg.node_count(),
        partition.len()
    );
    quotient(cfg, &partition)
}
