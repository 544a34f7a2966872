use crate::cfg_gen::segments::{Segment, SegmentKind};
use crate::cfg_gen::*;
use itertools::Itertools;
use lazy_static::lazy_static;
use petgraph::dot::{Config, Dot};
use petgraph::prelude::*;
use revm::interpreter::opcode::{REVERT, SELFDESTRUCT};
use std::collections::HashMap;

lazy_static! {
    pub static ref TOKYO_NIGHT_COLORS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("red", "#f7768e");
        m.insert("yellow", "#e0af68");
        m.insert("green", "#9ece6a");
        m.insert("darkblue", "#7aa2f7");
        m.insert("bg", "#1a1b26");
        m.insert("font", "#c0caf5");
        m.insert("deepred", "#703440");
        m
    };
}

/// A graph node: one explored segment, or a class of them after minimisation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfgNode {
    /// start addresses of the segments the node stands for
    pub addresses: Vec<usize>,
    pub segment: usize,
    /// raw node indices folded into this node
    pub members: Vec<usize>,
}

impl CfgNode {
    pub fn for_segment(segment: usize, seg: &Segment, index: usize) -> Self {
        Self {
            addresses: vec![seg.start_address()],
            segment,
            members: vec![index],
        }
    }
}

/// Control-flow graph over segments. Edge weights are branch outcomes: `true` for a
/// taken jump, `false` for a fallthrough.
#[derive(Clone, Debug)]
pub struct BoolCfg {
    pub graph: DiGraph<CfgNode, bool>,
    pub entry: NodeIndex,
}

impl BoolCfg {
    pub fn new(entry: CfgNode) -> Self {
        let mut graph = DiGraph::new();
        let entry = graph.add_node(entry);
        Self { graph, entry }
    }

    pub fn add_node(&mut self, node: CfgNode) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Adds `from -> to` unless an edge with the same label is already there.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, exit: bool) {
        if !self.graph.edges_connecting(from, to).any(|e| *e.weight() == exit) {
            self.graph.add_edge(from, to, exit);
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, index: NodeIndex) -> &CfgNode {
        &self.graph[index]
    }

    /// Outgoing `(label, target)` pairs, sorted.
    pub fn successors(&self, index: NodeIndex) -> Vec<(bool, NodeIndex)> {
        self.graph
            .edges(index)
            .map(|e| (*e.weight(), e.target()))
            .sorted()
            .collect()
    }

    /// The segment start addresses reached by `(label, address)` edges, sorted.
    pub fn successor_addresses(&self, index: NodeIndex) -> Vec<(bool, usize)> {
        self.successors(index)
            .into_iter()
            .flat_map(|(label, target)| {
                self.graph[target]
                    .addresses
                    .iter()
                    .map(move |a| (label, *a))
            })
            .sorted()
            .collect()
    }

    /// Entry exists, every node names an existing segment and carries at least one
    /// address and one raw member.
    pub fn is_valid(&self, segments: &[Segment]) -> bool {
        self.graph.node_weight(self.entry).is_some()
            && self.graph.node_weights().all(|node| {
                node.segment < segments.len()
                    && !node.addresses.is_empty()
                    && !node.members.is_empty()
            })
    }

    pub fn cfg_dot_str_with_segments(&self, segments: &[Segment]) -> String {
        let mut dot_str = Vec::new();
        let font = TOKYO_NIGHT_COLORS["font"];
        dot_str.push(format!(
            r##"digraph G {{
    node [shape=box, style="filled, rounded", color="#565f89", fontcolor="{font}", fontname="Helvetica", fillcolor="#24283b"];
    edge [color="#414868", fontcolor="{font}", fontname="Helvetica"];
    bgcolor="{}";"##,
            TOKYO_NIGHT_COLORS["bg"]
        ));

        let nodes_and_edges_str = format!(
            "{:?}",
            Dot::with_attr_getters(
                &self.graph,
                &[Config::GraphContentOnly, Config::NodeNoLabel, Config::EdgeNoLabel],
                &|_graph, edge_ref| {
                    let source_kind = segments
                        .get(self.graph[edge_ref.source()].segment)
                        .map(Segment::kind);
                    match (source_kind, *edge_ref.weight()) {
                        (Some(SegmentKind::Jumpi), true) => {
                            format!("label = \"True\" color = \"{}\"", TOKYO_NIGHT_COLORS["green"])
                        }
                        (Some(SegmentKind::Jumpi), false) => {
                            format!("label = \"False\" color = \"{}\"", TOKYO_NIGHT_COLORS["red"])
                        }
                        _ => String::new(),
                    }
                },
                &|_graph, (index, node)| {
                    let mut node_str = format!("label = \"{}\"", node_label(node, segments));
                    if let Some(color) = segments.get(node.segment).and_then(node_color) {
                        node_str.push_str(&format!(" color = \"{color}\""));
                    }
                    if index == self.entry {
                        node_str.push_str(" shape = invhouse");
                    } else if node.members.len() > 1 {
                        let fill = TOKYO_NIGHT_COLORS["deepred"];
                        node_str.push_str(&format!(" fillcolor = \"{fill}\""));
                    }
                    node_str
                },
            )
        );
        dot_str.push(nodes_and_edges_str);
        dot_str.push("}".to_string());
        dot_str.join("\n")
    }
}

fn node_label(node: &CfgNode, segments: &[Segment]) -> String {
    let header = node.addresses.iter().map(|a| format_pc(*a)).join(",");
    let body = segments
        .get(node.segment)
        .map(|seg| {
            seg.instructions()
                .iter()
                .map(|ins| format!("{}: {}", format_pc(ins.address), ins))
                .join("\\l")
        })
        .unwrap_or_default();
    format!("[{header}] x{}\\l{body}\\l", node.members.len())
}

fn node_color(seg: &Segment) -> Option<&'static str> {
    match seg.kind() {
        SegmentKind::Invalid => Some(TOKYO_NIGHT_COLORS["red"]),
        SegmentKind::Stop if seg.last().op.opcode == REVERT => Some(TOKYO_NIGHT_COLORS["red"]),
        SegmentKind::Stop if seg.last().op.opcode == SELFDESTRUCT => {
            Some(TOKYO_NIGHT_COLORS["yellow"])
        }
        SegmentKind::Stop | SegmentKind::Return => Some(TOKYO_NIGHT_COLORS["darkblue"]),
        _ => None,
    }
}
