//! Channel Head Resolution
//!
//! Builds a petgraph view of one channel (members as nodes, replaces and
//! skips as edges) and derives its head candidates, cycles and the members
//! not reachable from a chosen head.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

use super::{BundleId, ChannelGraph, PackageGraph};

/// Edge flavour in the channel view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEdge {
    Replaces,
    Skips,
}

/// What head computation found for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadResolution {
    /// Members with zero incoming upgrade edges
    pub candidates: Vec<BundleId>,
    /// Whether the edges form a cycle
    pub cyclic: bool,
}

impl HeadResolution {
    /// The head, when exactly one candidate exists and there is no cycle
    pub fn unique(&self) -> Option<BundleId> {
        match (self.cyclic, self.candidates.as_slice()) {
            (false, [only]) => Some(*only),
            _ => None,
        }
    }
}

/// Channel view as a directed graph: edge `a → b` means `a` upgrades `b`
pub struct ChannelView {
    graph: DiGraph<BundleId, UpgradeEdge>,
    index: HashMap<BundleId, NodeIndex>,
}

impl ChannelView {
    pub fn build(channel: &ChannelGraph) -> Self {
        let mut graph = DiGraph::with_capacity(channel.members.len(), channel.members.len() * 2);
        let mut index = HashMap::with_capacity(channel.members.len());
        for id in &channel.members {
            index.insert(*id, graph.add_node(*id));
        }
        for (from, to) in &channel.replaces {
            if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
                graph.add_edge(a, b, UpgradeEdge::Replaces);
            }
        }
        for (from, to) in &channel.skips {
            if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
                graph.add_edge(a, b, UpgradeEdge::Skips);
            }
        }
        Self { graph, index }
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Members nothing upgrades from, in id order
    pub fn sources(&self) -> Vec<BundleId> {
        let mut sources: Vec<BundleId> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n])
            .collect();
        sources.sort();
        sources
    }

    /// Members reachable from `head` by following upgrade edges
    pub fn reachable_from(&self, head: BundleId) -> BTreeSet<BundleId> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(&head) else {
            return seen;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(n) = dfs.next(&self.graph) {
            seen.insert(self.graph[n]);
        }
        seen
    }

    /// Whether adding `from → to` would close a cycle
    pub fn would_cycle(&self, from: BundleId, to: BundleId) -> bool {
        if from == to {
            return true;
        }
        self.reachable_from(to).contains(&from)
    }
}

/// Compute head candidates for a channel of `pkg`
pub fn resolve_head(pkg: &PackageGraph, channel: &str) -> HeadResolution {
    let Some(ch) = pkg.channel(channel) else {
        return HeadResolution {
            candidates: Vec::new(),
            cyclic: false,
        };
    };
    let view = ChannelView::build(ch);
    HeadResolution {
        candidates: view.sources(),
        cyclic: view.is_cyclic(),
    }
}

/// Members of `channel` not reachable from `head`
pub fn unreachable_from(ch: &ChannelGraph, head: BundleId) -> BTreeSet<BundleId> {
    let reachable = ChannelView::build(ch).reachable_from(head);
    ch.members.difference(&reachable).copied().collect()
}
