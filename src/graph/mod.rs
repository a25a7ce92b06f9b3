//! Catalog Graph Snapshots
//!
//! In-memory form of a package's channel graphs. Bundles live in an arena
//! (`Vec<BundleNode>`) and are addressed by [`BundleId`]; channels hold
//! membership sets and edge pairs between ids, so the graph never needs
//! pointers between nodes.
//!
//! A snapshot is owned by whoever holds it: the merge engine while it works,
//! the store while it persists, the materializer while it renders.
//!
//! ```text
//! package prometheus (default: preview)
//! └── channel preview
//!     head: prometheusoperator.0.22.2
//!     prometheusoperator.0.22.2 ─replaces→ prometheusoperator.0.15.0
//!     prometheusoperator.0.15.0 ─replaces→ prometheusoperator.0.14.0
//! ```

pub mod diagnostics;
pub mod heads;
pub mod upgrade;

pub use diagnostics::{MergeWarning, WarningCode, Warnings};
pub use heads::{resolve_head, HeadResolution};
pub use upgrade::{minimal_chain, replaces_chain, upgrade_targets};

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::bundle::BundleDescriptor;
use crate::checksum::Digest;
use crate::version::SkipRange;

/// Arena index of a bundle inside one [`PackageGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId(pub u32);

impl BundleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a bundle is visible to queries and export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Live,
    /// Soft-deleted: kept for provenance, hidden from export and queries
    Pruned,
}

/// A stored bundle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleNode {
    pub name: String,
    pub version: Version,
    pub digest: Digest,
    pub content: serde_json::Value,
    pub replaces: Option<String>,
    pub skips: Vec<String>,
    pub skip_range: Option<SkipRange>,
    pub state: BundleState,
}

impl BundleNode {
    pub fn from_descriptor(desc: &BundleDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            version: desc.version.clone(),
            digest: desc.digest(),
            content: desc.content.clone(),
            replaces: desc.replaces.clone(),
            skips: desc.skips.clone(),
            skip_range: desc.skip_range.clone(),
            state: BundleState::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == BundleState::Live
    }

    /// Same name, version and content
    pub fn same_identity(&self, desc: &BundleDescriptor) -> bool {
        self.name == desc.name && self.version == desc.version && self.digest == desc.digest()
    }

    /// Whether this bundle can upgrade directly from `other` without a
    /// replaces edge
    pub fn can_skip(&self, other: &BundleNode) -> bool {
        self.skips.iter().any(|s| s == &other.name)
            || self
                .skip_range
                .as_ref()
                .map(|r| r.contains(&other.version))
                .unwrap_or(false)
    }
}

/// One channel's view of the package graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelGraph {
    pub name: String,
    pub members: BTreeSet<BundleId>,
    /// `from → to`: `from` replaces `to`
    pub replaces: BTreeMap<BundleId, BundleId>,
    /// `(from, to)`: `from` skips `to`
    pub skips: BTreeSet<(BundleId, BundleId)>,
    pub head: Option<BundleId>,
}

impl ChannelGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drop a member together with every edge touching it
    pub fn detach(&mut self, id: BundleId) {
        self.members.remove(&id);
        self.replaces.retain(|from, to| *from != id && *to != id);
        self.skips.retain(|(from, to)| *from != id && *to != id);
        if self.head == Some(id) {
            self.head = None;
        }
    }

    /// Ids with an upgrade edge (replaces or skips) pointing at them
    pub fn targets(&self) -> BTreeSet<BundleId> {
        self.replaces
            .values()
            .copied()
            .chain(self.skips.iter().map(|(_, to)| *to))
            .collect()
    }
}

/// The materialized graph of one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageGraph {
    pub name: String,
    pub default_channel: Option<String>,
    pub bundles: Vec<BundleNode>,
    pub channels: BTreeMap<String, ChannelGraph>,
}

impl PackageGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_channel: None,
            bundles: Vec::new(),
            channels: BTreeMap::new(),
        }
    }

    pub fn bundle(&self, id: BundleId) -> &BundleNode {
        &self.bundles[id.index()]
    }

    pub fn bundle_mut(&mut self, id: BundleId) -> &mut BundleNode {
        &mut self.bundles[id.index()]
    }

    pub fn add_bundle(&mut self, node: BundleNode) -> BundleId {
        let id = BundleId(self.bundles.len() as u32);
        self.bundles.push(node);
        id
    }

    /// The live bundle carrying `name`, if any
    pub fn live_bundle(&self, name: &str) -> Option<BundleId> {
        self.bundles
            .iter()
            .position(|b| b.is_live() && b.name == name)
            .map(|i| BundleId(i as u32))
    }

    pub fn live_bundles(&self) -> impl Iterator<Item = (BundleId, &BundleNode)> {
        self.bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_live())
            .map(|(i, b)| (BundleId(i as u32), b))
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelGraph> {
        self.channels.get(name)
    }

    pub fn channel_mut(&mut self, name: &str) -> &mut ChannelGraph {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelGraph::new(name))
    }

    /// Channels the bundle belongs to
    pub fn channels_of(&self, id: BundleId) -> Vec<&str> {
        self.channels
            .values()
            .filter(|c| c.members.contains(&id))
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Head bundle name per non-empty channel
    pub fn heads(&self) -> BTreeMap<String, String> {
        self.channels
            .values()
            .filter_map(|c| c.head.map(|h| (c.name.clone(), self.bundle(h).name.clone())))
            .collect()
    }

    pub fn head_of(&self, channel: &str) -> Option<&BundleNode> {
        self.channel(channel)
            .and_then(|c| c.head)
            .map(|h| self.bundle(h))
    }

    /// Name-level view, independent of arena numbering
    pub fn summary(&self) -> PackageSummary {
        let name_of = |id: &BundleId| self.bundle(*id).name.clone();
        let channels = self
            .channels
            .values()
            .filter(|c| !c.is_empty())
            .map(|c| {
                let summary = ChannelSummary {
                    head: c.head.as_ref().map(name_of),
                    members: c.members.iter().map(name_of).collect(),
                    replaces: c
                        .replaces
                        .iter()
                        .map(|(from, to)| (name_of(from), name_of(to)))
                        .collect(),
                    skips: c
                        .skips
                        .iter()
                        .map(|(from, to)| (name_of(from), name_of(to)))
                        .collect(),
                };
                (c.name.clone(), summary)
            })
            .collect();
        PackageSummary {
            name: self.name.clone(),
            default_channel: self.default_channel.clone(),
            channels,
        }
    }
}

/// Comparable name-level view of a package graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub name: String,
    pub default_channel: Option<String>,
    pub channels: BTreeMap<String, ChannelSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub head: Option<String>,
    pub members: BTreeSet<String>,
    pub replaces: BTreeSet<(String, String)>,
    pub skips: BTreeSet<(String, String)>,
}

/// Every package in a catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub packages: BTreeMap<String, PackageGraph>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package(&self, name: &str) -> Option<&PackageGraph> {
        self.packages.get(name)
    }

    pub fn insert(&mut self, graph: PackageGraph) {
        self.packages.insert(graph.name.clone(), graph);
    }

    pub fn package_names(&self) -> Vec<&str> {
        self.packages.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str, version: &str) -> BundleNode {
        let desc = BundleDescriptor::new(
            name,
            "etcd",
            Version::parse(version).unwrap(),
            json!({"name": name}),
        );
        BundleNode::from_descriptor(&desc)
    }

    #[test]
    fn test_live_lookup_ignores_pruned() {
        let mut pkg = PackageGraph::new("etcd");
        let old = pkg.add_bundle(node("etcd.v0.9.0", "0.9.0"));
        pkg.bundle_mut(old).state = BundleState::Pruned;
        assert_eq!(pkg.live_bundle("etcd.v0.9.0"), None);

        let new = pkg.add_bundle(node("etcd.v0.9.0", "0.9.0"));
        assert_eq!(pkg.live_bundle("etcd.v0.9.0"), Some(new));
        assert_eq!(pkg.live_bundles().count(), 1);
    }

    #[test]
    fn test_detach_drops_edges() {
        let mut ch = ChannelGraph::new("alpha");
        let (a, b, c) = (BundleId(0), BundleId(1), BundleId(2));
        ch.members.extend([a, b, c]);
        ch.replaces.insert(c, b);
        ch.replaces.insert(b, a);
        ch.skips.insert((c, a));
        ch.head = Some(c);

        ch.detach(b);
        assert_eq!(ch.replaces.len(), 0);
        assert_eq!(ch.skips.len(), 1);
        assert_eq!(ch.head, Some(c));
        assert_eq!(ch.targets(), BTreeSet::from([a]));
    }

    #[test]
    fn test_can_skip_by_name_and_range() {
        let mut newer = node("etcd.v0.9.4", "0.9.4");
        let older = node("etcd.v0.9.2", "0.9.2");
        assert!(!newer.can_skip(&older));
        newer.skips = vec!["etcd.v0.9.2".into()];
        assert!(newer.can_skip(&older));
        newer.skips.clear();
        newer.skip_range = Some(SkipRange::parse(">=0.9.0 <0.9.4").unwrap());
        assert!(newer.can_skip(&older));
    }
}
