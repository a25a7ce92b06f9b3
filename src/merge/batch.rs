//! One package batch applied to an in-memory snapshot
//!
//! The node pass inserts every descriptor before any edge is resolved, so
//! bundles submitted together may reference each other in any order. Edges
//! of every touched channel are then rebuilt from node metadata, heads are
//! recomputed and members the head cannot reach are dropped.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{MergeOptions, PackageReport};
use crate::bundle::BundleDescriptor;
use crate::error::{CatalogError, Result};
use crate::graph::heads::{unreachable_from, ChannelView};
use crate::graph::{
    resolve_head, BundleId, BundleNode, BundleState, PackageGraph, WarningCode, Warnings,
};

/// Result of merging one package
#[derive(Debug, Clone)]
pub struct PackageMerge {
    pub graph: PackageGraph,
    pub report: PackageReport,
}

/// Merge a batch of descriptors for one package into `base`
///
/// Pure: nothing is persisted. An error leaves the caller's store untouched
/// because the caller only writes the returned graph.
pub fn merge_package(
    base: PackageGraph,
    descriptors: &[BundleDescriptor],
    options: &MergeOptions,
) -> Result<PackageMerge> {
    let batch = prepare(&base.name, descriptors)?;
    let mut merge = BatchMerge::new(base, options.clone());

    for desc in &batch {
        merge.insert_node(desc)?;
    }
    merge.relink()?;
    merge.resolve_heads()?;
    merge.prune();
    merge.resolve_default_channel(&batch)?;
    Ok(merge.finish())
}

/// Validate, fold duplicates and order a batch by (version, name)
fn prepare(package: &str, descriptors: &[BundleDescriptor]) -> Result<Vec<BundleDescriptor>> {
    let mut by_name: BTreeMap<&str, BundleDescriptor> = BTreeMap::new();
    for desc in descriptors {
        desc.validate()?;
        if desc.package != package {
            return Err(CatalogError::validation(format!(
                "bundle {} belongs to package {}, not {}",
                desc.name, desc.package, package
            )));
        }
        match by_name.get_mut(desc.name.as_str()) {
            Some(seen) => {
                let same = seen.version == desc.version
                    && seen.digest() == desc.digest()
                    && seen.replaces == desc.replaces
                    && seen.skips == desc.skips
                    && seen.skip_range == desc.skip_range;
                if !same {
                    return Err(CatalogError::conflict(format!(
                        "bundle {} submitted twice with different content",
                        desc.name
                    )));
                }
                for channel in &desc.channels {
                    if !seen.channels.contains(channel) {
                        seen.channels.push(channel.clone());
                    }
                }
                if seen.default_channel.is_none() {
                    seen.default_channel = desc.default_channel.clone();
                }
            }
            None => {
                by_name.insert(desc.name.as_str(), desc.clone());
            }
        }
    }
    let mut batch: Vec<BundleDescriptor> = by_name.into_values().collect();
    batch.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));
    Ok(batch)
}

/// Working state of a merge over one package
pub(crate) struct BatchMerge {
    graph: PackageGraph,
    options: MergeOptions,
    warnings: Warnings,
    /// Nodes created by this batch
    inserted: BTreeSet<BundleId>,
    /// Channels whose edges and head must be recomputed
    touched: BTreeSet<String>,
    /// Head names before the batch
    previous_heads: BTreeMap<String, String>,
    added: Vec<String>,
    unchanged: Vec<String>,
    superseded: Vec<String>,
    pruned: Vec<String>,
    rejected: Vec<String>,
}

impl BatchMerge {
    pub(crate) fn new(base: PackageGraph, options: MergeOptions) -> Self {
        Self {
            previous_heads: base.heads(),
            graph: base,
            options,
            warnings: Warnings::new(),
            inserted: BTreeSet::new(),
            touched: BTreeSet::new(),
            added: Vec::new(),
            unchanged: Vec::new(),
            superseded: Vec::new(),
            pruned: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub(crate) fn graph_mut(&mut self) -> &mut PackageGraph {
        &mut self.graph
    }

    pub(crate) fn touch(&mut self, channel: &str) {
        self.touched.insert(channel.to_string());
    }

    // ---- node pass ----

    fn insert_node(&mut self, desc: &BundleDescriptor) -> Result<()> {
        match self.graph.live_bundle(&desc.name) {
            Some(id) if self.graph.bundle(id).same_identity(desc) => {
                for channel in &desc.channels {
                    if self.graph.channel_mut(channel).members.insert(id) {
                        debug!(bundle = %desc.name, channel = %channel, "existing bundle joined channel");
                    }
                    self.touch(channel);
                }
                self.unchanged.push(desc.name.clone());
            }
            Some(old) => {
                let existing = self.graph.bundle(old);
                if !self.options.overwrite {
                    return Err(CatalogError::conflict(format!(
                        "bundle {}/{} already exists with different content ({} {} vs {} {})",
                        self.graph.name,
                        desc.name,
                        existing.version,
                        existing.digest.short(),
                        desc.version,
                        desc.digest().short()
                    )));
                }
                let message = format!(
                    "content {} superseded by {}",
                    existing.digest.short(),
                    desc.digest().short()
                );
                let previous: Vec<String> = self
                    .graph
                    .channels_of(old)
                    .into_iter()
                    .map(String::from)
                    .collect();
                for channel in &previous {
                    self.graph.channel_mut(channel).detach(old);
                }
                self.graph.bundle_mut(old).state = BundleState::Pruned;
                self.warnings.record(
                    WarningCode::Superseded,
                    &self.graph.name,
                    None,
                    &desc.name,
                    message,
                );

                let id = self.graph.add_bundle(BundleNode::from_descriptor(desc));
                self.inserted.insert(id);
                for channel in previous.iter().chain(desc.channels.iter()) {
                    self.graph.channel_mut(channel).members.insert(id);
                    self.touch(channel);
                }
                self.superseded.push(desc.name.clone());
            }
            None => {
                let id = self.graph.add_bundle(BundleNode::from_descriptor(desc));
                self.inserted.insert(id);
                for channel in &desc.channels {
                    self.graph.channel_mut(channel).members.insert(id);
                    self.touch(channel);
                }
                debug!(bundle = %desc.name, version = %desc.version, channels = ?desc.channels, "bundle inserted");
                self.added.push(desc.name.clone());
            }
        }
        Ok(())
    }

    // ---- edge pass ----

    /// Rebuild replaces and skip edges of every touched channel
    pub(crate) fn relink(&mut self) -> Result<()> {
        let package = self.graph.name.clone();
        for channel in self.touched.clone() {
            let Some(ch) = self.graph.channels.get(&channel) else {
                continue;
            };
            let members: BTreeMap<&str, BundleId> = ch
                .members
                .iter()
                .map(|&id| (self.graph.bundle(id).name.as_str(), id))
                .collect();

            let mut replaces = BTreeMap::new();
            let mut skips = BTreeSet::new();
            for &id in &ch.members {
                let node = self.graph.bundle(id);
                for skipped in &node.skips {
                    match members.get(skipped.as_str()) {
                        Some(&to) => {
                            skips.insert((id, to));
                        }
                        None => {
                            debug!(bundle = %node.name, skipped = %skipped, channel = %channel, "skip target not in channel")
                        }
                    }
                }

                let Some(target) = node.replaces.as_deref() else {
                    continue;
                };
                if let Some(&to) = members.get(target) {
                    replaces.insert(id, to);
                    continue;
                }
                if !self.inserted.contains(&id) {
                    // stored edge from a rewire, or none after a permissive merge
                    if let Some(&to) = ch.replaces.get(&id).filter(|to| ch.members.contains(to)) {
                        replaces.insert(id, to);
                    }
                    continue;
                }
                if let Some(bridge) = bridge(&self.graph, &members, id) {
                    self.warnings.record(
                        WarningCode::BridgedReplace,
                        &package,
                        Some(&channel),
                        &node.name,
                        format!("replaces {} is missing; skips reach {}", target, bridge),
                    );
                } else if self.options.permissive {
                    self.warnings.record(
                        WarningCode::DanglingReplace,
                        &package,
                        Some(&channel),
                        &node.name,
                        format!("replaces {}, which is not in the channel; edge dropped", target),
                    );
                } else {
                    return Err(CatalogError::DanglingReplace {
                        bundle: node.name.clone(),
                        target: target.to_string(),
                        channel: channel.clone(),
                    });
                }
            }

            let ch = self.graph.channel_mut(&channel);
            ch.replaces = replaces;
            ch.skips = skips;
            if ChannelView::build(ch).is_cyclic() {
                return Err(CatalogError::conflict(format!(
                    "upgrade edges in channel {}/{} form a cycle",
                    package, channel
                )));
            }
        }
        Ok(())
    }

    // ---- heads ----

    pub(crate) fn resolve_heads(&mut self) -> Result<()> {
        let package = self.graph.name.clone();
        for channel in self.touched.clone() {
            let Some(ch) = self.graph.channel(&channel) else {
                continue;
            };
            if ch.is_empty() {
                self.graph.channel_mut(&channel).head = None;
                continue;
            }
            let previous = self.previous_head(&channel);
            let resolution = resolve_head(&self.graph, &channel);
            let head = match resolution.candidates.as_slice() {
                [only] => *only,
                [] => match (self.options.permissive, previous) {
                    (true, Some(kept)) => {
                        self.warnings.record(
                            WarningCode::NoHead,
                            &package,
                            Some(&channel),
                            &self.graph.bundle(kept).name,
                            "no bundle without incoming edges; keeping the previous head",
                        );
                        kept
                    }
                    _ => {
                        return Err(CatalogError::conflict(format!(
                            "channel {}/{} has no head",
                            package, channel
                        )))
                    }
                },
                many => {
                    let names = many
                        .iter()
                        .map(|id| self.graph.bundle(*id).name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    if !self.options.permissive {
                        return Err(CatalogError::conflict(format!(
                            "channel {}/{} has multiple heads: {}",
                            package, channel, names
                        )));
                    }
                    let chosen = match previous {
                        Some(kept) if many.contains(&kept) => kept,
                        Some(kept) => continuing(&self.graph, &channel, many, kept)
                            .unwrap_or_else(|| highest(&self.graph, many)),
                        None => highest(&self.graph, many),
                    };
                    self.warnings.record(
                        WarningCode::MultipleHeads,
                        &package,
                        Some(&channel),
                        &self.graph.bundle(chosen).name,
                        format!("head candidates {}; keeping {}", names, self.graph.bundle(chosen).name),
                    );
                    chosen
                }
            };
            debug!(package = %package, channel = %channel, head = %self.graph.bundle(head).name, "head resolved");
            self.graph.channel_mut(&channel).head = Some(head);
        }
        Ok(())
    }

    fn previous_head(&self, channel: &str) -> Option<BundleId> {
        let ch = self.graph.channel(channel)?;
        self.previous_heads
            .get(channel)
            .and_then(|name| self.graph.live_bundle(name))
            .filter(|id| ch.members.contains(id))
    }

    // ---- pruning ----

    /// Drop members the head cannot reach, then soft-delete live bundles
    /// left in no channel
    pub(crate) fn prune(&mut self) {
        let package = self.graph.name.clone();
        for channel in self.touched.clone() {
            let Some(ch) = self.graph.channel(&channel) else {
                continue;
            };
            let Some(head) = ch.head else {
                continue;
            };
            let head_name = self.graph.bundle(head).name.clone();
            for id in unreachable_from(ch, head) {
                let name = self.graph.bundle(id).name.clone();
                self.graph.channel_mut(&channel).detach(id);
                self.warnings.record(
                    WarningCode::Unreachable,
                    &package,
                    Some(&channel),
                    &name,
                    format!("not reachable from head {}; removed from channel", head_name),
                );
            }
        }

        let orphans: Vec<BundleId> = self
            .graph
            .live_bundles()
            .map(|(id, _)| id)
            .filter(|id| self.graph.channels_of(*id).is_empty())
            .collect();
        for id in orphans {
            let node = self.graph.bundle_mut(id);
            node.state = BundleState::Pruned;
            let name = node.name.clone();
            if self.inserted.contains(&id) {
                // never reported as both added and soft-deleted
                self.added.retain(|n| n != &name);
                self.superseded.retain(|n| n != &name);
                self.warnings.record(
                    WarningCode::Rejected,
                    &package,
                    None,
                    &name,
                    "not reachable from any channel head; not kept",
                );
                debug!(package = %package, bundle = %name, "inserted bundle rejected");
                self.rejected.push(name);
            } else {
                debug!(package = %package, bundle = %name, "bundle soft-deleted");
                self.pruned.push(name);
            }
        }
        self.graph.channels.retain(|_, c| !c.is_empty());
    }

    // ---- default channel ----

    /// The highest-version bundle declaring a default wins; otherwise the
    /// current default stays if it still names a channel.
    pub(crate) fn resolve_default_channel(&mut self, batch: &[BundleDescriptor]) -> Result<()> {
        let declared = batch.iter().rev().find_map(|d| d.default_channel.clone());
        let default = match declared {
            Some(channel) => {
                if !self.graph.channels.contains_key(&channel) {
                    return Err(CatalogError::validation(format!(
                        "default channel {} is not a channel of package {}",
                        channel, self.graph.name
                    )));
                }
                Some(channel)
            }
            None => self
                .graph
                .default_channel
                .clone()
                .filter(|c| self.graph.channels.contains_key(c))
                .or_else(|| self.fallback_default()),
        };
        if default != self.graph.default_channel {
            debug!(package = %self.graph.name, default = ?default, "default channel set");
        }
        self.graph.default_channel = default;
        Ok(())
    }

    /// The only channel, or the one whose head has the highest version
    fn fallback_default(&self) -> Option<String> {
        self.graph
            .channels
            .values()
            .filter_map(|c| c.head.map(|h| (c, &self.graph.bundle(h).version)))
            .max_by(|(a, va), (b, vb)| va.cmp(vb).then_with(|| b.name.cmp(&a.name)))
            .map(|(c, _)| c.name.clone())
    }

    pub(crate) fn finish(self) -> PackageMerge {
        let report = PackageReport {
            package: self.graph.name.clone(),
            added: self.added,
            unchanged: self.unchanged,
            superseded: self.superseded,
            pruned: self.pruned,
            rejected: self.rejected,
            heads: self.graph.heads(),
            default_channel: self.graph.default_channel.clone(),
            warnings: self.warnings,
        };
        PackageMerge {
            graph: self.graph,
            report,
        }
    }
}

/// A member other than `id` that `id` can skip to, by name or range
fn bridge(graph: &PackageGraph, members: &BTreeMap<&str, BundleId>, id: BundleId) -> Option<String> {
    let node = graph.bundle(id);
    members
        .iter()
        .filter(|(_, &other)| other != id)
        .find(|(_, &other)| node.can_skip(graph.bundle(other)))
        .map(|(name, _)| name.to_string())
}

/// The highest candidate whose upgrade edges lead back to `previous`
fn continuing(graph: &PackageGraph, channel: &str, candidates: &[BundleId], previous: BundleId) -> Option<BundleId> {
    let view = ChannelView::build(graph.channel(channel)?);
    let reaching: Vec<BundleId> = candidates
        .iter()
        .copied()
        .filter(|&id| view.reachable_from(id).contains(&previous))
        .collect();
    (!reaching.is_empty()).then(|| highest(graph, &reaching))
}

fn highest(graph: &PackageGraph, candidates: &[BundleId]) -> BundleId {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            graph
                .bundle(*a)
                .version
                .cmp(&graph.bundle(*b).version)
                .then_with(|| b.cmp(a))
        })
        .unwrap_or(candidates[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::SkipRange;
    use semver::Version;
    use serde_json::json;

    fn bundle(version: &str) -> BundleDescriptor {
        BundleDescriptor::new(
            format!("prometheusoperator.{}", version),
            "prometheus",
            Version::parse(version).unwrap(),
            json!({"kind": "ClusterServiceVersion", "version": version}),
        )
        .in_channel("preview")
    }

    fn merge(base: PackageGraph, batch: &[BundleDescriptor]) -> Result<PackageMerge> {
        merge_package(base, batch, &MergeOptions::default())
    }

    fn empty() -> PackageGraph {
        PackageGraph::new("prometheus")
    }

    #[test]
    fn test_forward_references_within_batch() {
        let batch = vec![
            bundle("0.22.2").with_replaces("prometheusoperator.0.15.0"),
            bundle("0.14.0"),
            bundle("0.15.0").with_replaces("prometheusoperator.0.14.0"),
        ];
        let merged = merge(empty(), &batch).unwrap();
        assert_eq!(
            merged.report.heads["preview"],
            "prometheusoperator.0.22.2"
        );
        assert_eq!(merged.graph.default_channel.as_deref(), Some("preview"));
        assert!(merged.report.warnings.is_empty());
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let forward = vec![
            bundle("0.14.0"),
            bundle("0.15.0").with_replaces("prometheusoperator.0.14.0"),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();
        let a = merge(empty(), &forward).unwrap().graph;
        let b = merge(empty(), &reversed).unwrap().graph;
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_names_in_batch() {
        let same = vec![bundle("0.14.0"), bundle("0.14.0").in_channel("stable")];
        let merged = merge(empty(), &same).unwrap();
        assert_eq!(merged.graph.live_bundles().count(), 1);
        assert_eq!(merged.graph.channels.len(), 2);

        let mut different = bundle("0.14.0");
        different.content = json!({"kind": "ClusterServiceVersion", "changed": true});
        let err = merge(empty(), &[bundle("0.14.0"), different]).unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
    }

    #[test]
    fn test_dangling_replace_strict_and_permissive() {
        let batch = vec![bundle("0.22.2").with_replaces("prometheusoperator.0.16.0")];
        let err = merge(empty(), &batch).unwrap_err();
        assert!(matches!(err, CatalogError::DanglingReplace { .. }));

        let options = MergeOptions {
            permissive: true,
            ..MergeOptions::default()
        };
        let merged = merge_package(empty(), &batch, &options).unwrap();
        assert!(merged.report.warnings.has(WarningCode::DanglingReplace));
        assert_eq!(merged.report.heads["preview"], "prometheusoperator.0.22.2");
    }

    #[test]
    fn test_skips_bridge_missing_target() {
        let base = merge(empty(), &[bundle("0.14.0")]).unwrap().graph;
        let batch = vec![bundle("0.22.2")
            .with_replaces("prometheusoperator.0.16.0")
            .with_skips(["prometheusoperator.0.14.0"])];
        let merged = merge(base, &batch).unwrap();
        assert!(merged.report.warnings.has(WarningCode::BridgedReplace));
        let summary = merged.graph.summary();
        assert!(summary.channels["preview"].skips.contains(&(
            "prometheusoperator.0.22.2".to_string(),
            "prometheusoperator.0.14.0".to_string()
        )));
        assert_eq!(merged.report.heads["preview"], "prometheusoperator.0.22.2");
    }

    #[test]
    fn test_siblings_are_a_conflict() {
        let base = merge(empty(), &[bundle("0.14.0")]).unwrap().graph;
        let batch = vec![
            bundle("0.15.0").with_replaces("prometheusoperator.0.14.0"),
            bundle("0.15.1").with_replaces("prometheusoperator.0.14.0"),
        ];
        let err = merge(base.clone(), &batch).unwrap_err();
        assert!(err.to_string().contains("multiple heads"));

        let options = MergeOptions {
            permissive: true,
            ..MergeOptions::default()
        };
        let merged = merge_package(base, &batch, &options).unwrap();
        assert!(merged.report.warnings.has(WarningCode::MultipleHeads));
        assert!(merged.report.warnings.has(WarningCode::Unreachable));
        assert_eq!(merged.report.heads["preview"], "prometheusoperator.0.15.1");
        assert!(merged.report.pruned.is_empty());
        assert_eq!(merged.report.rejected, vec!["prometheusoperator.0.15.0"]);
        assert_eq!(merged.report.added, vec!["prometheusoperator.0.15.1"]);
        assert!(merged.report.warnings.has(WarningCode::Rejected));
    }

    #[test]
    fn test_permissive_keeps_previous_head() {
        let base = merge(
            empty(),
            &[
                bundle("0.14.0"),
                bundle("0.15.0").with_replaces("prometheusoperator.0.14.0"),
            ],
        )
        .unwrap()
        .graph;
        let options = MergeOptions {
            permissive: true,
            ..MergeOptions::default()
        };
        let batch = vec![bundle("0.22.2").with_replaces("prometheusoperator.0.16.0")];
        let merged = merge_package(base, &batch, &options).unwrap();
        assert_eq!(merged.report.heads["preview"], "prometheusoperator.0.15.0");
        assert!(merged.report.warnings.has(WarningCode::DanglingReplace));
    }

    #[test]
    fn test_cycle_is_rejected_even_when_permissive() {
        let batch = vec![
            bundle("0.14.0").with_replaces("prometheusoperator.0.15.0"),
            bundle("0.15.0").with_replaces("prometheusoperator.0.14.0"),
        ];
        let options = MergeOptions {
            permissive: true,
            ..MergeOptions::default()
        };
        let err = merge_package(empty(), &batch, &options).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_overwrite_supersedes_content() {
        let base = merge(
            empty(),
            &[
                bundle("0.14.0"),
                bundle("0.15.0").with_replaces("prometheusoperator.0.14.0"),
            ],
        )
        .unwrap()
        .graph;
        let mut patched = bundle("0.14.0");
        patched.content = json!({"kind": "ClusterServiceVersion", "patched": true});

        let err = merge(base.clone(), &[patched.clone()]).unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        let options = MergeOptions {
            overwrite: true,
            ..MergeOptions::default()
        };
        let merged = merge_package(base, &[patched], &options).unwrap();
        assert!(merged.report.warnings.has(WarningCode::Superseded));
        assert_eq!(merged.graph.bundles.len(), 3);
        assert_eq!(merged.graph.live_bundles().count(), 2);
        // the dependent re-links onto the new node
        let summary = merged.graph.summary();
        assert!(summary.channels["preview"].replaces.contains(&(
            "prometheusoperator.0.15.0".to_string(),
            "prometheusoperator.0.14.0".to_string()
        )));
    }

    #[test]
    fn test_default_channel_rules() {
        let batch = vec![
            bundle("0.14.0").in_channel("stable").with_default_channel("stable"),
            bundle("0.15.0")
                .with_replaces("prometheusoperator.0.14.0")
                .with_default_channel("preview"),
        ];
        let merged = merge(empty(), &batch).unwrap();
        assert_eq!(merged.graph.default_channel.as_deref(), Some("preview"));

        let bad = vec![bundle("0.14.0").with_default_channel("beta")];
        assert!(matches!(
            merge(empty(), &bad),
            Err(CatalogError::Validation(_))
        ));
    }

    #[test]
    fn test_skip_range_creates_no_edges() {
        let base = merge(empty(), &[bundle("0.14.0")]).unwrap().graph;
        let batch = vec![bundle("0.22.2")
            .with_replaces("prometheusoperator.0.14.0")
            .with_skip_range(SkipRange::parse(">=0.13.0 <0.22.2").unwrap())];
        let merged = merge(base, &batch).unwrap();
        let ch = merged.graph.channel("preview").unwrap();
        assert!(ch.skips.is_empty());
        assert_eq!(ch.replaces.len(), 1);
    }
}
