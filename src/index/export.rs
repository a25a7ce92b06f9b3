//! Exporting a package as bundle manifest directories
//!
//! Output layout:
//!
//! ```text
//! <out>/package.json
//! <out>/<bundle>/metadata/annotations.json
//! <out>/<bundle>/manifests/<bundle>.clusterserviceversion.json
//! ```
//!
//! The annotations carry replaces, skips and skipRange so populating a
//! fresh store from `<out>` rebuilds the same channels.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::cancel::Cancellation;
use super::engine::{CliImageEngine, ContainerTool, ImageEngine};
use super::extract::Extractor;
use super::validate_reference;
use crate::bundle::manifest::write_bundle_dir;
use crate::bundle::BundleDescriptor;
use crate::error::{CatalogError, Result};
use crate::graph::upgrade::{minimal_chain, reachable_members};
use crate::graph::{BundleId, PackageGraph};

pub const PACKAGE_FILE: &str = "package.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Omit intermediate bundles the next kept bundle can skip over
    pub minimal: bool,
}

/// What an export wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub package: String,
    pub bundles: Vec<String>,
    pub default_channel: Option<String>,
    pub heads: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageFile {
    package_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_channel: Option<String>,
    channels: Vec<PackageChannel>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageChannel {
    name: String,
    #[serde(rename = "currentCSV")]
    current_csv: String,
}

/// Write every exported bundle of `graph` under `out`
pub fn export_package(graph: &PackageGraph, out: impl AsRef<Path>, options: &ExportOptions) -> Result<ExportSummary> {
    let out = out.as_ref();
    fs::create_dir_all(out)?;

    // bundle → channels it is exported in, plus each channel's kept chain
    let mut selected: BTreeMap<BundleId, BTreeSet<String>> = BTreeMap::new();
    let mut chains: BTreeMap<&str, Vec<BundleId>> = BTreeMap::new();
    for (name, channel) in &graph.channels {
        if channel.is_empty() {
            continue;
        }
        let ids = if options.minimal {
            minimal_chain(graph, name)
        } else {
            reachable_members(graph, name)
        };
        for &id in &ids {
            selected.entry(id).or_default().insert(name.clone());
        }
        chains.insert(name.as_str(), ids);
    }

    let exported: BTreeSet<&str> = selected.keys().map(|&id| graph.bundle(id).name.as_str()).collect();
    let mut bundles = Vec::with_capacity(selected.len());
    for (&id, channels) in &selected {
        let node = graph.bundle(id);
        let mut desc = BundleDescriptor::new(&node.name, &graph.name, node.version.clone(), node.content.clone());
        desc.skips = node.skips.clone();
        desc.skip_range = node.skip_range.clone();
        desc.channels = channels.iter().cloned().collect();
        desc.default_channel = graph.default_channel.clone();
        let recorded = edge_target(graph, channels, id).or_else(|| node.replaces.clone());
        desc.replaces = match recorded.as_deref() {
            Some(target) if !exported.contains(target) && options.minimal => {
                next_kept(graph, &chains, channels, id).or_else(|| Some(target.to_string()))
            }
            other => other.map(String::from),
        };
        if desc.replaces != node.replaces {
            debug!(bundle = %node.name, replaces = ?desc.replaces, "replaces rewritten to the stored edge");
        }
        write_bundle_dir(out, &desc)?;
        bundles.push(desc.name);
    }

    let heads = graph.heads();
    let package_file = PackageFile {
        package_name: graph.name.clone(),
        default_channel: graph.default_channel.clone(),
        channels: heads
            .iter()
            .map(|(name, head)| PackageChannel {
                name: name.clone(),
                current_csv: head.clone(),
            })
            .collect(),
    };
    fs::write(out.join(PACKAGE_FILE), serde_json::to_string_pretty(&package_file)?)?;

    info!(package = %graph.name, bundles = bundles.len(), out = %out.display(), minimal = options.minimal, "package exported");
    Ok(ExportSummary {
        package: graph.name.clone(),
        bundles,
        default_channel: graph.default_channel.clone(),
        heads,
    })
}

/// Target of the replaces edge `id` carries in the first of `channels`
/// holding one
fn edge_target(graph: &PackageGraph, channels: &BTreeSet<String>, id: BundleId) -> Option<String> {
    channels.iter().find_map(|channel| {
        let to = graph.channel(channel)?.replaces.get(&id)?;
        Some(graph.bundle(*to).name.clone())
    })
}

/// The bundle right after `id` in the first kept chain that has one
fn next_kept(
    graph: &PackageGraph,
    chains: &BTreeMap<&str, Vec<BundleId>>,
    channels: &BTreeSet<String>,
    id: BundleId,
) -> Option<String> {
    channels.iter().find_map(|channel| {
        let chain = chains.get(channel.as_str())?;
        let pos = chain.iter().position(|&c| c == id)?;
        chain.get(pos + 1).map(|&next| graph.bundle(next).name.clone())
    })
}

/// Export one package of an index image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFromIndexRequest {
    pub index: String,
    pub package: String,
    pub download_path: PathBuf,
    pub container_tool: ContainerTool,
    pub minimal: bool,
}

impl ExportFromIndexRequest {
    /// Engine for the requested container tool
    pub fn engine(&self) -> CliImageEngine {
        CliImageEngine::new(self.container_tool)
    }
}

/// Runs export requests against one container engine
pub struct IndexExporter<'e> {
    engine: &'e dyn ImageEngine,
    cancel: Cancellation,
}

impl<'e> IndexExporter<'e> {
    pub fn new(engine: &'e dyn ImageEngine, cancel: Cancellation) -> Self {
        Self { engine, cancel }
    }

    pub fn export_from_index(&self, request: &ExportFromIndexRequest) -> Result<ExportSummary> {
        validate_reference(&request.index)?;
        let catalog = Extractor::new(self.engine).snapshot(&request.index, &self.cancel)?;
        let graph = catalog.package(&request.package).ok_or_else(|| {
            CatalogError::NotFound(format!("package {} in {}", request.package, request.index))
        })?;
        self.cancel.check("export")?;
        export_package(
            graph,
            &request.download_path,
            &ExportOptions {
                minimal: request.minimal,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::manifest::read_bundle_dir;
    use crate::merge::{merge_package, MergeOptions};
    use crate::version::SkipRange;
    use semver::Version;
    use serde_json::json;
    use tempfile::TempDir;

    fn desc(name: &str, version: &str) -> BundleDescriptor {
        BundleDescriptor::new(
            name,
            "etcd",
            Version::parse(version).unwrap(),
            json!({"metadata": {"name": name}, "spec": {"version": version}}),
        )
        .in_channel("alpha")
    }

    fn chain_with_range() -> PackageGraph {
        let batch = vec![
            desc("etcd.v0.9.0", "0.9.0"),
            desc("etcd.v0.9.2", "0.9.2").with_replaces("etcd.v0.9.0"),
            desc("etcd.v0.9.4", "0.9.4").with_replaces("etcd.v0.9.2"),
            desc("etcd.v0.9.6", "0.9.6")
                .with_replaces("etcd.v0.9.4")
                .with_skip_range(SkipRange::parse(">=0.9.0 <0.9.6").unwrap())
                .with_default_channel("alpha"),
        ];
        merge_package(PackageGraph::new("etcd"), &batch, &MergeOptions::default())
            .unwrap()
            .graph
    }

    #[test]
    fn test_full_export_keeps_every_bundle() {
        let dir = TempDir::new().unwrap();
        let summary = export_package(&chain_with_range(), dir.path(), &ExportOptions::default()).unwrap();
        assert_eq!(summary.bundles.len(), 4);
        assert_eq!(summary.heads["alpha"], "etcd.v0.9.6");

        let read = read_bundle_dir(dir.path().join("etcd.v0.9.4")).unwrap();
        assert_eq!(read.replaces.as_deref(), Some("etcd.v0.9.2"));
        assert_eq!(read.channels, vec!["alpha".to_string()]);

        let package: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(PACKAGE_FILE)).unwrap()).unwrap();
        assert_eq!(package["packageName"], "etcd");
        assert_eq!(package["defaultChannel"], "alpha");
        assert_eq!(package["channels"][0]["currentCSV"], "etcd.v0.9.6");
    }

    #[test]
    fn test_minimal_export_rewrites_replaces() {
        let dir = TempDir::new().unwrap();
        let summary = export_package(&chain_with_range(), dir.path(), &ExportOptions { minimal: true }).unwrap();
        assert_eq!(summary.bundles, vec!["etcd.v0.9.0".to_string(), "etcd.v0.9.6".to_string()]);
        assert!(!dir.path().join("etcd.v0.9.2").exists());

        let head = read_bundle_dir(dir.path().join("etcd.v0.9.6")).unwrap();
        assert_eq!(head.replaces.as_deref(), Some("etcd.v0.9.0"));
        assert!(head.skip_range.is_some());
    }
}
