//! Explicit bundle removal

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::batch::{BatchMerge, PackageMerge};
use super::MergeOptions;
use crate::error::{CatalogError, Result};
use crate::graph::{BundleState, PackageGraph};

/// How to treat bundles that upgrade from the one being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveMode {
    /// Refuse while anything replaces or skips the bundle
    #[default]
    Strict,
    /// Point dependents' channel edges at the removed bundle's own
    /// replaces target
    Rewire,
}

/// Soft-delete `name` from `graph` and recompute the affected channels
pub fn remove_from_graph(graph: PackageGraph, name: &str, mode: RemoveMode) -> Result<PackageMerge> {
    let Some(target) = graph.live_bundle(name) else {
        return Err(CatalogError::NotFound(format!(
            "bundle {} in package {}",
            name, graph.name
        )));
    };
    let dependents: Vec<_> = graph
        .live_bundles()
        .filter(|(id, b)| {
            *id != target
                && (b.replaces.as_deref() == Some(name) || b.skips.iter().any(|s| s == name))
        })
        .map(|(id, _)| id)
        .collect();

    if mode == RemoveMode::Strict && !dependents.is_empty() {
        let names = dependents
            .iter()
            .map(|id| graph.bundle(*id).name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(CatalogError::conflict(format!(
            "bundle {} is still an upgrade source for {}",
            name, names
        )));
    }

    let channels: Vec<String> = graph
        .channels_of(target)
        .into_iter()
        .map(String::from)
        .collect();
    let mut merge = BatchMerge::new(graph, MergeOptions::default());
    let pkg = merge.graph_mut();
    // bundle records stay as they are; only channel edges move
    for channel in &channels {
        let ch = pkg.channel_mut(channel);
        let inherited = ch.replaces.get(&target).copied();
        let rewired: Vec<_> = ch
            .replaces
            .iter()
            .filter(|(_, to)| **to == target)
            .map(|(from, _)| *from)
            .collect();
        debug!(bundle = %name, channel = %channel, dependents = rewired.len(), "rewiring channel edges");
        for from in rewired {
            match inherited {
                Some(to) => {
                    ch.replaces.insert(from, to);
                }
                None => {
                    ch.replaces.remove(&from);
                }
            }
        }
        ch.detach(target);
    }
    pkg.bundle_mut(target).state = BundleState::Pruned;
    for channel in &channels {
        merge.touch(channel);
    }

    merge.relink()?;
    merge.resolve_heads()?;
    merge.prune();
    merge.resolve_default_channel(&[])?;
    let mut result = merge.finish();
    result.report.pruned.insert(0, name.to_string());
    Ok(result)
}
