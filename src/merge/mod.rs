//! Graph Merge Engine
//!
//! Inserts batches of bundle descriptors into the stored graph. Each call
//! groups descriptors by package, merges every package snapshot in memory
//! and writes the results back inside one store transaction, so a failure
//! in any package leaves the store exactly as it was.

mod batch;
mod remove;

pub use batch::{merge_package, PackageMerge};
pub use remove::{remove_from_graph, RemoveMode};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::bundle::BundleDescriptor;
use crate::error::{CatalogError, Result};
use crate::graph::{PackageGraph, Warnings};
use crate::store::GraphStore;

/// Mode flags for a merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Downgrade dangling replaces and head multiplicity to warnings
    pub permissive: bool,
    /// Supersede stored content that differs under the same bundle name
    pub overwrite: bool,
    /// Emit a build descriptor instead of building an image; the merge
    /// itself is unaffected
    pub generate_only: bool,
}

/// Outcome for one package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageReport {
    pub package: String,
    /// Bundles stored for the first time
    pub added: Vec<String>,
    /// Bundles already stored with identical content
    pub unchanged: Vec<String>,
    /// Bundles whose content was replaced by an overwrite
    pub superseded: Vec<String>,
    /// Bundles soft-deleted by this operation
    pub pruned: Vec<String>,
    /// Bundles of this batch that no channel head reaches, stored
    /// soft-deleted
    #[serde(default)]
    pub rejected: Vec<String>,
    /// Channel → head bundle after the merge
    pub heads: BTreeMap<String, String>,
    pub default_channel: Option<String>,
    pub warnings: Warnings,
}

/// Outcome of one merge call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub packages: Vec<PackageReport>,
    /// Store generation after the commit
    pub generation: i64,
}

impl MergeReport {
    /// Every warning across packages
    pub fn warnings(&self) -> Warnings {
        let mut all = Warnings::new();
        for package in &self.packages {
            all.extend(package.warnings.clone());
        }
        all
    }

    pub fn package(&self, name: &str) -> Option<&PackageReport> {
        self.packages.iter().find(|p| p.package == name)
    }
}

/// Merges bundle batches into one store
pub struct MergeEngine<'s> {
    store: &'s mut GraphStore,
    options: MergeOptions,
}

impl<'s> MergeEngine<'s> {
    pub fn new(store: &'s mut GraphStore, options: MergeOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merge a batch; all of it applies or none of it does
    pub fn merge(&mut self, descriptors: &[BundleDescriptor]) -> Result<MergeReport> {
        self.run(None, descriptors)
    }

    /// Merge a batch only if the store is still at `expected_generation`
    pub fn merge_with_base(
        &mut self,
        expected_generation: i64,
        descriptors: &[BundleDescriptor],
    ) -> Result<MergeReport> {
        self.run(Some(expected_generation), descriptors)
    }

    fn run(&mut self, expected: Option<i64>, descriptors: &[BundleDescriptor]) -> Result<MergeReport> {
        let mut groups: BTreeMap<&str, Vec<BundleDescriptor>> = BTreeMap::new();
        for desc in descriptors {
            groups
                .entry(desc.package.as_str())
                .or_default()
                .push(desc.clone());
        }

        let options = &self.options;
        let packages = self.store.write(|tx| {
            if let Some(expected) = expected {
                let actual = tx.generation()?;
                if actual != expected {
                    return Err(CatalogError::BaseMismatch { expected, actual });
                }
            }
            let mut reports = Vec::with_capacity(groups.len());
            for (package, batch) in &groups {
                let base = tx
                    .snapshot(package)?
                    .unwrap_or_else(|| PackageGraph::new(*package));
                let merged = merge_package(base, batch, options)?;
                tx.write_snapshot(&merged.graph)?;
                reports.push(merged.report);
            }
            Ok(reports)
        })?;

        let report = MergeReport {
            packages,
            generation: self.store.generation()?,
        };
        info!(
            packages = report.packages.len(),
            bundles = descriptors.len(),
            warnings = report.warnings().len(),
            generation = report.generation,
            "merge committed"
        );
        Ok(report)
    }

    /// Soft-delete one bundle and recompute its channels
    pub fn remove_bundle(&mut self, package: &str, name: &str, mode: RemoveMode) -> Result<PackageReport> {
        let report = self.store.write(|tx| {
            let graph = tx
                .snapshot(package)?
                .ok_or_else(|| CatalogError::NotFound(format!("package {}", package)))?;
            let result = remove_from_graph(graph, name, mode)?;
            tx.write_snapshot(&result.graph)?;
            Ok(result.report)
        })?;
        info!(package, bundle = name, mode = ?mode, "bundle removed");
        Ok(report)
    }

    /// Hard-delete soft-deleted bundles of the given packages (all when empty)
    pub fn purge_pruned(&mut self, packages: &[String]) -> Result<usize> {
        let purged = self.store.write(|tx| {
            let targets = if packages.is_empty() {
                tx.list_packages()?
            } else {
                packages.to_vec()
            };
            let mut purged = 0;
            for package in &targets {
                purged += tx.purge_pruned(package)?;
            }
            Ok(purged)
        })?;
        info!(purged, "soft-deleted bundles purged");
        Ok(purged)
    }

    /// Remove whole packages
    pub fn delete_packages(&mut self, packages: &[String]) -> Result<()> {
        self.store.write(|tx| {
            for package in packages {
                if !tx.delete_package(package)? {
                    return Err(CatalogError::NotFound(format!("package {}", package)));
                }
            }
            Ok(())
        })?;
        info!(packages = ?packages, "packages deleted");
        Ok(())
    }
}
