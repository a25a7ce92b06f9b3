//! Directory Populator
//!
//! Rebuilds a catalog from bundle manifest directories, such as those
//! written by an export. Any directory holding `metadata/annotations.json`
//! is a bundle; directories are visited in lexicographic order, so both the
//! flat export layout and `<package>/<version>/` trees load the same way.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::bundle::manifest::{is_bundle_dir, read_bundle_dir};
use crate::bundle::BundleDescriptor;
use crate::error::{CatalogError, Result};
use crate::merge::{MergeEngine, MergeOptions, MergeReport};
use crate::store::GraphStore;

/// Loads a manifest tree into a store
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
    options: MergeOptions,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>, options: MergeOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse every bundle directory under the root, in visiting order
    pub fn scan(&self) -> Result<Vec<BundleDescriptor>> {
        if !self.root.is_dir() {
            return Err(CatalogError::NotFound(format!("directory {}", self.root.display())));
        }
        let mut descriptors = Vec::new();
        let mut walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_dir() || !is_bundle_dir(entry.path()) {
                continue;
            }
            descriptors.push(read_bundle_dir(entry.path())?);
            // a bundle's own metadata/ and manifests/ are not bundles
            walker.skip_current_dir();
        }
        debug!(root = %self.root.display(), bundles = descriptors.len(), "manifest tree scanned");
        Ok(descriptors)
    }

    /// Scan and merge, one batch per package, in one store write
    pub fn populate(&self, store: &mut GraphStore) -> Result<MergeReport> {
        let descriptors = self.scan()?;
        if descriptors.is_empty() {
            return Err(CatalogError::NotFound(format!(
                "no bundle directories under {}",
                self.root.display()
            )));
        }
        let packages: BTreeSet<&str> = descriptors.iter().map(|d| d.package.as_str()).collect();

        let report = MergeEngine::new(store, self.options.clone()).merge(&descriptors)?;
        info!(
            root = %self.root.display(),
            packages = packages.len(),
            bundles = descriptors.len(),
            "store populated from directory"
        );
        Ok(report)
    }
}
