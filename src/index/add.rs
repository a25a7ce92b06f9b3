//! Adding bundle images to an index

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use super::cancel::Cancellation;
use super::engine::ImageEngine;
use super::extract::Extractor;
use super::render::{RenderOptions, RenderOutcome};
use super::workspace::{ensure_base_unchanged, Workspace};
use super::{validate_reference, DEFAULT_BINARY_IMAGE, DEFAULT_DATABASE_PATH};
use crate::error::{CatalogError, Result};
use crate::merge::{MergeEngine, MergeOptions, MergeReport};

/// Build `tag` from `from_index` (or an empty catalog) plus `bundles`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToIndexRequest {
    /// Write the database and Dockerfile instead of building
    pub generate: bool,
    pub from_index: Option<String>,
    pub binary_source_image: Option<String>,
    pub out_dockerfile: Option<PathBuf>,
    pub tag: String,
    pub bundles: Vec<String>,
    pub permissive: bool,
    pub overwrite: bool,
    /// In-image store path; defaults to `/database/index.db`
    pub database_path: Option<String>,
}

impl AddToIndexRequest {
    pub fn new(tag: impl Into<String>, bundles: Vec<String>) -> Self {
        Self {
            generate: false,
            from_index: None,
            binary_source_image: None,
            out_dockerfile: None,
            tag: tag.into(),
            bundles,
            permissive: false,
            overwrite: false,
            database_path: None,
        }
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions {
            tag: self.tag.clone(),
            binary_source_image: self
                .binary_source_image
                .clone()
                .unwrap_or_else(|| DEFAULT_BINARY_IMAGE.to_string()),
            database_path: self
                .database_path
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            base: self.from_index.clone(),
            generate_only: self.generate,
            out_dockerfile: self.out_dockerfile.clone(),
        }
    }

    fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            permissive: self.permissive,
            overwrite: self.overwrite,
            generate_only: self.generate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddToIndexResult {
    pub outcome: RenderOutcome,
    pub report: MergeReport,
}

/// Runs add requests against one container engine
pub struct IndexAdder<'e> {
    engine: &'e dyn ImageEngine,
    cancel: Cancellation,
}

impl<'e> IndexAdder<'e> {
    pub fn new(engine: &'e dyn ImageEngine, cancel: Cancellation) -> Self {
        Self { engine, cancel }
    }

    pub fn add_to_index(&self, request: &AddToIndexRequest) -> Result<AddToIndexResult> {
        if request.bundles.is_empty() {
            return Err(CatalogError::validation("no bundle images to add"));
        }
        validate_reference(&request.tag)?;
        for image in request.from_index.iter().chain(&request.bundles) {
            validate_reference(image)?;
        }
        let options = request.render_options();
        let workspace = Workspace::new(&options)?;

        let base = match &request.from_index {
            Some(from) => Some(workspace.seed(self.engine, from, &self.cancel)?),
            None => None,
        };
        let mut store = workspace.open_store()?;
        let generation = store.generation()?;

        let extractor = Extractor::new(self.engine);
        let mut descriptors = Vec::with_capacity(request.bundles.len());
        for (i, image) in request.bundles.iter().enumerate() {
            self.cancel.check("bundle extraction")?;
            let desc = extractor.bundle(image, &workspace.scratch(&format!("bundles/{}", i)), &self.cancel)?;
            descriptors.push(desc);
        }

        self.cancel.check("merge")?;
        let report = MergeEngine::new(&mut store, request.merge_options())
            .merge_with_base(generation, &descriptors)?;

        // never publish over a base tag that moved since extraction
        if let (Some(from), Some(digest), false) = (&request.from_index, &base, request.generate) {
            if from == &request.tag {
                ensure_base_unchanged(self.engine, from, digest, &workspace.scratch("recheck"), &self.cancel)?;
            }
        }

        let outcome = workspace.finish(self.engine, store, &options, &self.cancel)?;
        info!(
            tag = %request.tag,
            bundles = request.bundles.len(),
            warnings = report.warnings().len(),
            "bundles added to index"
        );
        Ok(AddToIndexResult { outcome, report })
    }
}
