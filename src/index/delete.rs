//! Removing packages from an index

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use super::cancel::Cancellation;
use super::engine::ImageEngine;
use super::render::{RenderOptions, RenderOutcome};
use super::workspace::Workspace;
use super::{validate_reference, DEFAULT_BINARY_IMAGE, DEFAULT_DATABASE_PATH};
use crate::error::{CatalogError, Result};
use crate::merge::{MergeEngine, MergeOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFromIndexRequest {
    pub from_index: String,
    pub packages: Vec<String>,
    pub tag: String,
    pub generate: bool,
    pub binary_source_image: Option<String>,
    pub out_dockerfile: Option<PathBuf>,
    pub database_path: Option<String>,
}

/// Runs delete requests against one container engine
pub struct IndexDeleter<'e> {
    engine: &'e dyn ImageEngine,
    cancel: Cancellation,
}

impl<'e> IndexDeleter<'e> {
    pub fn new(engine: &'e dyn ImageEngine, cancel: Cancellation) -> Self {
        Self { engine, cancel }
    }

    /// Drop whole packages from `from_index` and render the rest as `tag`
    pub fn delete_from_index(&self, request: &DeleteFromIndexRequest) -> Result<RenderOutcome> {
        if request.packages.is_empty() {
            return Err(CatalogError::validation("no packages to delete"));
        }
        validate_reference(&request.from_index)?;
        validate_reference(&request.tag)?;
        let options = RenderOptions {
            tag: request.tag.clone(),
            binary_source_image: request
                .binary_source_image
                .clone()
                .unwrap_or_else(|| DEFAULT_BINARY_IMAGE.to_string()),
            database_path: request
                .database_path
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            base: Some(request.from_index.clone()),
            generate_only: request.generate,
            out_dockerfile: request.out_dockerfile.clone(),
        };
        let workspace = Workspace::new(&options)?;
        workspace.seed(self.engine, &request.from_index, &self.cancel)?;

        let mut store = workspace.open_store()?;
        MergeEngine::new(&mut store, MergeOptions::default()).delete_packages(&request.packages)?;

        let outcome = workspace.finish(self.engine, store, &options, &self.cancel)?;
        info!(from_index = %request.from_index, packages = ?request.packages, tag = %request.tag, "packages deleted from index");
        Ok(outcome)
    }
}
