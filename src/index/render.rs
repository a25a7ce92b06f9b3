//! Rendering a store into an index image
//!
//! The store file is written first, hashed, and described by an
//! `index.Dockerfile`. Builds go to a staging tag derived from the database
//! digest and the requested tag; only a finished, uncancelled build is
//! tagged with the requested reference.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::cancel::Cancellation;
use super::engine::ImageEngine;
use super::{
    BASE_LABEL, DATABASE_LABEL, DEFAULT_BINARY_IMAGE, DEFAULT_DATABASE_PATH, DIGEST_LABEL,
    INDEX_DOCKERFILE,
};
use crate::checksum::Digest;
use crate::error::{CatalogError, Result};
use crate::graph::CatalogSnapshot;
use crate::store::GraphStore;

/// How to package a store file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub tag: String,
    pub binary_source_image: String,
    /// Path of the store file inside the image
    pub database_path: String,
    /// Index the new image was built from
    pub base: Option<String>,
    /// Write the Dockerfile and stop
    pub generate_only: bool,
    pub out_dockerfile: Option<PathBuf>,
}

impl RenderOptions {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            binary_source_image: DEFAULT_BINARY_IMAGE.to_string(),
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            base: None,
            generate_only: false,
            out_dockerfile: None,
        }
    }

    /// Store file location relative to the build context
    pub fn relative_database_path(&self) -> PathBuf {
        PathBuf::from(self.database_path.trim_start_matches('/'))
    }
}

/// What a render produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderOutcome {
    Built { tag: String, digest: String },
    Generated { dockerfile: PathBuf, database: PathBuf, digest: String },
}

/// Packages store files as images
pub struct Renderer<'e> {
    engine: &'e dyn ImageEngine,
}

impl<'e> Renderer<'e> {
    pub fn new(engine: &'e dyn ImageEngine) -> Self {
        Self { engine }
    }

    /// Describe `database` (which must live under `context`) and build it
    pub fn render(
        &self,
        context: &Path,
        database: &Path,
        options: &RenderOptions,
        cancel: &Cancellation,
    ) -> Result<RenderOutcome> {
        cancel.check("render")?;
        let relative = database.strip_prefix(context).map_err(|_| {
            CatalogError::validation(format!(
                "database {} is outside build context {}",
                database.display(),
                context.display()
            ))
        })?;
        let digest = Digest::from_file(database)?;
        let dockerfile = options
            .out_dockerfile
            .clone()
            .unwrap_or_else(|| context.join(INDEX_DOCKERFILE));
        if let Some(parent) = dockerfile.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&dockerfile, render_dockerfile(options, relative, &digest))?;

        if options.generate_only {
            info!(dockerfile = %dockerfile.display(), digest = %digest, "index build descriptor written");
            return Ok(RenderOutcome::Generated {
                dockerfile,
                database: database.to_path_buf(),
                digest: digest.to_string(),
            });
        }

        let staging = staging_tag(&options.tag, &digest);
        if let Err(err) = self.engine.build(context, &dockerfile, &staging, cancel) {
            self.discard(&staging);
            return Err(err);
        }
        let published = cancel
            .check("publish")
            .and_then(|_| self.engine.tag(&staging, &options.tag));
        self.discard(&staging);
        published?;

        info!(tag = %options.tag, digest = %digest, base = ?options.base, "index image published");
        Ok(RenderOutcome::Built {
            tag: options.tag.clone(),
            digest: digest.to_string(),
        })
    }

    fn discard(&self, staging: &str) {
        if let Err(err) = self.engine.remove(staging) {
            warn!(tag = staging, error = %err, "failed to remove staging tag");
        }
    }
}

/// Staging reference unique to one database and one target tag
pub fn staging_tag(tag: &str, digest: &Digest) -> String {
    format!(
        "catalog-index-staging:{}-{}",
        digest.short(),
        Digest::from_bytes(tag.as_bytes()).short()
    )
}

fn render_dockerfile(options: &RenderOptions, relative: &Path, digest: &Digest) -> String {
    let mut out = format!("FROM {}\n\n", options.binary_source_image);
    out.push_str(&format!("LABEL {}={}\n", DATABASE_LABEL, options.database_path));
    out.push_str(&format!("LABEL {}={}\n", DIGEST_LABEL, digest));
    if let Some(base) = &options.base {
        out.push_str(&format!("LABEL {}={}\n", BASE_LABEL, base));
    }
    out.push('\n');
    out.push_str(&format!(
        "ADD {} {}\n",
        relative.to_string_lossy(),
        options.database_path
    ));
    out.push_str("EXPOSE 50051\n");
    out.push_str("ENTRYPOINT [\"/bin/opm\"]\n");
    out.push_str(&format!(
        "CMD [\"registry\", \"serve\", \"--database\", \"{}\"]\n",
        options.database_path
    ));
    out
}

/// Serialize a catalog snapshot into a fresh store file; returns its digest
pub fn write_database(catalog: &CatalogSnapshot, path: impl AsRef<Path>) -> Result<Digest> {
    let path = path.as_ref();
    if path.exists() {
        return Err(CatalogError::conflict(format!(
            "{} already exists",
            path.display()
        )));
    }
    let mut store = GraphStore::open(path)?;
    store.write(|tx| {
        for graph in catalog.packages.values() {
            tx.write_snapshot(graph)?;
        }
        Ok(())
    })?;
    store.close()?;
    Digest::from_file(path)
}
