//! Build context shared by the index operations that produce an image

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::{info, warn};

use super::cancel::Cancellation;
use super::engine::ImageEngine;
use super::extract::Extractor;
use super::render::{RenderOptions, RenderOutcome, Renderer};
use super::{DIGEST_LABEL, INDEX_DOCKERFILE};
use crate::checksum::Digest;
use crate::error::{CatalogError, Result};
use crate::store::GraphStore;

/// Scratch space plus the build context the store file is rendered from.
///
/// The context always lives inside the scratch directory so concurrent
/// operations never share files. Generate-only runs copy the finished
/// context next to the requested Dockerfile (or into the current
/// directory) once everything succeeded.
pub(super) struct Workspace {
    scratch: TempDir,
    context: PathBuf,
    database: PathBuf,
    /// Where a generated context is published
    target: Option<PathBuf>,
}

impl Workspace {
    pub fn new(options: &RenderOptions) -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        let context = scratch.path().join("context");
        let database = context.join(options.relative_database_path());
        if let Some(parent) = database.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = options.generate_only.then(|| {
            options
                .out_dockerfile
                .as_deref()
                .and_then(Path::parent)
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        Ok(Self {
            scratch,
            context,
            database,
            target,
        })
    }

    /// Subdirectory of the scratch space
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    /// Seed the context database from an existing index; returns the base
    /// database digest
    pub fn seed(&self, engine: &dyn ImageEngine, from_index: &str, cancel: &Cancellation) -> Result<Digest> {
        let extracted = Extractor::new(engine).database(from_index, &self.scratch("base"), cancel)?;
        fs::copy(&extracted.database, &self.database)?;
        info!(from_index, digest = %extracted.digest, "base index seeded");
        Ok(extracted.digest)
    }

    pub fn open_store(&self) -> Result<GraphStore> {
        GraphStore::open(&self.database)
    }

    /// Close the store so the context holds one self-contained file, then
    /// render it
    pub fn finish(
        &self,
        engine: &dyn ImageEngine,
        store: GraphStore,
        options: &RenderOptions,
        cancel: &Cancellation,
    ) -> Result<RenderOutcome> {
        store.close()?;
        let renderer = Renderer::new(engine);
        let Some(target) = &self.target else {
            return renderer.render(&self.context, &self.database, options, cancel);
        };

        let staged = RenderOptions {
            out_dockerfile: None,
            ..options.clone()
        };
        let RenderOutcome::Generated { dockerfile, digest, .. } =
            renderer.render(&self.context, &self.database, &staged, cancel)?
        else {
            return Err(CatalogError::Integrity("generate-only render built an image".into()));
        };
        cancel.check("publish")?;

        let database = target.join(options.relative_database_path());
        let published = options
            .out_dockerfile
            .clone()
            .unwrap_or_else(|| target.join(INDEX_DOCKERFILE));
        publish(&self.database, &database)?;
        publish(&dockerfile, &published)?;
        info!(dockerfile = %published.display(), database = %database.display(), digest = %digest, "build context published");
        Ok(RenderOutcome::Generated {
            dockerfile: published,
            database,
            digest,
        })
    }
}

/// Copy `src` over `dst` through a temporary file beside `dst`
fn publish(src: &Path, dst: &Path) -> Result<()> {
    let parent = dst
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    if dst.exists() {
        warn!(path = %dst.display(), "replacing existing file in build context");
    }
    let staged = NamedTempFile::new_in(parent)?;
    fs::copy(src, staged.path())?;
    staged.persist(dst).map_err(|err| err.error)?;
    Ok(())
}

/// Fail if `image` no longer carries the database digest an operation was
/// based on
pub(super) fn ensure_base_unchanged(
    engine: &dyn ImageEngine,
    image: &str,
    expected: &Digest,
    scratch: &Path,
    cancel: &Cancellation,
) -> Result<()> {
    let saved = Extractor::new(engine).fetch(image, scratch, cancel)?;
    let current = saved.label(DIGEST_LABEL).map(str::parse::<Digest>).transpose()?;
    match current {
        Some(current) if &current != expected => Err(CatalogError::Conflict(format!(
            "{} moved from {} to {} while this build ran; rebuild against the new base",
            image, expected, current
        ))),
        _ => Ok(()),
    }
}
