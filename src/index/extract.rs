//! Reading index and bundle images back
//!
//! Images are read from `docker save` archives: a tarball whose
//! `manifest.json` names the image config and the layer tarballs in
//! application order. Layers may be gzipped; whiteout entries (`.wh.name`,
//! `.wh..wh..opq`) delete what earlier layers put down.

use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::cancel::Cancellation;
use super::engine::ImageEngine;
use super::{DATABASE_LABEL, DEFAULT_DATABASE_PATH, DIGEST_LABEL};
use crate::bundle::manifest::{read_bundle_dir, MANIFESTS_DIR};
use crate::bundle::BundleDescriptor;
use crate::checksum::Digest;
use crate::error::{CatalogError, Result};
use crate::graph::CatalogSnapshot;
use crate::store::GraphStore;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    layers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: ContainerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

/// A `docker save` archive unpacked to a scratch directory
#[derive(Debug)]
pub struct SavedImage {
    dir: PathBuf,
    layers: Vec<PathBuf>,
    labels: BTreeMap<String, String>,
}

impl SavedImage {
    /// Unpack `archive` into `scratch` and read its manifest
    pub fn open(archive: &Path, scratch: &Path) -> Result<Self> {
        fs::create_dir_all(scratch)?;
        tar::Archive::new(BufReader::new(File::open(archive)?)).unpack(scratch)?;

        let manifest_path = scratch.join("manifest.json");
        let entries: Vec<ManifestEntry> = serde_json::from_reader(BufReader::new(
            File::open(&manifest_path).map_err(|e| {
                CatalogError::Image(format!("{} has no manifest.json: {}", archive.display(), e))
            })?,
        ))?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            CatalogError::Image(format!("{} lists no images", archive.display()))
        })?;

        let config: ImageConfig =
            serde_json::from_reader(BufReader::new(File::open(scratch.join(&entry.config))?))?;
        Ok(Self {
            dir: scratch.to_path_buf(),
            layers: entry.layers.iter().map(|l| scratch.join(l)).collect(),
            labels: config.config.labels.unwrap_or_default(),
        })
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Apply every layer in order onto `dest`, keeping only paths `keep`
    /// accepts; returns the number of entries written
    pub fn unpack_into<F>(&self, dest: &Path, keep: F, cancel: &Cancellation) -> Result<usize>
    where
        F: Fn(&Path) -> bool,
    {
        fs::create_dir_all(dest)?;
        let mut written = 0;
        for layer in &self.layers {
            cancel.check("layer extraction")?;
            written += apply_layer(layer, dest, &keep)?;
        }
        debug!(layers = self.layers.len(), written, dest = %dest.display(), "layers applied");
        Ok(written)
    }
}

fn open_layer(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let gzipped = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0))?;
    if gzipped {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn apply_layer(layer: &Path, dest: &Path, keep: &dyn Fn(&Path) -> bool) -> Result<usize> {
    let mut archive = tar::Archive::new(open_layer(layer)?);
    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = normalize(&entry.path()?);
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };

        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = dest.join(path.parent().unwrap_or_else(|| Path::new("")));
            if file_name == OPAQUE_WHITEOUT {
                clear_dir(&parent)?;
            } else {
                remove_path(&parent.join(hidden))?;
            }
            continue;
        }

        if !keep(&path) {
            continue;
        }
        if entry.unpack_in(dest)? {
            written += 1;
        }
    }
    Ok(written)
}

/// Strip leading `/` and `./` so layer paths compare as relative paths
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// An index store file pulled out of an image
#[derive(Debug)]
pub struct ExtractedIndex {
    pub database: PathBuf,
    pub digest: Digest,
    pub labels: BTreeMap<String, String>,
}

/// Pulls images through an [`ImageEngine`] and reads them back
pub struct Extractor<'e> {
    engine: &'e dyn ImageEngine,
}

impl<'e> Extractor<'e> {
    pub fn new(engine: &'e dyn ImageEngine) -> Self {
        Self { engine }
    }

    /// Pull `image` and unpack its saved archive under `workdir`
    pub fn fetch(&self, image: &str, workdir: &Path, cancel: &Cancellation) -> Result<SavedImage> {
        fs::create_dir_all(workdir)?;
        self.engine.pull(image, cancel)?;
        cancel.check("image save")?;
        let archive = workdir.join("image.tar");
        self.engine.save(image, &archive, cancel)?;
        SavedImage::open(&archive, &workdir.join("saved"))
    }

    /// Extract the store file of an index image, checking its digest label
    pub fn database(&self, image: &str, workdir: &Path, cancel: &Cancellation) -> Result<ExtractedIndex> {
        let saved = self.fetch(image, workdir, cancel)?;
        let in_image = saved.label(DATABASE_LABEL).unwrap_or(DEFAULT_DATABASE_PATH);
        let relative = normalize(Path::new(in_image));
        let rootfs = workdir.join("rootfs");
        saved.unpack_into(&rootfs, |p| p == relative.as_path(), cancel)?;

        let database = rootfs.join(&relative);
        if !database.is_file() {
            return Err(CatalogError::Image(format!(
                "{} has no index database at {}",
                image, in_image
            )));
        }
        let digest = Digest::from_file(&database)?;
        if let Some(expected) = saved.label(DIGEST_LABEL) {
            let expected: Digest = expected.parse()?;
            if expected != digest {
                return Err(CatalogError::Integrity(format!(
                    "{}: database digest {} does not match label {}",
                    image, digest, expected
                )));
            }
        }
        info!(image, digest = %digest, "index database extracted");
        Ok(ExtractedIndex {
            database,
            digest,
            labels: saved.labels().clone(),
        })
    }

    /// Extract a bundle image's manifests and parse them
    pub fn bundle(&self, image: &str, workdir: &Path, cancel: &Cancellation) -> Result<BundleDescriptor> {
        let saved = self.fetch(image, workdir, cancel)?;
        let bundle_dir = workdir.join("bundle");
        saved.unpack_into(
            &bundle_dir,
            |p| p.starts_with(MANIFESTS_DIR) || p.starts_with("metadata"),
            cancel,
        )?;
        let desc = read_bundle_dir(&bundle_dir)?;
        debug!(image, bundle = %desc.name, "bundle image extracted");
        Ok(desc)
    }

    /// Every package graph stored in an index image
    pub fn snapshot(&self, image: &str, cancel: &Cancellation) -> Result<CatalogSnapshot> {
        let scratch = tempfile::tempdir()?;
        let extracted = self.database(image, scratch.path(), cancel)?;
        let store = GraphStore::open(&extracted.database)?;
        store.catalog()
    }
}

/// Read a catalog straight from a local store file, leaving the file as is
pub fn extract_from_file(path: impl AsRef<Path>) -> Result<CatalogSnapshot> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(CatalogError::NotFound(format!("database {}", path.display())));
    }
    let scratch = tempfile::tempdir()?;
    let copy = scratch.path().join("index.db");
    fs::copy(path, &copy)?;
    GraphStore::open(&copy)?.catalog()
}
