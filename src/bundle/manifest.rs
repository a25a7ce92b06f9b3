//! Bundle manifest directories
//!
//! On disk a bundle is a directory holding `metadata/annotations.json` and a
//! `manifests/` directory with its service descriptor:
//!
//! ```text
//! prometheusoperator.0.22.2/
//! ├── metadata/annotations.json
//! └── manifests/prometheusoperator.0.22.2.clusterserviceversion.json
//! ```
//!
//! Graph fields are read from the annotations first and fall back to the
//! descriptor's own `metadata.name`, `spec.version`, `spec.replaces`,
//! `spec.skips` and `olm.skipRange` annotation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{is_path_component, BundleDescriptor};
use crate::error::{CatalogError, Result};
use crate::version::{parse_version, SkipRange};

pub const MEDIATYPE: &str = "operators.operatorframework.io.bundle.mediatype.v1";
pub const MANIFESTS: &str = "operators.operatorframework.io.bundle.manifests.v1";
pub const METADATA: &str = "operators.operatorframework.io.bundle.metadata.v1";
pub const PACKAGE: &str = "operators.operatorframework.io.bundle.package.v1";
pub const CHANNELS: &str = "operators.operatorframework.io.bundle.channels.v1";
pub const DEFAULT_CHANNEL: &str = "operators.operatorframework.io.bundle.channel.default.v1";

pub const BUNDLE_NAME: &str = "catalog.bundle.name";
pub const BUNDLE_VERSION: &str = "catalog.bundle.version";
pub const BUNDLE_REPLACES: &str = "catalog.bundle.replaces";
pub const BUNDLE_SKIPS: &str = "catalog.bundle.skips";
pub const BUNDLE_SKIP_RANGE: &str = "catalog.bundle.skipRange";

const SKIP_RANGE_ANNOTATION: &str = "olm.skipRange";
const CSV_SUFFIX: &str = ".clusterserviceversion.json";

pub const ANNOTATIONS_PATH: &str = "metadata/annotations.json";
pub const MANIFESTS_DIR: &str = "manifests";

/// `metadata/annotations.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationsFile {
    pub annotations: BTreeMap<String, String>,
}

impl AnnotationsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            CatalogError::validation(format!("{}: invalid annotations: {}", path.display(), e))
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Annotations describing package membership, as written by a bundle build
pub fn package_annotations(
    package: &str,
    channels: &[String],
    default_channel: Option<&str>,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(MEDIATYPE.to_string(), "registry+v1".to_string());
    annotations.insert(MANIFESTS.to_string(), format!("{}/", MANIFESTS_DIR));
    annotations.insert(METADATA.to_string(), "metadata/".to_string());
    annotations.insert(PACKAGE.to_string(), package.to_string());
    annotations.insert(CHANNELS.to_string(), channels.join(","));
    if let Some(default) = default_channel {
        annotations.insert(DEFAULT_CHANNEL.to_string(), default.to_string());
    }
    annotations
}

/// Full annotation set for an exported bundle, graph fields included
pub fn descriptor_annotations(desc: &BundleDescriptor) -> BTreeMap<String, String> {
    let mut annotations =
        package_annotations(&desc.package, &desc.channels, desc.default_channel.as_deref());
    annotations.insert(BUNDLE_NAME.to_string(), desc.name.clone());
    annotations.insert(BUNDLE_VERSION.to_string(), desc.version.to_string());
    if let Some(replaces) = &desc.replaces {
        annotations.insert(BUNDLE_REPLACES.to_string(), replaces.clone());
    }
    if !desc.skips.is_empty() {
        annotations.insert(BUNDLE_SKIPS.to_string(), desc.skips.join(","));
    }
    if let Some(range) = &desc.skip_range {
        annotations.insert(BUNDLE_SKIP_RANGE.to_string(), range.to_string());
    }
    annotations
}

/// Whether `dir` looks like a bundle directory
pub fn is_bundle_dir(dir: &Path) -> bool {
    dir.join(ANNOTATIONS_PATH).is_file()
}

/// Parse one bundle directory into a descriptor
pub fn read_bundle_dir(dir: impl AsRef<Path>) -> Result<BundleDescriptor> {
    let dir = dir.as_ref();
    let annotations = AnnotationsFile::load(dir.join(ANNOTATIONS_PATH))?;
    let csv_path = find_csv(&dir.join(MANIFESTS_DIR))?;
    let content: serde_json::Value = serde_json::from_str(&fs::read_to_string(&csv_path)?)
        .map_err(|e| {
            CatalogError::validation(format!("{}: invalid manifest: {}", csv_path.display(), e))
        })?;

    let invalid = |what: &str| {
        CatalogError::validation(format!("{}: missing {}", dir.display(), what))
    };

    let package = annotations.get(PACKAGE).ok_or_else(|| invalid(PACKAGE))?;
    let name = annotations
        .get(BUNDLE_NAME)
        .or_else(|| content.pointer("/metadata/name").and_then(|v| v.as_str()))
        .ok_or_else(|| invalid("bundle name"))?;
    let version = annotations
        .get(BUNDLE_VERSION)
        .or_else(|| content.pointer("/spec/version").and_then(|v| v.as_str()))
        .ok_or_else(|| invalid("bundle version"))?;
    let version = parse_version(version)?;

    let mut desc = BundleDescriptor::new(name, package, version, content.clone());
    desc.channels = split_list(annotations.get(CHANNELS).ok_or_else(|| invalid(CHANNELS))?);
    desc.default_channel = annotations.get(DEFAULT_CHANNEL).map(String::from);

    desc.replaces = annotations
        .get(BUNDLE_REPLACES)
        .or_else(|| content.pointer("/spec/replaces").and_then(|v| v.as_str()))
        .map(String::from);

    desc.skips = match annotations.get(BUNDLE_SKIPS) {
        Some(list) => split_list(list),
        None => content
            .pointer("/spec/skips")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
    };

    let range = annotations.get(BUNDLE_SKIP_RANGE).or_else(|| {
        content
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(SKIP_RANGE_ANNOTATION))
            .and_then(|v| v.as_str())
    });
    desc.skip_range = range.map(SkipRange::parse).transpose()?;

    debug!(bundle = %desc.name, dir = %dir.display(), "bundle manifest parsed");
    Ok(desc)
}

/// Write a descriptor as a bundle directory under `out`; returns its path
pub fn write_bundle_dir(out: impl AsRef<Path>, desc: &BundleDescriptor) -> Result<PathBuf> {
    let out = out.as_ref();
    if !is_path_component(&desc.name) {
        return Err(CatalogError::validation(format!(
            "bundle name '{}' would be written outside {}",
            desc.name,
            out.display()
        )));
    }
    let dir = out.join(&desc.name);
    let manifests = dir.join(MANIFESTS_DIR);
    fs::create_dir_all(&manifests)?;
    fs::write(
        manifests.join(format!("{}{}", desc.name, CSV_SUFFIX)),
        serde_json::to_string_pretty(&desc.content)?,
    )?;
    AnnotationsFile {
        annotations: descriptor_annotations(desc),
    }
    .save(dir.join(ANNOTATIONS_PATH))?;
    Ok(dir)
}

/// The service descriptor file of a manifests directory
fn find_csv(manifests: &Path) -> Result<PathBuf> {
    let mut json_files: Vec<PathBuf> = fs::read_dir(manifests)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    json_files.sort();

    if let Some(csv) = json_files.iter().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(CSV_SUFFIX))
            .unwrap_or(false)
    }) {
        return Ok(csv.clone());
    }
    match json_files.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(CatalogError::validation(format!(
            "{}: no manifest found",
            manifests.display()
        ))),
        _ => Err(CatalogError::validation(format!(
            "{}: several manifests and none named *{}",
            manifests.display(),
            CSV_SUFFIX
        ))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
