//! Bundle descriptors
//!
//! A [`BundleDescriptor`] is the typed form of one installable bundle as it
//! enters the merge engine. Descriptors come from the manifest parser
//! ([`manifest`]) or are built directly by callers.

pub mod build;
pub mod manifest;

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path};

use crate::checksum::Digest;
use crate::error::{CatalogError, Result};
use crate::version::SkipRange;

/// One bundle version headed for the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDescriptor {
    /// Bundle name, unique within its package (e.g. `prometheusoperator.0.22.2`)
    pub name: String,
    /// Owning package
    pub package: String,
    pub version: Version,
    /// Service descriptor blob; immutable once stored
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_range: Option<SkipRange>,
    /// Target channels; a bundle joins every channel listed
    pub channels: Vec<String>,
    /// Package default channel as declared by this bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<String>,
}

impl BundleDescriptor {
    /// Create a descriptor with no upgrade metadata
    pub fn new(
        name: impl Into<String>,
        package: impl Into<String>,
        version: Version,
        content: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            version,
            content,
            replaces: None,
            skips: Vec::new(),
            skip_range: None,
            channels: Vec::new(),
            default_channel: None,
        }
    }

    pub fn with_replaces(mut self, target: impl Into<String>) -> Self {
        self.replaces = Some(target.into());
        self
    }

    pub fn with_skips<I, S>(mut self, skips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skips = skips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_range(mut self, range: SkipRange) -> Self {
        self.skip_range = Some(range);
        self
    }

    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = Some(channel.into());
        self
    }

    /// Digest of the content blob
    pub fn digest(&self) -> Digest {
        Digest::from_json(&self.content)
    }

    /// Check the descriptor is well-formed on its own
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::validation("bundle name is empty"));
        }
        if !is_path_component(&self.name) {
            return Err(CatalogError::validation(format!(
                "bundle name '{}' is not a single path component",
                self.name
            )));
        }
        if self.package.trim().is_empty() {
            return Err(CatalogError::validation(format!(
                "bundle {} has no package",
                self.name
            )));
        }
        if is_empty_blob(&self.content) {
            return Err(CatalogError::validation(format!(
                "bundle {} has empty content",
                self.name
            )));
        }
        if self.channels.is_empty() {
            return Err(CatalogError::validation(format!(
                "bundle {} targets no channels",
                self.name
            )));
        }
        if let Some(empty) = self.channels.iter().find(|c| c.trim().is_empty()) {
            return Err(CatalogError::validation(format!(
                "bundle {} has an empty channel name '{}'",
                self.name, empty
            )));
        }
        let unique: BTreeSet<_> = self.channels.iter().collect();
        if unique.len() != self.channels.len() {
            return Err(CatalogError::validation(format!(
                "bundle {} lists a channel twice",
                self.name
            )));
        }
        if self.replaces.as_deref() == Some(self.name.as_str()) {
            return Err(CatalogError::validation(format!(
                "bundle {} replaces itself",
                self.name
            )));
        }
        if self.skips.iter().any(|s| s == &self.name) {
            return Err(CatalogError::validation(format!(
                "bundle {} skips itself",
                self.name
            )));
        }
        if let Some(replaces) = &self.replaces {
            if replaces.trim().is_empty() {
                return Err(CatalogError::validation(format!(
                    "bundle {} has an empty replaces target",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Whether `name` can name a directory directly under another one
pub fn is_path_component(name: &str) -> bool {
    if name.contains(&['/', '\\', '\0'][..]) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_empty_blob(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
