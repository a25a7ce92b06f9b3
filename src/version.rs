//! Bundle versions and skip ranges

use semver::{Comparator, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CatalogError, Result};

/// Parse a bundle version, tolerating a leading `v`
pub fn parse_version(version_str: &str) -> Result<Version> {
    let trimmed = version_str.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Ok(Version::parse(trimmed)?)
}

/// A semver interval a bundle declares it can upgrade from, e.g.
/// `>=0.14.0 <0.22.2`.
///
/// Whitespace separates comparators that must all hold; `||` separates
/// alternatives. The range never produces a stored edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SkipRange {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl SkipRange {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CatalogError::validation("empty skipRange"));
        }

        let mut alternatives = Vec::new();
        for alt in raw.split("||") {
            let mut comparators = Vec::new();
            for token in alt.split_whitespace() {
                let token = token.trim_end_matches(',');
                let comparator = Comparator::from_str(token).map_err(|e| {
                    CatalogError::validation(format!("invalid skipRange '{}': {}", raw, e))
                })?;
                comparators.push(comparator);
            }
            if comparators.is_empty() {
                return Err(CatalogError::validation(format!(
                    "invalid skipRange '{}': empty alternative",
                    raw
                )));
            }
            alternatives.push(comparators);
        }

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    /// Whether `version` lies inside the range
    pub fn contains(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|alt| alt.iter().all(|c| c.matches(version)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for SkipRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for SkipRange {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SkipRange {
    type Error = CatalogError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SkipRange> for String {
    fn from(r: SkipRange) -> Self {
        r.raw
    }
}
