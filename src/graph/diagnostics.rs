//! Merge Diagnostics
//!
//! Collects the warnings a merge records instead of failing, either because
//! permissive mode absorbed a conflict or because a skip hint bridged a
//! missing replaces target.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Warning Codes
// =============================================================================

/// Warning code for categorizing merge outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCode {
    /// replaces target missing; edge dropped because permissive
    DanglingReplace,
    /// replaces target missing; skips or skipRange reach an existing bundle
    BridgedReplace,
    /// More than one bundle without incoming edges
    MultipleHeads,
    /// Non-empty channel with no head candidate
    NoHead,
    /// Member not reachable from the channel head
    Unreachable,
    /// Older content replaced by an overwrite
    Superseded,
    /// Bundle of the batch left in no channel after head resolution
    Rejected,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DanglingReplace => "W001",
            Self::BridgedReplace => "W002",
            Self::MultipleHeads => "W003",
            Self::NoHead => "W004",
            Self::Unreachable => "W005",
            Self::Superseded => "W006",
            Self::Rejected => "W007",
        }
    }
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Warning Item
// =============================================================================

/// A single merge warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeWarning {
    pub code: WarningCode,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Bundle the warning is about
    pub bundle: String,
    pub message: String,
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}/", self.code, self.package)?;
        if let Some(channel) = &self.channel {
            write!(f, "{}/", channel)?;
        }
        write!(f, "{}: {}", self.bundle, self.message)
    }
}

// =============================================================================
// Warnings Collection
// =============================================================================

/// Warnings returned alongside a successful merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warnings {
    items: Vec<MergeWarning>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and mirror it to the log
    pub fn record(
        &mut self,
        code: WarningCode,
        package: &str,
        channel: Option<&str>,
        bundle: &str,
        message: impl Into<String>,
    ) {
        let item = MergeWarning {
            code,
            package: package.to_string(),
            channel: channel.map(String::from),
            bundle: bundle.to_string(),
            message: message.into(),
        };
        tracing::warn!(code = %item.code, package, channel, bundle, "{}", item.message);
        self.items.push(item);
    }

    pub fn has(&self, code: WarningCode) -> bool {
        self.items.iter().any(|w| w.code == code)
    }

    pub fn of(&self, code: WarningCode) -> impl Iterator<Item = &MergeWarning> {
        self.items.iter().filter(move |w| w.code == code)
    }

    pub fn all(&self) -> &[MergeWarning] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: Warnings) {
        self.items.extend(other.items);
    }

    /// Format all warnings for display
    pub fn format_all(&self) -> String {
        let mut output = String::new();
        for item in &self.items {
            output.push_str(&format!("{}\n", item));
        }
        if !self.is_empty() {
            output.push_str(&format!("\n{} warning(s)\n", self.len()));
        }
        output
    }
}

impl fmt::Display for Warnings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_all())
    }
}

impl IntoIterator for Warnings {
    type Item = MergeWarning;
    type IntoIter = std::vec::IntoIter<MergeWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Warnings {
    type Item = &'a MergeWarning;
    type IntoIter = std::slice::Iter<'a, MergeWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
