//! Error types for the catalog

use thiserror::Error;

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Malformed bundle descriptor or manifest
    #[error("Invalid bundle: {0}")]
    Validation(String),

    /// Divergent content under one name, or a channel without exactly one head
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bundle {bundle} replaces {target}, which is not in channel {channel}")]
    DanglingReplace {
        bundle: String,
        target: String,
        channel: String,
    },

    /// Schema migration failed; the store is unusable until resolved
    #[error("Migration {version} ({name}) failed: {reason}")]
    Migration {
        version: u32,
        name: String,
        reason: String,
    },

    /// The store changed underneath a merge that expected a specific base
    #[error("Base index mismatch: expected generation {expected}, found {actual}")]
    BaseMismatch { expected: i64, actual: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Referential integrity broken inside the store
    #[error("Store integrity violation: {0}")]
    Integrity(String),

    #[error("Image operation failed: {0}")]
    Image(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Semver error: {0}")]
    Semver(#[from] semver::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

impl CatalogError {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::Io(_) | CatalogError::Image(_) | CatalogError::Cancelled(_)
        )
    }

    /// Whether the store must not be used until an operator intervenes
    pub fn is_fatal(&self) -> bool {
        matches!(self, CatalogError::Migration { .. } | CatalogError::Integrity(_))
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        CatalogError::Validation(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        CatalogError::Conflict(msg.into())
    }
}
