//! Index Materializer
//!
//! Moves catalog graphs in and out of index images. An index image is a
//! thin layer over a registry-serving base image that carries one SQLite
//! store file, labelled with its in-image path and content digest.
//!
//! ```text
//! from-index ──pull/save──▶ extract ──▶ GraphStore ──merge──▶ render ──build──▶ tag
//!                                          ▲
//! bundle images ──pull/save──▶ manifests ──┘
//! ```
//!
//! All blocking work honours a [`Cancellation`]; a cancelled render never
//! tags the requested reference.

pub mod add;
pub mod cancel;
pub mod delete;
pub mod engine;
pub mod export;
pub mod extract;
pub mod render;
mod workspace;

pub use add::{AddToIndexRequest, AddToIndexResult, IndexAdder};
pub use cancel::Cancellation;
pub use delete::{DeleteFromIndexRequest, IndexDeleter};
pub use engine::{CliImageEngine, ContainerTool, Credentials, ImageEngine};
pub use export::{export_package, ExportFromIndexRequest, ExportOptions, ExportSummary, IndexExporter};
pub use extract::{extract_from_file, Extractor, SavedImage};
pub use render::{write_database, RenderOptions, RenderOutcome, Renderer};

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CatalogError, Result};

/// Label holding the in-image path of the store file
pub const DATABASE_LABEL: &str = "operators.operatorframework.io.index.database.v1";
/// Label holding the sha256 of the store file
pub const DIGEST_LABEL: &str = "catalog.index.digest";
/// Label naming the index an image was built from
pub const BASE_LABEL: &str = "catalog.index.base";

pub const DEFAULT_DATABASE_PATH: &str = "/database/index.db";
pub const DEFAULT_BINARY_IMAGE: &str = "quay.io/operator-framework/upstream-registry-builder";
pub const INDEX_DOCKERFILE: &str = "index.Dockerfile";

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:[a-zA-Z0-9.-]+(?::[0-9]+)?/)?[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*(?::\w[\w.-]{0,127})?(?:@sha256:[a-f0-9]{64})?$",
        )
        .unwrap()
    })
}

/// Reject strings that cannot name an image before any engine call
pub fn validate_reference(reference: &str) -> Result<()> {
    if reference_pattern().is_match(reference) {
        Ok(())
    } else {
        Err(CatalogError::validation(format!(
            "'{}' is not a valid image reference",
            reference
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_references() {
        for ok in [
            "quay.io/operator-framework/upstream-registry-builder",
            "quay.io/example/index:1.0",
            "localhost:5000/index:latest",
            "catalog-index-staging:0a1b2c3d-4e5f6a7b",
            "busybox",
        ] {
            assert!(validate_reference(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "Quay.io/Upper Case:1", "index:", "a//b"] {
            assert!(validate_reference(bad).is_err(), "{}", bad);
        }
    }
}
