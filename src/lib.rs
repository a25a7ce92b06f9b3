//! Bundle Catalog Graph Engine
//!
//! Keeps the upgrade graphs of installable bundles (packages, channels,
//! replaces and skips edges) in a SQLite store, merges new bundle batches
//! into them, and ships the store as an index image.
//!
//! ## Features
//!
//! - **Transactional merges**: a batch applies completely or not at all
//! - **Single-head channels**: every channel keeps exactly one head, with
//!   every other member reachable from it
//! - **Versioned schema**: ordered migrations with a dirty flag that blocks
//!   a half-migrated store
//! - **Index images**: extract, render, add, delete and export through a
//!   pluggable container engine
//! - **Round trips**: exported manifest trees populate back into the same
//!   graph
//!
//! ## Architecture
//!
//! ```text
//! manifests/ ──parse──▶ BundleDescriptor ──▶ MergeEngine ──▶ GraphStore (SQLite)
//!                                                 ▲               │
//!                    populate ◀── export ◀────────┴── extract ◀───┴──▶ render ──▶ index image
//! ```

pub mod bundle;
pub mod checksum;
pub mod config;
pub mod error;
pub mod graph;
pub mod index;
pub mod merge;
pub mod migrate;
pub mod populate;
pub mod store;
pub mod version;

pub use bundle::BundleDescriptor;
pub use checksum::Digest;
pub use config::CatalogConfig;
pub use error::{CatalogError, Result};
pub use graph::{BundleId, BundleNode, CatalogSnapshot, ChannelGraph, PackageGraph, WarningCode, Warnings};
pub use index::{Cancellation, ImageEngine};
pub use merge::{MergeEngine, MergeOptions, MergeReport, RemoveMode};
pub use migrate::{MigrationStatus, Migrator};
pub use populate::DirectoryLoader;
pub use store::GraphStore;
pub use version::SkipRange;
