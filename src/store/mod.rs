//! Graph Store
//!
//! Transactional SQLite persistence of packages, channels, bundles and
//! edges. Reads go through [`GraphStore`]; every mutation goes through a
//! [`StoreTx`] handed out by [`GraphStore::write`], so a batch commits as a
//! whole or not at all. Readers on other connections see the state before
//! or after a write, never in between.

mod read;
mod tx;

pub use tx::StoreTx;

use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{CatalogError, Result};
use crate::graph::{BundleNode, CatalogSnapshot, PackageGraph};
use crate::migrate::{MigrationStatus, Migrator};

/// A bundle row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBundle {
    pub row_id: i64,
    pub package: String,
    pub node: BundleNode,
    /// Channels the bundle is a member of, sorted
    pub channels: Vec<String>,
}

/// Handle on one catalog database
pub struct GraphStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl GraphStore {
    /// Open (or create) a store file and bring its schema up to date
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, Some(path))
    }

    /// Private in-memory store, mostly for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Migrator::new(&mut conn).migrate()?;
        debug!(path = ?path, "graph store opened");
        Ok(Self { conn, path })
    }

    /// Migration state of a store file, without migrating it
    pub fn status(path: impl AsRef<Path>) -> Result<MigrationStatus> {
        let mut conn = Connection::open(path.as_ref())?;
        let status = Migrator::new(&mut conn).status()?;
        Ok(status)
    }

    /// Clear a failed migration by declaring the store to be at `version`
    pub fn force(path: impl AsRef<Path>, version: u32) -> Result<()> {
        let mut conn = Connection::open(path.as_ref())?;
        Migrator::new(&mut conn).force(version)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside one immediate transaction.
    ///
    /// An error from `f` rolls back everything it did. A successful write
    /// bumps the store generation.
    pub fn write<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut store_tx = StoreTx::new(tx);
        let value = f(&mut store_tx)?;
        store_tx.commit()?;
        Ok(value)
    }

    /// Monotonic counter bumped by every committed write
    pub fn generation(&self) -> Result<i64> {
        read::generation(&self.conn)
    }

    pub fn list_packages(&self) -> Result<Vec<String>> {
        read::list_packages(&self.conn)
    }

    pub fn list_channels(&self, package: &str) -> Result<Vec<String>> {
        read::list_channels(&self.conn, package)
    }

    pub fn default_channel(&self, package: &str) -> Result<Option<String>> {
        read::default_channel(&self.conn, package)
    }

    /// Head bundle of a channel
    pub fn get_head(&self, package: &str, channel: &str) -> Result<Option<StoredBundle>> {
        read::get_head(&self.conn, package, channel)
    }

    /// Bundles of a package in insertion order; soft-deleted ones only on
    /// request
    pub fn list_bundles(&self, package: &str, include_pruned: bool) -> Result<Vec<StoredBundle>> {
        read::list_bundles(&self.conn, package, include_pruned)
    }

    /// Materialize one package's graph
    pub fn snapshot(&self, package: &str) -> Result<Option<PackageGraph>> {
        read::load_package(&self.conn, package)
    }

    /// Materialize every package
    pub fn catalog(&self) -> Result<CatalogSnapshot> {
        let mut catalog = CatalogSnapshot::new();
        for name in self.list_packages()? {
            if let Some(graph) = self.snapshot(&name)? {
                catalog.insert(graph);
            }
        }
        Ok(catalog)
    }

    /// Fold the WAL back into the main file and close, leaving a single
    /// self-contained database file
    pub fn close(self) -> Result<Option<PathBuf>> {
        if self.path.is_some() {
            self.conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            self.conn.pragma_update(None, "journal_mode", "DELETE")?;
        }
        let path = self.path.clone();
        self.conn
            .close()
            .map_err(|(_, err)| CatalogError::Sql(err))?;
        Ok(path)
    }
}

/// Map constraint failures to integrity errors, pass everything else on
pub(crate) fn integrity(err: rusqlite::Error, what: impl std::fmt::Display) -> CatalogError {
    match &err {
        rusqlite::Error::SqliteFailure(code, msg)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CatalogError::Integrity(format!(
                "{}: {}",
                what,
                msg.clone().unwrap_or_else(|| err.to_string())
            ))
        }
        _ => CatalogError::Sql(err),
    }
}
