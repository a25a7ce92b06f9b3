//! Schema migrations for the catalog store
//!
//! Migrations are applied in version order, one transaction each. The
//! applied version lives in `schema_version`; a migration that fails is
//! rolled back on its own and leaves the store marked dirty at that version,
//! which blocks every further open until [`Migrator::force`] clears it.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{CatalogError, Result};

/// One ordered schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Every migration this build knows, oldest first
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: r#"
            CREATE TABLE package (
                name TEXT PRIMARY KEY,
                default_channel TEXT
            );
            CREATE TABLE bundle (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_name TEXT NOT NULL REFERENCES package(name) ON DELETE CASCADE,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                digest TEXT NOT NULL,
                content TEXT NOT NULL,
                replaces TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX bundle_name ON bundle(package_name, name);
            CREATE TABLE channel (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                package_name TEXT NOT NULL REFERENCES package(name) ON DELETE CASCADE,
                head_bundle_id INTEGER REFERENCES bundle(id) ON DELETE SET NULL,
                UNIQUE(package_name, name)
            );
            CREATE TABLE channel_entry (
                channel_id INTEGER NOT NULL REFERENCES channel(id) ON DELETE CASCADE,
                bundle_id INTEGER NOT NULL REFERENCES bundle(id) ON DELETE CASCADE,
                replaces_bundle_id INTEGER REFERENCES bundle(id) ON DELETE SET NULL,
                PRIMARY KEY(channel_id, bundle_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "skip_metadata",
        sql: r#"
            ALTER TABLE bundle ADD COLUMN skips TEXT NOT NULL DEFAULT '[]';
            ALTER TABLE bundle ADD COLUMN skip_range TEXT;
            CREATE TABLE skip_edge (
                channel_id INTEGER NOT NULL REFERENCES channel(id) ON DELETE CASCADE,
                bundle_id INTEGER NOT NULL REFERENCES bundle(id) ON DELETE CASCADE,
                skipped_bundle_id INTEGER NOT NULL REFERENCES bundle(id) ON DELETE CASCADE,
                PRIMARY KEY(channel_id, bundle_id, skipped_bundle_id)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "soft_delete",
        sql: r#"
            ALTER TABLE bundle ADD COLUMN pruned INTEGER NOT NULL DEFAULT 0;
            DROP INDEX bundle_name;
            CREATE UNIQUE INDEX bundle_live_name ON bundle(package_name, name) WHERE pruned = 0;
            CREATE INDEX bundle_package ON bundle(package_name);
        "#,
    },
    Migration {
        version: 4,
        name: "store_generation",
        sql: r#"
            CREATE TABLE meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            INSERT INTO meta(key, value) VALUES ('generation', '0');
        "#,
    },
];

/// Latest schema version known to this build
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Where a store stands relative to the known migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current: u32,
    pub latest: u32,
    pub dirty: bool,
    pub pending: Vec<u32>,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        !self.dirty && self.current == self.latest
    }
}

/// Applies migrations to one connection
pub struct Migrator<'c> {
    conn: &'c mut Connection,
    migrations: &'c [Migration],
}

impl<'c> Migrator<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self::with_migrations(conn, MIGRATIONS)
    }

    /// Use a custom migration list (must be sorted by version)
    pub fn with_migrations(conn: &'c mut Connection, migrations: &'c [Migration]) -> Self {
        Self { conn, migrations }
    }

    fn latest(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    fn ensure_version_table(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            self.conn.execute(
                "INSERT INTO schema_version(version, dirty, updated_at) VALUES (0, 0, ?1)",
                params![Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    }

    /// Report the applied version and what is pending
    pub fn status(&self) -> Result<MigrationStatus> {
        self.ensure_version_table()?;
        let (current, dirty): (u32, bool) = self.conn.query_row(
            "SELECT version, dirty FROM schema_version LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
        )?;
        let pending = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .map(|m| m.version)
            .collect();
        Ok(MigrationStatus {
            current,
            latest: self.latest(),
            dirty,
            pending,
        })
    }

    /// Apply every pending migration; a no-op on an up-to-date store
    pub fn migrate(&mut self) -> Result<Vec<u32>> {
        let status = self.status()?;
        self.check_usable(&status)?;

        let migrations = self.migrations;
        let mut applied = Vec::new();
        for migration in migrations.iter().filter(|m| m.version > status.current) {
            debug!(version = migration.version, name = migration.name, "applying migration");
            if let Err(err) = self.apply(migration) {
                self.mark_dirty(migration.version)?;
                return Err(CatalogError::Migration {
                    version: migration.version,
                    name: migration.name.to_string(),
                    reason: err.to_string(),
                });
            }
            applied.push(migration.version);
        }

        if !applied.is_empty() {
            info!(applied = ?applied, version = self.latest(), "store schema migrated");
        }
        Ok(applied)
    }

    /// Clear a dirty marker after manual repair, pinning the version
    pub fn force(&mut self, version: u32) -> Result<()> {
        self.ensure_version_table()?;
        self.conn.execute(
            "UPDATE schema_version SET version = ?1, dirty = 0, updated_at = ?2",
            params![version, Utc::now().to_rfc3339()],
        )?;
        info!(version, "schema version forced");
        Ok(())
    }

    /// Fail unless the store can be read and written by this build
    pub fn check_usable(&self, status: &MigrationStatus) -> Result<()> {
        if status.dirty {
            let name = self
                .migrations
                .iter()
                .find(|m| m.version == status.current)
                .map(|m| m.name)
                .unwrap_or("unknown");
            return Err(CatalogError::Migration {
                version: status.current,
                name: name.to_string(),
                reason: "store is dirty after a failed migration; repair it and force a version"
                    .to_string(),
            });
        }
        if status.current > status.latest {
            return Err(CatalogError::Migration {
                version: status.current,
                name: "unknown".to_string(),
                reason: format!(
                    "store schema is newer than this build supports (latest {})",
                    status.latest
                ),
            });
        }
        Ok(())
    }

    fn apply(&mut self, migration: &Migration) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "UPDATE schema_version SET version = ?1, dirty = 0, updated_at = ?2",
            params![migration.version, Utc::now().to_rfc3339()],
        )?;
        tx.commit()
    }

    fn mark_dirty(&self, version: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE schema_version SET version = ?1, dirty = 1, updated_at = ?2",
            params![version, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
