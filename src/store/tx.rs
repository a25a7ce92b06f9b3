//! Write primitives, only reachable inside a [`GraphStore::write`](super::GraphStore::write)
//! transaction

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::HashMap;
use tracing::debug;

use super::{integrity, read, StoredBundle};
use crate::error::{CatalogError, Result};
use crate::graph::{BundleId, BundleNode, BundleState, PackageGraph};

/// An open write transaction on the store
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

impl<'a> StoreTx<'a> {
    pub(super) fn new(tx: Transaction<'a>) -> Self {
        Self { tx }
    }

    pub(super) fn commit(self) -> Result<()> {
        self.tx.execute(
            "UPDATE meta SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE key = 'generation'",
            [],
        )?;
        self.tx.commit()?;
        Ok(())
    }

    // ---- reads inside the transaction ----

    pub fn generation(&self) -> Result<i64> {
        read::generation(&self.tx)
    }

    pub fn snapshot(&self, package: &str) -> Result<Option<PackageGraph>> {
        read::load_package(&self.tx, package)
    }

    pub fn list_packages(&self) -> Result<Vec<String>> {
        read::list_packages(&self.tx)
    }

    pub fn list_bundles(&self, package: &str, include_pruned: bool) -> Result<Vec<StoredBundle>> {
        read::list_bundles(&self.tx, package, include_pruned)
    }

    /// Row id of the live bundle `name` in `package`
    pub fn bundle_row_id(&self, package: &str, name: &str) -> Result<Option<i64>> {
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM bundle WHERE package_name = ?1 AND name = ?2 AND pruned = 0",
                params![package, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn channel_id(&self, package: &str, channel: &str) -> Result<Option<i64>> {
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM channel WHERE package_name = ?1 AND name = ?2",
                params![package, channel],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ---- primitives ----

    /// Insert a package if it is not there yet
    pub fn add_package(&mut self, name: &str, default_channel: Option<&str>) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO package(name, default_channel) VALUES (?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, default_channel],
            )
            .map_err(|e| integrity(e, format!("adding package {}", name)))?;
        Ok(())
    }

    pub fn set_default_channel(&mut self, package: &str, channel: &str) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE package SET default_channel = ?2 WHERE name = ?1",
            params![package, channel],
        )?;
        if updated == 0 {
            return Err(CatalogError::Integrity(format!("package {} does not exist", package)));
        }
        Ok(())
    }

    /// Insert a channel if missing; returns its row id
    pub fn add_channel(&mut self, package: &str, channel: &str) -> Result<i64> {
        if let Some(id) = self.channel_id(package, channel)? {
            return Ok(id);
        }
        self.tx
            .execute(
                "INSERT INTO channel(name, package_name) VALUES (?1, ?2)",
                params![channel, package],
            )
            .map_err(|e| integrity(e, format!("adding channel {}/{}", package, channel)))?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Insert a bundle, or return the live row already holding identical
    /// content. Different content under a live name is a conflict.
    pub fn upsert_bundle(&mut self, package: &str, node: &BundleNode) -> Result<i64> {
        if node.is_live() {
            let existing: Option<(i64, String, String)> = self
                .tx
                .query_row(
                    "SELECT id, version, digest FROM bundle
                     WHERE package_name = ?1 AND name = ?2 AND pruned = 0",
                    params![package, node.name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            if let Some((id, version, digest)) = existing {
                if version == node.version.to_string() && digest == node.digest.to_string() {
                    return Ok(id);
                }
                return Err(CatalogError::conflict(format!(
                    "bundle {}/{} already stored with different content",
                    package, node.name
                )));
            }
        }

        self.tx
            .execute(
                "INSERT INTO bundle(package_name, name, version, digest, content, replaces,
                                    skips, skip_range, pruned, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    package,
                    node.name,
                    node.version.to_string(),
                    node.digest.to_string(),
                    serde_json::to_string(&node.content)?,
                    node.replaces,
                    serde_json::to_string(&node.skips)?,
                    node.skip_range.as_ref().map(|r| r.to_string()),
                    node.state == BundleState::Pruned,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| integrity(e, format!("adding bundle {}/{}", package, node.name)))?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn add_channel_entry(&mut self, channel_id: i64, bundle_id: i64) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO channel_entry(channel_id, bundle_id) VALUES (?1, ?2)
                 ON CONFLICT(channel_id, bundle_id) DO NOTHING",
                params![channel_id, bundle_id],
            )
            .map_err(|e| integrity(e, "adding channel entry"))?;
        Ok(())
    }

    /// Record that `bundle_id` replaces `target_id` within one channel.
    /// Both must already be members of the channel.
    pub fn add_replaces_edge(&mut self, channel_id: i64, bundle_id: i64, target_id: i64) -> Result<()> {
        let target_is_member: bool = self.tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM channel_entry WHERE channel_id = ?1 AND bundle_id = ?2)",
            params![channel_id, target_id],
            |row| row.get(0),
        )?;
        if !target_is_member {
            return Err(CatalogError::Integrity(format!(
                "replaces target row {} is not in channel row {}",
                target_id, channel_id
            )));
        }
        let updated = self.tx.execute(
            "UPDATE channel_entry SET replaces_bundle_id = ?3 WHERE channel_id = ?1 AND bundle_id = ?2",
            params![channel_id, bundle_id, target_id],
        )?;
        if updated == 0 {
            return Err(CatalogError::Integrity(format!(
                "bundle row {} is not in channel row {}",
                bundle_id, channel_id
            )));
        }
        Ok(())
    }

    pub fn add_skip_edge(&mut self, channel_id: i64, bundle_id: i64, skipped_id: i64) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO skip_edge(channel_id, bundle_id, skipped_bundle_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING",
                params![channel_id, bundle_id, skipped_id],
            )
            .map_err(|e| integrity(e, "adding skip edge"))?;
        Ok(())
    }

    pub fn set_head(&mut self, channel_id: i64, bundle_id: Option<i64>) -> Result<()> {
        self.tx
            .execute(
                "UPDATE channel SET head_bundle_id = ?2 WHERE id = ?1",
                params![channel_id, bundle_id],
            )
            .map_err(|e| integrity(e, "setting channel head"))?;
        Ok(())
    }

    /// Soft-delete: the row stays for provenance, queries skip it
    pub fn mark_pruned(&mut self, bundle_id: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE channel SET head_bundle_id = NULL WHERE head_bundle_id = ?1",
            params![bundle_id],
        )?;
        self.tx.execute(
            "DELETE FROM channel_entry WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        self.tx
            .execute("UPDATE bundle SET pruned = 1 WHERE id = ?1", params![bundle_id])?;
        Ok(())
    }

    /// Hard delete of one bundle row and every edge touching it
    pub fn remove_bundle(&mut self, bundle_id: i64) -> Result<()> {
        self.tx.execute(
            "DELETE FROM skip_edge WHERE bundle_id = ?1 OR skipped_bundle_id = ?1",
            params![bundle_id],
        )?;
        self.tx.execute(
            "UPDATE channel_entry SET replaces_bundle_id = NULL WHERE replaces_bundle_id = ?1",
            params![bundle_id],
        )?;
        let removed = self
            .tx
            .execute("DELETE FROM bundle WHERE id = ?1", params![bundle_id])
            .map_err(|e| integrity(e, format!("removing bundle row {}", bundle_id)))?;
        if removed == 0 {
            return Err(CatalogError::NotFound(format!("bundle row {}", bundle_id)));
        }
        Ok(())
    }

    /// Hard delete every soft-deleted bundle of a package
    pub fn purge_pruned(&mut self, package: &str) -> Result<usize> {
        let mut stmt = self
            .tx
            .prepare("SELECT id FROM bundle WHERE package_name = ?1 AND pruned = 1")?;
        let ids = stmt
            .query_map(params![package], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for id in &ids {
            self.remove_bundle(*id)?;
        }
        Ok(ids.len())
    }

    /// Remove a package with all its channels and bundles
    pub fn delete_package(&mut self, package: &str) -> Result<bool> {
        self.clear_package(package)?;
        let removed = self
            .tx
            .execute("DELETE FROM package WHERE name = ?1", params![package])?;
        Ok(removed > 0)
    }

    fn clear_package(&mut self, package: &str) -> Result<()> {
        self.tx.execute(
            "DELETE FROM channel WHERE package_name = ?1",
            params![package],
        )?;
        self.tx.execute(
            "DELETE FROM bundle WHERE package_name = ?1",
            params![package],
        )?;
        Ok(())
    }

    /// Replace every row of `graph.name` with the contents of `graph`
    pub fn write_snapshot(&mut self, graph: &PackageGraph) -> Result<()> {
        self.add_package(&graph.name, graph.default_channel.as_deref())?;
        self.clear_package(&graph.name)?;
        if let Some(default) = &graph.default_channel {
            self.set_default_channel(&graph.name, default)?;
        }

        let mut rows: HashMap<BundleId, i64> = HashMap::with_capacity(graph.bundles.len());
        for (index, node) in graph.bundles.iter().enumerate() {
            let row = self.upsert_bundle(&graph.name, node)?;
            rows.insert(BundleId(index as u32), row);
        }
        let row = |id: &BundleId| {
            rows.get(id).copied().ok_or_else(|| {
                CatalogError::Integrity(format!("edge references unknown bundle {}", id))
            })
        };

        for ch in graph.channels.values().filter(|c| !c.is_empty()) {
            let channel_id = self.add_channel(&graph.name, &ch.name)?;
            for member in &ch.members {
                self.add_channel_entry(channel_id, row(member)?)?;
            }
            for (from, to) in &ch.replaces {
                self.add_replaces_edge(channel_id, row(from)?, row(to)?)?;
            }
            for (from, to) in &ch.skips {
                self.add_skip_edge(channel_id, row(from)?, row(to)?)?;
            }
            let head = ch.head.as_ref().map(row).transpose()?;
            self.set_head(channel_id, head)?;
        }

        debug!(
            package = %graph.name,
            bundles = graph.bundles.len(),
            channels = graph.channels.len(),
            "package snapshot written"
        );
        Ok(())
    }
}
