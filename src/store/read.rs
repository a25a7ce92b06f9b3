//! Read queries shared by [`GraphStore`](super::GraphStore) and
//! [`StoreTx`](super::StoreTx)

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use super::StoredBundle;
use crate::checksum::Digest;
use crate::error::{CatalogError, Result};
use crate::graph::{BundleId, BundleNode, BundleState, ChannelGraph, PackageGraph};
use crate::version::{parse_version, SkipRange};

const BUNDLE_COLUMNS: &str =
    "id, package_name, name, version, digest, content, replaces, skips, skip_range, pruned";

/// Raw bundle row before decoding
struct BundleRow {
    id: i64,
    package: String,
    name: String,
    version: String,
    digest: String,
    content: String,
    replaces: Option<String>,
    skips: String,
    skip_range: Option<String>,
    pruned: bool,
}

impl BundleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            package: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            digest: row.get(4)?,
            content: row.get(5)?,
            replaces: row.get(6)?,
            skips: row.get(7)?,
            skip_range: row.get(8)?,
            pruned: row.get::<_, i64>(9)? != 0,
        })
    }

    fn decode(self) -> Result<(i64, String, BundleNode)> {
        let corrupt = |what: &str, detail: String| {
            CatalogError::Integrity(format!("bundle {} has corrupt {}: {}", self.name, what, detail))
        };
        let version = parse_version(&self.version).map_err(|e| corrupt("version", e.to_string()))?;
        let digest: Digest = self
            .digest
            .parse()
            .map_err(|e: CatalogError| corrupt("digest", e.to_string()))?;
        let content = serde_json::from_str(&self.content)
            .map_err(|e| corrupt("content", e.to_string()))?;
        let skips: Vec<String> =
            serde_json::from_str(&self.skips).map_err(|e| corrupt("skips", e.to_string()))?;
        let skip_range = self
            .skip_range
            .as_deref()
            .map(SkipRange::parse)
            .transpose()
            .map_err(|e| corrupt("skipRange", e.to_string()))?;
        let node = BundleNode {
            name: self.name.clone(),
            version,
            digest,
            content,
            replaces: self.replaces.clone(),
            skips,
            skip_range,
            state: if self.pruned {
                BundleState::Pruned
            } else {
                BundleState::Live
            },
        };
        Ok((self.id, self.package, node))
    }
}

pub(crate) fn generation(conn: &Connection) -> Result<i64> {
    let value: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'generation'",
        [],
        |row| row.get(0),
    )?;
    value
        .parse()
        .map_err(|_| CatalogError::Integrity(format!("generation '{}' is not a number", value)))
}

pub(crate) fn list_packages(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM package ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

pub(crate) fn list_channels(conn: &Connection, package: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM channel WHERE package_name = ?1 ORDER BY name")?;
    let names = stmt
        .query_map(params![package], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

pub(crate) fn default_channel(conn: &Connection, package: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT default_channel FROM package WHERE name = ?1",
            params![package],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

fn channels_of(conn: &Connection, bundle_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT c.name FROM channel_entry e JOIN channel c ON c.id = e.channel_id
         WHERE e.bundle_id = ?1 ORDER BY c.name",
    )?;
    let names = stmt
        .query_map(params![bundle_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

fn stored(conn: &Connection, row: BundleRow) -> Result<StoredBundle> {
    let (row_id, package, node) = row.decode()?;
    Ok(StoredBundle {
        row_id,
        package,
        node,
        channels: channels_of(conn, row_id)?,
    })
}

pub(crate) fn get_head(
    conn: &Connection,
    package: &str,
    channel: &str,
) -> Result<Option<StoredBundle>> {
    let sql = format!(
        "SELECT {} FROM bundle WHERE id = (
            SELECT head_bundle_id FROM channel WHERE package_name = ?1 AND name = ?2
         ) AND pruned = 0",
        BUNDLE_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![package, channel], BundleRow::from_row)
        .optional()?;
    row.map(|r| stored(conn, r)).transpose()
}

pub(crate) fn list_bundles(
    conn: &Connection,
    package: &str,
    include_pruned: bool,
) -> Result<Vec<StoredBundle>> {
    let sql = format!(
        "SELECT {} FROM bundle WHERE package_name = ?1 AND (pruned = 0 OR ?2) ORDER BY id",
        BUNDLE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![package, include_pruned], BundleRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(|r| stored(conn, r)).collect()
}

pub(crate) fn load_package(conn: &Connection, package: &str) -> Result<Option<PackageGraph>> {
    let default: Option<Option<String>> = conn
        .query_row(
            "SELECT default_channel FROM package WHERE name = ?1",
            params![package],
            |row| row.get(0),
        )
        .optional()?;
    let Some(default_channel) = default else {
        return Ok(None);
    };

    let mut graph = PackageGraph::new(package);
    graph.default_channel = default_channel;

    // Arena order follows row order, so ids are stable across loads.
    let sql = format!(
        "SELECT {} FROM bundle WHERE package_name = ?1 ORDER BY id",
        BUNDLE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![package], BundleRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut by_row: HashMap<i64, BundleId> = HashMap::with_capacity(rows.len());
    for row in rows {
        let (row_id, _, node) = row.decode()?;
        by_row.insert(row_id, graph.add_bundle(node));
    }
    let lookup = |row_id: i64| {
        by_row.get(&row_id).copied().ok_or_else(|| {
            CatalogError::Integrity(format!(
                "package {} references bundle row {} it does not own",
                package, row_id
            ))
        })
    };

    let mut stmt = conn.prepare(
        "SELECT id, name, head_bundle_id FROM channel WHERE package_name = ?1 ORDER BY name",
    )?;
    let channels = stmt
        .query_map(params![package], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (channel_id, name, head) in channels {
        let mut ch = ChannelGraph::new(&name);
        ch.head = head.map(lookup).transpose()?;

        let mut stmt = conn.prepare(
            "SELECT bundle_id, replaces_bundle_id FROM channel_entry WHERE channel_id = ?1",
        )?;
        let entries = stmt
            .query_map(params![channel_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (bundle, replaces) in entries {
            let id = lookup(bundle)?;
            ch.members.insert(id);
            if let Some(target) = replaces {
                ch.replaces.insert(id, lookup(target)?);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT bundle_id, skipped_bundle_id FROM skip_edge WHERE channel_id = ?1",
        )?;
        let skips = stmt
            .query_map(params![channel_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (from, to) in skips {
            ch.skips.insert((lookup(from)?, lookup(to)?));
        }

        graph.channels.insert(name, ch);
    }

    Ok(Some(graph))
}
