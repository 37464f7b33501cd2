//! # Entity and extension metadata cache
//!
//! A two-tier cache for opaque metadata blobs fetched from the service:
//!
//! - Hot tier: an in-process cache capped by entry count.
//! - Cold tier: a persistent SQLite store holding entities by URI plus
//!   `(uri, extension kind)` blobs with an etag and a TTL.
//!
//! Expired extensions are only reachable through the etag accessor, which
//! feeds conditional HTTP requests. A janitor purges expired rows
//! periodically, and `invalidate` removes a URI from both tiers including
//! all of its extensions.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Tunables for the metadata cache.
#[derive(Debug, Clone)]
pub struct EntityCacheConfig {
    /// Maximum number of entities kept in the hot tier.
    pub hot_capacity: u64,
    /// Period of the expired-extension janitor.
    pub cleanup_interval: Duration,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 512,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// One cached entity blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityEntry {
    pub uri: String,
    pub kind: String,
    pub data: Bytes,
    pub etag: Option<String>,
    pub fetched_at: i64,
}

/// One cached extension blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    pub data: Bytes,
    pub etag: Option<String>,
    pub expires_at: i64,
}

/// Tiered URI → entity / extension cache.
pub struct EntityCache {
    hot: moka::sync::Cache<String, Arc<EntityEntry>>,
    db: Mutex<Connection>,
}

impl EntityCache {
    pub fn open(path: &Path, config: &EntityCacheConfig) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                uri TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                etag TEXT,
                fetched_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS extensions (
                uri TEXT NOT NULL,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                etag TEXT,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (uri, kind)
            )",
            [],
        )?;

        Ok(Self {
            hot: moka::sync::Cache::new(config.hot_capacity),
            db: Mutex::new(conn),
        })
    }

    /// Looks a URI up, promoting cold hits into the hot tier.
    pub fn get(&self, uri: &str) -> Option<Arc<EntityEntry>> {
        if let Some(entry) = self.hot.get(uri) {
            return Some(entry);
        }

        let cold = {
            let db = self.db.lock().unwrap();
            db.query_row(
                "SELECT kind, data, etag, fetched_at FROM entities WHERE uri = ?1",
                params![uri],
                |row| {
                    Ok(EntityEntry {
                        uri: uri.to_string(),
                        kind: row.get(0)?,
                        data: Bytes::from(row.get::<_, Vec<u8>>(1)?),
                        etag: row.get(2)?,
                        fetched_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .ok()
            .flatten()
        }?;

        let entry = Arc::new(cold);
        self.hot.insert(uri.to_string(), entry.clone());
        Some(entry)
    }

    /// Stores an entity in both tiers.
    pub fn put(&self, entry: EntityEntry) -> Result<(), CacheError> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT OR REPLACE INTO entities (uri, kind, data, etag, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.uri,
                    entry.kind,
                    entry.data.as_ref(),
                    entry.etag,
                    entry.fetched_at
                ],
            )?;
        }
        self.hot.insert(entry.uri.clone(), Arc::new(entry));
        Ok(())
    }

    /// Stores an extension blob with its etag and TTL.
    pub fn put_extension(
        &self,
        uri: &str,
        kind: &str,
        data: Bytes,
        etag: Option<String>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO extensions (uri, kind, data, etag, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uri, kind, data.as_ref(), etag, expires_at],
        )?;
        Ok(())
    }

    /// Returns a live (non-expired) extension.
    pub fn extension(&self, uri: &str, kind: &str) -> Option<ExtensionEntry> {
        let entry = self.extension_any_age(uri, kind)?;
        if entry.expires_at > Utc::now().timestamp_millis() {
            Some(entry)
        } else {
            None
        }
    }

    /// Returns an extension's etag even past expiry, for conditional
    /// revalidation requests.
    pub fn extension_etag(&self, uri: &str, kind: &str) -> Option<String> {
        self.extension_any_age(uri, kind)?.etag
    }

    fn extension_any_age(&self, uri: &str, kind: &str) -> Option<ExtensionEntry> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT data, etag, expires_at FROM extensions WHERE uri = ?1 AND kind = ?2",
            params![uri, kind],
            |row| {
                Ok(ExtensionEntry {
                    data: Bytes::from(row.get::<_, Vec<u8>>(0)?),
                    etag: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .ok()
        .flatten()
    }

    /// Drops a URI from both tiers, including all its extensions.
    pub fn invalidate(&self, uri: &str) -> Result<(), CacheError> {
        self.hot.invalidate(uri);
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM entities WHERE uri = ?1", params![uri])?;
        db.execute("DELETE FROM extensions WHERE uri = ?1", params![uri])?;
        Ok(())
    }

    /// Deletes expired extension rows; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM extensions WHERE expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(removed)
    }

    /// Spawns the periodic janitor for expired extensions.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        config: &EntityCacheConfig,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let interval = config.cleanup_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                match cache.purge_expired() {
                    Ok(0) => {}
                    Ok(n) => debug!(purged = n, "expired metadata extensions removed"),
                    Err(e) => warn!("metadata janitor failed: {e}"),
                }
            }
        })
    }
}
