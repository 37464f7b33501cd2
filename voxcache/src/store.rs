//! # On-disk audio chunk store
//!
//! Fixed-size chunks of each audio object are persisted under a per-file
//! directory, with a SQLite journal recording `{total_size, format,
//! chunk_size, owned_chunks, created_at, last_accessed_at}` per file id.
//!
//! Chunk writes go to a temp file and are renamed into place, so a crash
//! never leaves a partial chunk visible and rewriting the same chunk is
//! idempotent. A least-recently-used prune keeps total disk usage inside
//! the configured budget with a free headroom margin.

use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use voxid::FileId;

use crate::{
    error::CacheError,
    range_set::{RangeSet, SharedRangeSet},
};

/// Default chunk size (128 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024;

/// Store tunables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Upper bound for total on-disk usage.
    pub max_size_bytes: u64,
    /// Free headroom kept under the bound when pruning.
    pub min_free_percent: u8,
    /// Minimum time between automatic prune runs.
    pub prune_interval: Duration,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size_bytes: 1024 * 1024 * 1024,
            min_free_percent: 10,
            prune_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Journal row for one cached file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub file_id: FileId,
    pub total_size: u64,
    pub format: Option<String>,
    pub chunk_size: u64,
    pub owned_chunks: RangeSet,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

impl CacheEntry {
    /// Number of chunks the complete file occupies.
    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// True when every chunk is owned.
    pub fn is_complete(&self) -> bool {
        self.owned_chunks.contains_range(0, self.chunk_count())
    }
}

struct FileState {
    /// Serializes journal updates for this file.
    journal: Mutex<()>,
    /// Owned chunk indices, shared with concurrent readers.
    owned: SharedRangeSet,
}

/// Content-addressed chunk store with an LRU budget.
pub struct AudioFileStore {
    config: StoreConfig,
    db: Mutex<Connection>,
    files: Mutex<HashMap<FileId, Arc<FileState>>>,
    last_prune: Mutex<Instant>,
}

impl AudioFileStore {
    pub fn new(config: StoreConfig) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.root)?;
        let conn = Connection::open(config.root.join("journal.db"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audio_files (
                file_id TEXT PRIMARY KEY,
                total_size INTEGER NOT NULL,
                format TEXT,
                chunk_size INTEGER NOT NULL,
                owned_chunks TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            config,
            db: Mutex::new(conn),
            files: Mutex::new(HashMap::new()),
            last_prune: Mutex::new(
                Instant::now()
                    .checked_sub(Duration::from_secs(3600))
                    .unwrap_or_else(Instant::now),
            ),
        })
    }

    fn file_dir(&self, file_id: &FileId) -> PathBuf {
        self.config.root.join(file_id.to_base16())
    }

    fn chunk_path(&self, file_id: &FileId, index: u32) -> PathBuf {
        self.file_dir(file_id).join(format!("{index:08}.chunk"))
    }

    fn state_for(&self, file_id: &FileId) -> Arc<FileState> {
        let mut files = self.files.lock().unwrap();
        files
            .entry(*file_id)
            .or_insert_with(|| {
                Arc::new(FileState {
                    journal: Mutex::new(()),
                    owned: SharedRangeSet::new(),
                })
            })
            .clone()
    }

    /// Creates the journal row for `file_id` if absent and returns the
    /// entry, adopting any chunks journaled by a previous run.
    pub fn open_entry(
        &self,
        file_id: &FileId,
        total_size: u64,
        format: Option<&str>,
        chunk_size: u64,
    ) -> Result<CacheEntry, CacheError> {
        let now = Utc::now().timestamp_millis();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT OR IGNORE INTO audio_files
                 (file_id, total_size, format, chunk_size, owned_chunks, created_at, last_accessed_at)
                 VALUES (?1, ?2, ?3, ?4, '[]', ?5, ?5)",
                params![file_id.to_base16(), total_size as i64, format, chunk_size as i64, now],
            )?;
        }
        fs::create_dir_all(self.file_dir(file_id))?;

        let entry = self
            .entry(file_id)?
            .ok_or(CacheError::UnknownFile(*file_id))?;
        self.state_for(file_id).owned.replace(entry.owned_chunks.clone());
        Ok(entry)
    }

    /// Reads the journal row for `file_id`.
    pub fn entry(&self, file_id: &FileId) -> Result<Option<CacheEntry>, CacheError> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT total_size, format, chunk_size, owned_chunks, created_at, last_accessed_at
                 FROM audio_files WHERE file_id = ?1",
                params![file_id.to_base16()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(total, format, chunk, owned, created, accessed)| CacheEntry {
            file_id: *file_id,
            total_size: total as u64,
            format,
            chunk_size: chunk as u64,
            owned_chunks: decode_ranges(&owned),
            created_at: created,
            last_accessed_at: accessed,
        }))
    }

    /// Writes one chunk atomically (temp file + rename). Rewriting a chunk
    /// already on disk is a no-op apart from the journal touch.
    pub fn write_chunk(&self, file_id: &FileId, index: u32, data: &[u8]) -> Result<(), CacheError> {
        let state = self.state_for(file_id);
        let path = self.chunk_path(file_id, index);

        let tmp = path.with_extension("part");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        {
            let _guard = state.journal.lock().unwrap();
            state.owned.add(index as u64, index as u64 + 1);
            let encoded = encode_ranges(&state.owned.snapshot());
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE audio_files SET owned_chunks = ?2, last_accessed_at = ?3 WHERE file_id = ?1",
                params![file_id.to_base16(), encoded, Utc::now().timestamp_millis()],
            )?;
        }

        self.prune_if_due();
        Ok(())
    }

    /// Owned chunk indices for `file_id`.
    pub fn owned_chunks(&self, file_id: &FileId) -> RangeSet {
        self.state_for(file_id).owned.snapshot()
    }

    /// Owned byte ranges for `file_id`, derived from the chunk set.
    pub fn owned_bytes(&self, file_id: &FileId) -> Result<RangeSet, CacheError> {
        let entry = self
            .entry(file_id)?
            .ok_or(CacheError::UnknownFile(*file_id))?;
        let mut bytes = RangeSet::new();
        for r in self.state_for(file_id).owned.to_vec() {
            let start = r.start * entry.chunk_size;
            let end = (r.end * entry.chunk_size).min(entry.total_size);
            bytes.add(start, end);
        }
        Ok(bytes)
    }

    /// Reads `len` bytes at `offset`, crossing chunk boundaries as needed.
    /// Every touched chunk must already be cached.
    pub fn read_range(
        &self,
        file_id: &FileId,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, CacheError> {
        let entry = self
            .entry(file_id)?
            .ok_or(CacheError::UnknownFile(*file_id))?;
        if offset + len > entry.total_size {
            return Err(CacheError::RangeOutOfBounds {
                offset,
                len,
                total: entry.total_size,
            });
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let index = (pos / entry.chunk_size) as u32;
            let within = pos % entry.chunk_size;
            let take = (entry.chunk_size - within).min(end - pos);

            let path = self.chunk_path(file_id, index);
            let mut file = fs::File::open(&path).map_err(|_| CacheError::MissingChunk {
                file_id: *file_id,
                index,
            })?;
            let mut chunk = Vec::new();
            file.read_to_end(&mut chunk)?;
            if (within + take) as usize > chunk.len() {
                return Err(CacheError::MissingChunk {
                    file_id: *file_id,
                    index,
                });
            }
            out.extend_from_slice(&chunk[within as usize..(within + take) as usize]);
            pos += take;
        }

        Ok(out)
    }

    /// Bumps the last-access timestamp.
    pub fn touch(&self, file_id: &FileId) {
        let db = self.db.lock().unwrap();
        let _ = db.execute(
            "UPDATE audio_files SET last_accessed_at = ?2 WHERE file_id = ?1",
            params![file_id.to_base16(), Utc::now().timestamp_millis()],
        );
    }

    /// Deletes a file's chunks and journal row.
    pub fn remove(&self, file_id: &FileId) -> Result<(), CacheError> {
        self.files.lock().unwrap().remove(file_id);
        let dir = self.file_dir(file_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM audio_files WHERE file_id = ?1",
            params![file_id.to_base16()],
        )?;
        Ok(())
    }

    /// Total bytes currently on disk across all cached files.
    pub fn disk_usage(&self) -> u64 {
        let ids = self.all_ids();
        ids.iter().map(|id| self.file_usage(id)).sum()
    }

    fn file_usage(&self, file_id: &FileId) -> u64 {
        let dir = self.file_dir(file_id);
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    fn all_ids(&self) -> Vec<FileId> {
        let db = self.db.lock().unwrap();
        let mut stmt = match db.prepare(
            "SELECT file_id FROM audio_files ORDER BY last_accessed_at ASC",
        ) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        stmt.query_map([], |row| row.get::<_, String>(0))
            .map(|rows| {
                rows.flatten()
                    .filter_map(|s| FileId::from_base16(&s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Runs a prune if the prune interval has elapsed.
    pub fn prune_if_due(&self) {
        {
            let mut last = self.last_prune.lock().unwrap();
            if last.elapsed() < self.config.prune_interval {
                return;
            }
            *last = Instant::now();
        }
        if let Err(e) = self.ensure_free_space() {
            warn!("cache prune failed: {e}");
        }
    }

    /// Evicts least-recently-used files until usage fits the budget minus
    /// the free headroom.
    pub fn ensure_free_space(&self) -> Result<(), CacheError> {
        let headroom = self.config.max_size_bytes / 100 * self.config.min_free_percent as u64;
        let budget = self.config.max_size_bytes.saturating_sub(headroom);

        let mut usage = self.disk_usage();
        if usage <= budget {
            return Ok(());
        }
        info!(usage, budget, "audio cache over budget, evicting");

        for file_id in self.all_ids() {
            if usage <= budget {
                break;
            }
            let freed = self.file_usage(&file_id);
            debug!(file = %file_id, freed, "evicting cached audio file");
            self.remove(&file_id)?;
            usage = usage.saturating_sub(freed);
        }
        Ok(())
    }
}

fn encode_ranges(set: &RangeSet) -> String {
    let pairs: Vec<(u64, u64)> = set.to_vec().iter().map(|r| (r.start, r.end)).collect();
    serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_string())
}

fn decode_ranges(encoded: &str) -> RangeSet {
    let mut set = RangeSet::new();
    if let Ok(pairs) = serde_json::from_str::<Vec<(u64, u64)>>(encoded) {
        for (start, end) in pairs {
            set.add(start, end);
        }
    }
    set
}
