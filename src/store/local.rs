//! File-backed fallback vector store.
//!
//! Keeps every vector in memory and journals each upsert as one NDJSON
//! line, so a restart replays the journal and recovers the full index.
//! Later journal lines win, which makes replay idempotent. A periodic
//! compaction rewrites the journal from the in-memory map (temp file +
//! rename) so deletes and overwrites do not grow the file without bound.
//!
//! Queries are a brute-force cosine scan, which is adequate for the
//! workspace sizes this fallback serves.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::VectorRecord;

use super::{Filter, ScoredHit, StoreStats, VectorStore};

/// Appended records that trigger a compaction rewrite.
const COMPACT_EVERY_APPENDS: usize = 512;

/// Elapsed time that triggers a compaction rewrite.
const COMPACT_EVERY: std::time::Duration = std::time::Duration::from_secs(30);

struct Inner {
    map: HashMap<String, VectorRecord>,
    journal: fs::File,
    appends_since_compact: usize,
    last_compact: Instant,
    last_upsert_at: Option<DateTime<Utc>>,
}

pub struct LocalStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl LocalStore {
    /// Open the store, replaying an existing journal if present.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        }

        let mut map = HashMap::new();
        if path.exists() {
            let file = fs::File::open(path).map_err(|e| Error::PersistenceWrite(e.to_string()))?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| Error::PersistenceWrite(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<VectorRecord>(&line) {
                    Ok(record) => {
                        map.insert(record.id.clone(), record);
                    }
                    Err(e) => {
                        // A truncated tail line from an interrupted write is
                        // recoverable; skip it rather than refusing to start.
                        warn!(line = line_no + 1, error = %e, "Skipping unreadable journal line");
                    }
                }
            }
            debug!(vectors = map.len(), path = %path.display(), "Loaded local vector journal");
        }

        let journal = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::PersistenceWrite(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                map,
                journal,
                appends_since_compact: 0,
                last_compact: Instant::now(),
                last_upsert_at: None,
            }),
        })
    }

    /// Rewrite the journal from the in-memory map, atomically.
    fn compact(path: &Path, inner: &mut Inner) -> Result<()> {
        let tmp_path = path.with_extension("ndjson.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)
                .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
            for record in inner.map.values() {
                let line = serde_json::to_string(record)
                    .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
                writeln!(tmp, "{}", line).map_err(|e| Error::PersistenceWrite(e.to_string()))?;
            }
            tmp.sync_all()
                .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| Error::PersistenceWrite(e.to_string()))?;

        inner.journal = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        inner.appends_since_compact = 0;
        inner.last_compact = Instant::now();
        debug!(vectors = inner.map.len(), "Compacted local vector journal");
        Ok(())
    }

    fn maybe_compact(path: &Path, inner: &mut Inner) -> Result<()> {
        if inner.appends_since_compact >= COMPACT_EVERY_APPENDS
            || inner.last_compact.elapsed() >= COMPACT_EVERY
        {
            Self::compact(path, inner)?;
        }
        Ok(())
    }

    /// Force a compaction rewrite. Used on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::compact(&self.path, &mut inner)
    }
}

#[async_trait]
impl VectorStore for LocalStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;

        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
            writeln!(inner.journal, "{}", line)
                .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
            inner.map.insert(record.id.clone(), record.clone());
            inner.appends_since_compact += 1;
        }
        inner
            .journal
            .flush()
            .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        inner.last_upsert_at = Some(Utc::now());

        Self::maybe_compact(&self.path, &mut inner)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredHit>> {
        let inner = self.inner.lock().await;

        let mut hits: Vec<ScoredHit> = inner
            .map
            .values()
            .filter(|record| filter.matches(&record.metadata))
            .map(|record| ScoredHit {
                id: record.id.clone(),
                score: cosine_similarity(vector, &record.values),
                metadata: record.metadata.clone(),
            })
            .collect();

        super::rank(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.lock().await;
        let mut channels: Vec<String> = inner
            .map
            .values()
            .map(|record| record.metadata.channel_id.clone())
            .collect();
        channels.sort();
        channels.dedup();

        Ok(StoreStats {
            total_vectors: inner.map.len() as u64,
            channels,
            last_upsert_at: inner.last_upsert_at,
        })
    }

    async fn delete_by_channel(&self, channel_id: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.map.len();
        inner
            .map
            .retain(|_, record| record.metadata.channel_id != channel_id);
        let removed = (before - inner.map.len()) as u64;

        if removed > 0 {
            Self::compact(&self.path, &mut inner)?;
        }
        Ok(removed)
    }
}

/// Cosine similarity; `0.0` for mismatched lengths or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
