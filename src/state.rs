//! Persisted ingestion state.
//!
//! One JSON document holds the per-channel checkpoints plus run
//! bookkeeping. Writes go to a temp file first and are renamed into place,
//! so a crash mid-write never corrupts the previous checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{ChannelCheckpoint, IngestionState};

pub struct StateStore {
    path: PathBuf,
    state: Mutex<IngestionState>,
}

impl StateStore {
    /// Load state from disk; a missing file starts fresh.
    pub fn load(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
            serde_json::from_str(&content)
                .map_err(|e| Error::PersistenceWrite(format!("corrupt state file: {}", e)))?
        } else {
            IngestionState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// A point-in-time copy for readers (the stats tool, run setup).
    pub async fn snapshot(&self) -> IngestionState {
        self.state.lock().await.clone()
    }

    /// Begin a run: bump the run id, persist, and return it.
    pub async fn begin_run(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.run_id += 1;
        let run_id = state.run_id;
        Self::persist(&self.path, &state)?;
        Ok(run_id)
    }

    /// Advance one channel's checkpoint. The checkpoint only moves forward;
    /// a lower timestamp than the recorded one is ignored.
    pub async fn advance_channel(
        &self,
        channel_id: &str,
        last_ingested_ts: &str,
        newly_ingested: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelCheckpoint {
                last_ingested_ts: String::new(),
                last_success_at: chrono::Utc::now(),
                message_count: 0,
            });

        if ts_newer(last_ingested_ts, &entry.last_ingested_ts) {
            entry.last_ingested_ts = last_ingested_ts.to_string();
        }
        entry.last_success_at = chrono::Utc::now();
        entry.message_count += newly_ingested;

        Self::persist(&self.path, &state)?;
        debug!(channel = %channel_id, checkpoint = %last_ingested_ts, "Checkpoint advanced");
        Ok(())
    }

    /// Mark the first full run complete.
    pub async fn mark_first_run_complete(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.first_run_completed {
            state.first_run_completed = true;
            Self::persist(&self.path, &state)?;
        }
        Ok(())
    }

    fn persist(path: &Path, state: &IngestionState) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        fs::write(&tmp, content).map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| Error::PersistenceWrite(e.to_string()))?;
        Ok(())
    }
}

/// Compare two platform timestamps numerically; empty is older than
/// everything.
fn ts_newer(candidate: &str, current: &str) -> bool {
    if current.is_empty() {
        return true;
    }
    let candidate_val = candidate.parse::<f64>().unwrap_or(0.0);
    let current_val = current.parse::<f64>().unwrap_or(0.0);
    candidate_val > current_val
}
