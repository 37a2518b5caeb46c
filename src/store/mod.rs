//! Vector store abstraction.
//!
//! A single interface over two backends selected at startup by
//! configuration:
//!
//! - **[`remote::RemoteStore`]** — a serverless remote vector index
//!   (cosine similarity, 1536 dimensions), used when `VECTOR_API_KEY` is
//!   configured. The index is created on startup if it does not exist.
//! - **[`local::LocalStore`]** — an append-only NDJSON journal plus an
//!   in-memory map with brute-force cosine scan, used otherwise.
//!
//! Both backends guarantee read-your-writes after `upsert` returns, and
//! both are idempotent by vector id. Query results are ranked by score
//! descending with ties broken by message timestamp descending.

pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Result;
use crate::models::{MessageKind, VectorMetadata, VectorRecord};

/// Vectors sent to the backend in one upsert call.
pub const UPSERT_BATCH_MAX: usize = 100;

/// Conjunction of equality and range predicates over vector metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    /// Matches the display name recorded in metadata; used when a user
    /// filter cannot be resolved to an id.
    pub user_name: Option<String>,
    pub kind: Option<MessageKind>,
    /// Inclusive lower bound on the message timestamp, Unix seconds.
    pub ts_from: Option<i64>,
    /// Inclusive upper bound on the message timestamp, Unix seconds.
    pub ts_to: Option<i64>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        *self == Filter::default()
    }

    /// Whether `metadata` satisfies every predicate in the filter.
    pub fn matches(&self, metadata: &VectorMetadata) -> bool {
        if let Some(ref channel) = self.channel_id {
            if &metadata.channel_id != channel {
                return false;
            }
        }
        if let Some(ref user) = self.user_id {
            if &metadata.user_id != user {
                return false;
            }
        }
        if let Some(ref user) = self.user_name {
            if !metadata.user_name.eq_ignore_ascii_case(user) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if metadata.kind != kind {
                return false;
            }
        }
        if let Some(from) = self.ts_from {
            if metadata.ts_secs < from as f64 {
                return false;
            }
        }
        if let Some(to) = self.ts_to {
            if metadata.ts_secs > (to as f64) + 1.0 - f64::EPSILON {
                return false;
            }
        }
        true
    }
}

/// One ranked hit from a vector query.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Aggregate index statistics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_vectors: u64,
    pub channels: Vec<String>,
    pub last_upsert_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace vectors by id. Idempotent; batch size is capped
    /// at [`UPSERT_BATCH_MAX`] per upstream call.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Return up to `top_k` hits most similar to `vector`, restricted by
    /// `filter`, ranked by score descending then `ts` descending.
    async fn query(&self, vector: &[f32], top_k: usize, filter: &Filter)
        -> Result<Vec<ScoredHit>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Remove every vector belonging to a channel. Used when an operator
    /// prunes a channel that became unreachable.
    async fn delete_by_channel(&self, channel_id: &str) -> Result<u64>;
}

/// Build the vector store selected by configuration.
pub async fn open(config: &Config) -> Result<Arc<dyn VectorStore>> {
    if config.remote_vector_enabled() {
        let store = remote::RemoteStore::connect(config).await?;
        Ok(Arc::new(store))
    } else {
        tracing::info!(path = %config.vector_local_path.display(), "No remote vector index configured, using local fallback");
        let store = local::LocalStore::open(&config.vector_local_path)?;
        Ok(Arc::new(store))
    }
}

/// Order hits by score descending, breaking ties by timestamp descending.
pub(crate) fn rank(hits: &mut [ScoredHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.metadata
                    .ts_secs
                    .partial_cmp(&a.metadata.ts_secs)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.metadata.ts.cmp(&a.metadata.ts))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn metadata(channel: &str, user: &str, ts_secs: f64) -> VectorMetadata {
        VectorMetadata {
            channel_id: channel.to_string(),
            channel_name: format!("#{}", channel),
            user_id: user.to_string(),
            user_name: user.to_lowercase(),
            ts: format!("{:.6}", ts_secs),
            ts_secs,
            iso_date: "2024-03-15".to_string(),
            thread_root_ts: None,
            kind: MessageKind::Message,
            has_reactions: false,
            chunk_index: 0,
            chunk_total: 1,
            text_excerpt: "excerpt".to_string(),
        }
    }

    #[test]
    fn test_filter_equality() {
        let meta = metadata("C1", "U1", 100.0);
        let mut filter = Filter::default();
        assert!(filter.matches(&meta));

        filter.channel_id = Some("C1".into());
        assert!(filter.matches(&meta));
        filter.channel_id = Some("C2".into());
        assert!(!filter.matches(&meta));
    }

    #[test]
    fn test_filter_range_inclusive() {
        let meta = metadata("C1", "U1", 100.0);
        let filter = Filter {
            ts_from: Some(100),
            ts_to: Some(100),
            ..Default::default()
        };
        assert!(filter.matches(&meta), "endpoints are inclusive");

        let below = Filter {
            ts_from: Some(101),
            ..Default::default()
        };
        assert!(!below.matches(&meta));
    }

    #[test]
    fn test_rank_score_then_ts() {
        let mut hits = vec![
            ScoredHit {
                id: "a".into(),
                score: 0.5,
                metadata: metadata("C1", "U1", 100.0),
            },
            ScoredHit {
                id: "b".into(),
                score: 0.9,
                metadata: metadata("C1", "U1", 50.0),
            },
            ScoredHit {
                id: "c".into(),
                score: 0.5,
                metadata: metadata("C1", "U1", 200.0),
            },
        ];
        rank(&mut hits);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }
}
