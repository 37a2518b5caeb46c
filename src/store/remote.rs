//! Remote serverless vector index backend.
//!
//! Speaks the index provider's REST data plane: `/vectors/upsert`,
//! `/query`, `/describe_index_stats`, and `/vectors/delete`. On startup the
//! index is created through the control plane if it does not already exist
//! (cosine metric, 1536 dimensions).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Provider, Result};
use crate::models::{VectorMetadata, VectorRecord, EMBEDDING_DIMENSIONS};

use super::{Filter, ScoredHit, StoreStats, VectorStore, UPSERT_BATCH_MAX};

const CONTROL_PLANE_BASE: &str = "https://api.pinecone.io";

/// How many vectors a stats sample query inspects for the channel list.
const CHANNEL_SAMPLE_K: usize = 100;

pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    /// Channels observed by this process, merged with sampled index
    /// contents when reporting stats.
    seen_channels: Mutex<BTreeSet<String>>,
    last_upsert_at: Mutex<Option<DateTime<Utc>>>,
}

impl RemoteStore {
    /// Connect to the configured index, creating it when absent.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        let store = Self {
            client,
            base_url: config
                .vector_api_base
                .clone()
                .ok_or_else(|| Error::Config("VECTOR_API_BASE is required".to_string()))?,
            api_key: config
                .vector_api_key
                .clone()
                .ok_or_else(|| Error::Config("VECTOR_API_KEY is required".to_string()))?,
            seen_channels: Mutex::new(BTreeSet::new()),
            last_upsert_at: Mutex::new(None),
        };

        store.ensure_index(&config.vector_index_name).await?;
        Ok(store)
    }

    async fn ensure_index(&self, name: &str) -> Result<()> {
        let url = format!("{}/indexes/{}", CONTROL_PLANE_BASE, name);
        let resp = self
            .client
            .get(&url)
            .header("Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(Provider::Vector, e))?;

        match resp.status().as_u16() {
            200 => Ok(()),
            404 => {
                info!(index = name, "Vector index not found, creating");
                let body = json!({
                    "name": name,
                    "dimension": EMBEDDING_DIMENSIONS,
                    "metric": "cosine",
                    "spec": { "serverless": { "cloud": "aws", "region": "us-east-1" } },
                });
                let resp = self
                    .client
                    .post(format!("{}/indexes", CONTROL_PLANE_BASE))
                    .header("Api-Key", &self.api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| Error::from_reqwest(Provider::Vector, e))?;
                // 409 means someone else created it first, which is fine.
                if resp.status().is_success() || resp.status().as_u16() == 409 {
                    Ok(())
                } else {
                    Err(self.classify_status(resp).await)
                }
            }
            401 | 403 => Err(Error::AuthUpstream {
                provider: Provider::Vector,
                detail: format!("HTTP {}", resp.status()),
            }),
            _ => Err(self.classify_status(resp).await),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(Provider::Vector, e))?;

        if resp.status().is_success() {
            return resp
                .json()
                .await
                .map_err(|e| Error::from_reqwest(Provider::Vector, e));
        }
        Err(self.classify_status(resp).await)
    }

    async fn classify_status(&self, resp: reqwest::Response) -> Error {
        let status = resp.status();
        let detail = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Error::AuthUpstream {
                provider: Provider::Vector,
                detail: format!("HTTP {}", status),
            },
            429 => Error::UpstreamThrottled {
                provider: Provider::Vector,
                retry_after: None,
            },
            _ => Error::UpstreamInvalid {
                provider: Provider::Vector,
                detail: format!("HTTP {}: {}", status, detail),
            },
        }
    }

    async fn upsert_batch(&self, batch: &[VectorRecord]) -> Result<()> {
        let vectors: Vec<Value> = batch
            .iter()
            .map(|record| {
                json!({
                    "id": record.id,
                    "values": record.values,
                    "metadata": record.metadata,
                })
            })
            .collect();
        self.post("/vectors/upsert", &json!({ "vectors": vectors }))
            .await?;
        Ok(())
    }
}

/// Translate a [`Filter`] into the index provider's predicate JSON.
fn filter_json(filter: &Filter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let mut clauses = serde_json::Map::new();
    if let Some(ref channel) = filter.channel_id {
        clauses.insert("channel_id".to_string(), json!({ "$eq": channel }));
    }
    if let Some(ref user) = filter.user_id {
        clauses.insert("user_id".to_string(), json!({ "$eq": user }));
    }
    if let Some(ref user) = filter.user_name {
        clauses.insert("user_name".to_string(), json!({ "$eq": user }));
    }
    if let Some(kind) = filter.kind {
        clauses.insert("kind".to_string(), json!({ "$eq": kind.as_str() }));
    }
    if filter.ts_from.is_some() || filter.ts_to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(from) = filter.ts_from {
            range.insert("$gte".to_string(), json!(from as f64));
        }
        if let Some(to) = filter.ts_to {
            // Inclusive of the whole final second; platform timestamps carry
            // a sequence suffix after the decimal point.
            range.insert("$lt".to_string(), json!((to + 1) as f64));
        }
        clauses.insert("ts_secs".to_string(), Value::Object(range));
    }
    Some(Value::Object(clauses))
}

#[async_trait]
impl VectorStore for RemoteStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        for batch in records.chunks(UPSERT_BATCH_MAX) {
            if let Err(first_err) = self.upsert_batch(batch).await {
                warn!(error = %first_err, batch = batch.len(), "Upsert sub-batch failed, retrying once");
                if let Err(err) = self.upsert_batch(batch).await {
                    let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
                    warn!(failing_ids = ?ids, "Upsert sub-batch failed after retry");
                    return Err(err);
                }
            }
        }

        let mut seen = self.seen_channels.lock().await;
        for record in records {
            seen.insert(record.metadata.channel_id.clone());
        }
        *self.last_upsert_at.lock().await = Some(Utc::now());
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredHit>> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(predicate) = filter_json(filter) {
            body["filter"] = predicate;
        }

        let response = self.post("/query", &body).await?;
        let matches = response
            .get("matches")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::UpstreamInvalid {
                provider: Provider::Vector,
                detail: "missing matches array".to_string(),
            })?;

        let mut hits = Vec::with_capacity(matches.len());
        for item in matches {
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let score = item.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
            let metadata: VectorMetadata = item
                .get("metadata")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| Error::UpstreamInvalid {
                    provider: Provider::Vector,
                    detail: format!("bad metadata: {}", e),
                })?
                .ok_or_else(|| Error::UpstreamInvalid {
                    provider: Provider::Vector,
                    detail: "missing metadata".to_string(),
                })?;
            hits.push(ScoredHit { id, score, metadata });
        }

        super::rank(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let response = self.post("/describe_index_stats", &json!({})).await?;
        let total_vectors = response
            .get("totalVectorCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        // The index exposes no channel listing; sample the space and merge
        // with channels this process has upserted.
        let mut channels = self.seen_channels.lock().await.clone();
        if total_vectors > 0 {
            let mut probe = vec![0.0f32; EMBEDDING_DIMENSIONS];
            probe[0] = 1.0;
            if let Ok(sample) = self
                .query(&probe, CHANNEL_SAMPLE_K, &Filter::default())
                .await
            {
                for hit in sample {
                    channels.insert(hit.metadata.channel_id);
                }
            }
        }

        Ok(StoreStats {
            total_vectors,
            channels: channels.into_iter().collect(),
            last_upsert_at: *self.last_upsert_at.lock().await,
        })
    }

    async fn delete_by_channel(&self, channel_id: &str) -> Result<u64> {
        self.post(
            "/vectors/delete",
            &json!({ "filter": { "channel_id": { "$eq": channel_id } } }),
        )
        .await?;
        self.seen_channels.lock().await.remove(channel_id);
        // The data plane does not report a deletion count.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_json_empty() {
        assert!(filter_json(&Filter::default()).is_none());
    }

    #[test]
    fn test_filter_json_equality_and_range() {
        let filter = Filter {
            channel_id: Some("C1".to_string()),
            ts_from: Some(100),
            ts_to: Some(200),
            ..Default::default()
        };
        let predicate = filter_json(&filter).unwrap();
        assert_eq!(predicate["channel_id"]["$eq"], "C1");
        assert_eq!(predicate["ts_secs"]["$gte"], 100.0);
        assert_eq!(predicate["ts_secs"]["$lt"], 201.0);
    }

    #[test]
    fn test_filter_json_kind() {
        let filter = Filter {
            kind: Some(crate::models::MessageKind::Canvas),
            ..Default::default()
        };
        let predicate = filter_json(&filter).unwrap();
        assert_eq!(predicate["kind"]["$eq"], "canvas");
    }
}
