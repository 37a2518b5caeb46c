//! Embedding provider client.
//!
//! Calls the provider's `POST /embeddings` endpoint with batching, retry,
//! and backoff. Every call is admitted through the rate governor's
//! embedding bucket first.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) → record the server's `Retry-After` hint with
//!   the governor and retry.
//! - HTTP 5xx and network errors → retry with exponential backoff.
//! - HTTP 4xx (not 429) → fail immediately as an invalid-response error.
//! - A returned vector whose dimension is not 1536 fails the whole batch;
//!   the ingestion run treats this as fatal.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Provider, Result};
use crate::governor::RateGovernor;
use crate::models::EMBEDDING_DIMENSIONS;

/// Maximum number of texts sent to the provider in one request.
pub const EMBED_BATCH_MAX: usize = 100;

const MAX_RETRIES: u32 = 3;

pub struct EmbeddingClient {
    client: reqwest::Client,
    governor: Arc<RateGovernor>,
    base_url: String,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(config: &Config, governor: Arc<RateGovernor>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            client,
            governor,
            base_url: config.embed_api_base.clone(),
            api_key: config.embed_api_key.clone(),
            model: config.embed_model.clone(),
        })
    }

    /// Embed a single text. Fast path for search queries.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| Error::UpstreamInvalid {
            provider: Provider::Embedding,
            detail: "empty embedding response".to_string(),
        })
    }

    /// Embed a batch of texts, preserving input order.
    ///
    /// Batches larger than [`EMBED_BATCH_MAX`] are split into sequential
    /// upstream calls.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_MAX) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": EMBEDDING_DIMENSIONS,
        });

        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            self.governor.acquire(Provider::Embedding, "embeddings").await;

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await.map_err(|e| {
                            Error::from_reqwest(Provider::Embedding, e)
                        })?;
                        return parse_embeddings(&json, texts.len());
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(Error::AuthUpstream {
                            provider: Provider::Embedding,
                            detail: format!("HTTP {}", status),
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let retry_after = parse_retry_after(response.headers())
                            .unwrap_or_else(|| backoff_delay(attempt + 1));
                        if status.as_u16() == 429 {
                            self.governor
                                .note_retry_after(Provider::Embedding, "embeddings", retry_after);
                        }
                        warn!(status = %status, attempt, "Embedding provider throttled, retrying");
                        last_err = Some(Error::UpstreamThrottled {
                            provider: Provider::Embedding,
                            retry_after: Some(retry_after),
                        });
                        continue;
                    }

                    let detail = response.text().await.unwrap_or_default();
                    return Err(Error::UpstreamInvalid {
                        provider: Provider::Embedding,
                        detail: format!("HTTP {}: {}", status, detail),
                    });
                }
                Err(e) => {
                    last_err = Some(Error::from_reqwest(Provider::Embedding, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(Error::UpstreamThrottled {
            provider: Provider::Embedding,
            retry_after: None,
        }))
    }
}

/// Exponential backoff: 1s, 2s, 4s, capped at 32s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// Read a `Retry-After` seconds header when the server sent one.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parse the provider response: `data[].embedding` ordered by `data[].index`.
fn parse_embeddings(json: &Value, expected_count: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::UpstreamInvalid {
            provider: Provider::Embedding,
            detail: "missing data array".to_string(),
        })?;

    if data.len() != expected_count {
        return Err(Error::UpstreamInvalid {
            provider: Provider::Embedding,
            detail: format!("expected {} embeddings, got {}", expected_count, data.len()),
        });
    }

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::UpstreamInvalid {
                provider: Provider::Embedding,
                detail: "missing embedding field".to_string(),
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vec.len() != EMBEDDING_DIMENSIONS {
            return Err(Error::DimensionMismatch {
                expected: EMBEDDING_DIMENSIONS,
                got: vec.len(),
            });
        }

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(dims: usize, count: usize) -> Value {
        let data: Vec<Value> = (0..count)
            .map(|i| {
                serde_json::json!({
                    "index": i,
                    "embedding": vec![0.1f32; dims],
                })
            })
            .collect();
        serde_json::json!({ "data": data })
    }

    #[test]
    fn test_parse_valid_response() {
        let json = response_with(EMBEDDING_DIMENSIONS, 3);
        let vectors = parse_embeddings(&json, 3).unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0].len(), EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn test_parse_preserves_input_order() {
        // Provider may return entries out of order; `index` restores it.
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": vec![2.0f32; EMBEDDING_DIMENSIONS] },
                { "index": 0, "embedding": vec![1.0f32; EMBEDDING_DIMENSIONS] },
            ]
        });
        let vectors = parse_embeddings(&json, 2).unwrap();
        assert_eq!(vectors[0][0], 1.0);
        assert_eq!(vectors[1][0], 2.0);
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let json = response_with(768, 1);
        let err = parse_embeddings(&json, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 1536,
                got: 768
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_data_rejected() {
        let err = parse_embeddings(&serde_json::json!({}), 1).unwrap_err();
        assert!(matches!(err, Error::UpstreamInvalid { .. }));
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let json = response_with(EMBEDDING_DIMENSIONS, 2);
        assert!(parse_embeddings(&json, 3).is_err());
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "17".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(17)));
        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(32));
    }
}
