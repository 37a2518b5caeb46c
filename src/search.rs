//! Search over the vector index.
//!
//! One public operation: enhance the raw query (unless skipped), embed it,
//! translate the structured filters into index predicates, query the
//! vector store, and assemble ranked results. Full responses are cached
//! for five minutes keyed by a fingerprint of the enhanced query, the
//! result count, and the canonical filter set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chat::ChatClient;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::enhancer::{clamp_top_k, QueryEnhancer, DEFAULT_TOP_K};
use crate::error::Result;
use crate::models::{Channel, EnhancedQuery, SearchHit, SearchResponse};
use crate::state::StateStore;
use crate::store::{Filter, VectorStore};

const CACHE_TTL: Duration = Duration::from_secs(300);

/// Caller-supplied settings that take precedence over enhancement output.
#[derive(Debug, Clone, Default)]
pub struct SearchOverrides {
    pub skip_enhancement: bool,
    pub top_k: Option<usize>,
    pub channel_filter: Option<String>,
    pub user_filter: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

/// Aggregate index statistics exposed by the `stats` tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsReport {
    pub total_vectors: u64,
    pub channels_indexed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ingested_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct SearchService {
    config: Arc<Config>,
    chat: Arc<ChatClient>,
    embedder: Arc<EmbeddingClient>,
    enhancer: Arc<QueryEnhancer>,
    store: Arc<dyn VectorStore>,
    state: Arc<StateStore>,
    response_cache: Mutex<HashMap<String, (Instant, SearchResponse)>>,
    stats_cache: Mutex<Option<(Instant, StatsReport)>>,
}

impl SearchService {
    pub fn new(
        config: Arc<Config>,
        chat: Arc<ChatClient>,
        embedder: Arc<EmbeddingClient>,
        enhancer: Arc<QueryEnhancer>,
        store: Arc<dyn VectorStore>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            config,
            chat,
            embedder,
            enhancer,
            store,
            state,
            response_cache: Mutex::new(HashMap::new()),
            stats_cache: Mutex::new(None),
        }
    }

    pub async fn search(
        &self,
        raw_query: &str,
        overrides: &SearchOverrides,
    ) -> Result<SearchResponse> {
        let mut enhanced = if overrides.skip_enhancement {
            EnhancedQuery::passthrough(raw_query, overrides.top_k.unwrap_or(DEFAULT_TOP_K))
        } else {
            self.enhancer.enhance(raw_query).await
        };
        apply_overrides(&mut enhanced, overrides);
        enhanced.top_k = clamp_top_k(enhanced.top_k);

        let (filter, channel_resolved) = self.translate_filters(&enhanced).await;
        if !channel_resolved {
            // A channel filter that names nothing we know about cannot
            // match; an empty result set, not an error.
            return Ok(SearchResponse {
                query: raw_query.to_string(),
                enhanced_query: Some(enhanced),
                total: 0,
                results: Vec::new(),
            });
        }

        let fingerprint = fingerprint(&enhanced.enhanced_text, enhanced.top_k, &filter);
        if let Some(cached) = self.cache_lookup(&fingerprint).await {
            debug!(query = %raw_query, "Serving search response from cache");
            return Ok(cached);
        }

        let vector = self.embedder.embed(&enhanced.enhanced_text).await?;
        let hits = self.store.query(&vector, enhanced.top_k, &filter).await?;

        let results: Vec<SearchHit> = hits
            .into_iter()
            .map(|hit| {
                let permalink = self.permalink(&hit.metadata.channel_id, &hit.metadata.ts);
                let ts_iso = chrono::DateTime::from_timestamp(hit.metadata.ts_secs as i64, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default();
                let reactions_summary = hit
                    .metadata
                    .text_excerpt
                    .lines()
                    .find_map(|line| line.strip_prefix("Reactions: "))
                    .map(str::to_string);
                SearchHit {
                    id: hit.id,
                    score: hit.score,
                    channel_name: hit.metadata.channel_name,
                    user_name: hit.metadata.user_name,
                    ts: hit.metadata.ts,
                    ts_iso,
                    text_excerpt: hit.metadata.text_excerpt,
                    thread_root_ts: hit.metadata.thread_root_ts,
                    reactions_summary,
                    permalink,
                }
            })
            .collect();

        let response = SearchResponse {
            query: raw_query.to_string(),
            enhanced_query: Some(enhanced),
            total: results.len(),
            results,
        };

        self.cache_store(fingerprint, response.clone()).await;
        Ok(response)
    }

    /// Whether the service can serve meaningful searches yet.
    ///
    /// True once a first ingestion run has completed, or when the index
    /// already holds vectors from a previous deployment. Until then the
    /// request server answers search calls with "service not ready"
    /// instead of silently returning nothing.
    pub async fn ready(&self) -> bool {
        if self.state.snapshot().await.first_run_completed {
            return true;
        }
        match self.store.stats().await {
            Ok(stats) => stats.total_vectors > 0,
            Err(_) => false,
        }
    }

    /// The channels this deployment is configured to index, with their
    /// cached names and membership.
    pub async fn list_channels(&self) -> Vec<Channel> {
        let mut channels = Vec::with_capacity(self.config.chat_channels.len());
        for channel_id in &self.config.chat_channels {
            match self.chat.channel(channel_id).await {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    warn!(channel = %channel_id, error = %e, "Channel lookup failed");
                    channels.push(Channel {
                        id: channel_id.clone(),
                        name: channel_id.clone(),
                        is_member: false,
                        canvas_file_id: None,
                    });
                }
            }
        }
        channels
    }

    pub async fn stats(&self) -> Result<StatsReport> {
        {
            let cached = self.stats_cache.lock().await;
            if let Some((at, ref report)) = *cached {
                if at.elapsed() < CACHE_TTL {
                    return Ok(report.clone());
                }
            }
        }

        let store_stats = self.store.stats().await?;
        let state = self.state.snapshot().await;
        let last_ingested_at = state
            .channels
            .values()
            .map(|cp| cp.last_success_at)
            .max();

        let report = StatsReport {
            total_vectors: store_stats.total_vectors,
            channels_indexed: store_stats.channels.len(),
            last_ingested_at,
        };

        *self.stats_cache.lock().await = Some((Instant::now(), report.clone()));
        Ok(report)
    }

    /// Translate enhanced-query filters into store predicates.
    ///
    /// Returns `(filter, channel_resolved)`; `channel_resolved` is false
    /// when a channel filter was given but matches no known channel.
    async fn translate_filters(&self, enhanced: &EnhancedQuery) -> (Filter, bool) {
        let mut filter = Filter::default();

        if let Some(ref channel_name) = enhanced.channel_filter {
            match self.resolve_channel(channel_name).await {
                Some(channel_id) => filter.channel_id = Some(channel_id),
                None => {
                    debug!(filter = %channel_name, "Channel filter matches no known channel");
                    return (filter, false);
                }
            }
        }

        if let Some(ref user_name) = enhanced.user_filter {
            // Prefer an id predicate when the user cache can resolve the
            // name; otherwise match the display name stored in metadata.
            match self.chat.find_cached_user(user_name).await {
                Some(user) => filter.user_id = Some(user.id),
                None => {
                    filter.user_name = Some(user_name.trim_start_matches('@').to_string());
                }
            }
        }

        if let Some(ref date) = enhanced.date_from {
            match day_bound(date, false) {
                Some(ts) => filter.ts_from = Some(ts),
                None => warn!(date = %date, "Ignoring unparseable date_from"),
            }
        }
        if let Some(ref date) = enhanced.date_to {
            match day_bound(date, true) {
                Some(ts) => filter.ts_to = Some(ts),
                None => warn!(date = %date, "Ignoring unparseable date_to"),
            }
        }

        (filter, true)
    }

    /// Resolve a channel filter (name or id, case-insensitive, optional
    /// leading `#`) to a channel id via the channel cache.
    async fn resolve_channel(&self, raw: &str) -> Option<String> {
        let wanted = raw.trim().trim_start_matches('#').to_lowercase();
        if wanted.is_empty() {
            return None;
        }

        for channel_id in &self.config.chat_channels {
            if channel_id.to_lowercase() == wanted {
                return Some(channel_id.clone());
            }
            if let Ok(channel) = self.chat.channel(channel_id).await {
                if channel.name.to_lowercase() == wanted {
                    return Some(channel.id);
                }
            }
        }
        None
    }

    fn permalink(&self, channel_id: &str, ts: &str) -> Option<String> {
        let workspace = self.config.chat_workspace.as_ref()?;
        Some(format!(
            "https://{}.slack.com/archives/{}/p{}",
            workspace,
            channel_id,
            ts.replace('.', "")
        ))
    }

    async fn cache_lookup(&self, fingerprint: &str) -> Option<SearchResponse> {
        let mut cache = self.response_cache.lock().await;
        if let Some((at, response)) = cache.get(fingerprint) {
            if at.elapsed() < CACHE_TTL {
                return Some(response.clone());
            }
            cache.remove(fingerprint);
        }
        None
    }

    async fn cache_store(&self, fingerprint: String, response: SearchResponse) {
        let mut cache = self.response_cache.lock().await;
        cache.retain(|_, (at, _)| at.elapsed() < CACHE_TTL);
        cache.insert(fingerprint, (Instant::now(), response));
    }
}

/// Caller overrides beat whatever the enhancer extracted.
fn apply_overrides(enhanced: &mut EnhancedQuery, overrides: &SearchOverrides) {
    if let Some(top_k) = overrides.top_k {
        enhanced.top_k = top_k;
    }
    if overrides.channel_filter.is_some() {
        enhanced.channel_filter = overrides.channel_filter.clone();
    }
    if overrides.user_filter.is_some() {
        enhanced.user_filter = overrides.user_filter.clone();
    }
    if overrides.date_from.is_some() {
        enhanced.date_from = overrides.date_from.clone();
    }
    if overrides.date_to.is_some() {
        enhanced.date_to = overrides.date_to.clone();
    }
}

/// Convert a `YYYY-MM-DD` date to an inclusive UTC day bound in Unix
/// seconds: start of day, or end of day when `end` is set.
pub fn day_bound(date: &str, end: bool) -> Option<i64> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let time = if end {
        parsed.and_hms_opt(23, 59, 59)?
    } else {
        parsed.and_hms_opt(0, 0, 0)?
    };
    Some(time.and_utc().timestamp())
}

/// Stable cache key over the enhanced text, the result count, and the
/// canonical filter set.
fn fingerprint(enhanced_text: &str, top_k: usize, filter: &Filter) -> String {
    let mut hasher = Sha256::new();
    hasher.update(enhanced_text.as_bytes());
    hasher.update([0u8]);
    hasher.update(top_k.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(filter.channel_id.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(filter.user_id.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(filter.user_name.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(filter.ts_from.unwrap_or(i64::MIN).to_le_bytes());
    hasher.update(filter.ts_to.unwrap_or(i64::MAX).to_le_bytes());
    format!("{:x}", hasher.finalize())
}
