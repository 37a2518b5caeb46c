//! LLM-driven query enhancement.
//!
//! A single chat-completion call rewrites a natural-language query into an
//! [`EnhancedQuery`]: sharper search text plus structured filters and a
//! result count. The system prompt, model, and sampling parameters come
//! from an external TOML file, not from code; temperature is pinned low so
//! retries are near-deterministic.
//!
//! Enhancement never fails the outer request: any transport error or a
//! reply that is not valid JSON for the expected schema falls back to the
//! raw query with default settings.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Provider, Result};
use crate::governor::RateGovernor;
use crate::models::EnhancedQuery;

pub const DEFAULT_TOP_K: usize = 10;
pub const TOP_K_MIN: usize = 1;
pub const TOP_K_MAX: usize = 50;

/// Clamp a requested result count into the supported range.
pub fn clamp_top_k(top_k: usize) -> usize {
    top_k.clamp(TOP_K_MIN, TOP_K_MAX)
}

/// Prompt configuration loaded from `ENHANCER_PROMPT_PATH`.
#[derive(Debug, Clone, Deserialize)]
pub struct Prompt {
    pub system: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    1000
}

impl Prompt {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

/// The shape the model is instructed to reply with.
#[derive(Debug, Deserialize)]
struct EnhancerReply {
    enhanced_query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    channel_filter: Option<String>,
    #[serde(default)]
    user_filter: Option<String>,
    #[serde(default)]
    date_from: Option<String>,
    #[serde(default)]
    date_to: Option<String>,
    #[serde(default)]
    intent: Option<crate::models::Intent>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct QueryEnhancer {
    client: reqwest::Client,
    governor: Arc<RateGovernor>,
    base_url: String,
    api_key: String,
    model: String,
    prompt: Option<Prompt>,
}

impl QueryEnhancer {
    /// Build the enhancer. A missing prompt file disables enhancement
    /// (queries pass through) rather than failing startup.
    pub fn new(config: &Config, governor: Arc<RateGovernor>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        let prompt = match Prompt::load(&config.enhancer_prompt_path) {
            Ok(prompt) => Some(prompt),
            Err(e) => {
                warn!(error = %e, "Query enhancer prompt unavailable, enhancement disabled");
                None
            }
        };

        let model = prompt
            .as_ref()
            .and_then(|p| p.model.clone())
            .unwrap_or_else(|| config.enhancer_model.clone());

        Ok(Self {
            client,
            governor,
            base_url: config.embed_api_base.clone(),
            api_key: config.embed_api_key.clone(),
            model,
            prompt,
        })
    }

    /// Enhance a raw query, falling back to a passthrough on any failure.
    pub async fn enhance(&self, raw_query: &str) -> EnhancedQuery {
        let Some(ref prompt) = self.prompt else {
            return EnhancedQuery::passthrough(raw_query, DEFAULT_TOP_K);
        };

        match self.call_model(prompt, raw_query).await {
            Ok(enhanced) => enhanced,
            Err(e) => {
                warn!(error = %e, "Query enhancement failed, using raw query");
                EnhancedQuery::passthrough(raw_query, DEFAULT_TOP_K)
            }
        }
    }

    async fn call_model(&self, prompt: &Prompt, raw_query: &str) -> Result<EnhancedQuery> {
        self.governor.acquire(Provider::Llm, "chat.completions").await;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": prompt.temperature,
            "max_tokens": prompt.max_tokens,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": format!("User Query: {}", raw_query) },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(Provider::Llm, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamInvalid {
                provider: Provider::Llm,
                detail: format!("HTTP {}", status),
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| Error::from_reqwest(Provider::Llm, e))?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UpstreamInvalid {
                provider: Provider::Llm,
                detail: "missing message content".to_string(),
            })?;

        let enhanced = parse_reply(content, raw_query)?;
        debug!(
            enhanced = %enhanced.enhanced_text,
            top_k = enhanced.top_k,
            "Query enhanced"
        );
        Ok(enhanced)
    }
}

/// Parse the model reply as strict JSON matching the enhancement schema.
fn parse_reply(content: &str, raw_query: &str) -> Result<EnhancedQuery> {
    let trimmed = strip_code_fence(content.trim());
    let reply: EnhancerReply =
        serde_json::from_str(trimmed).map_err(|e| Error::UpstreamInvalid {
            provider: Provider::Llm,
            detail: format!("reply is not enhancement JSON: {}", e),
        })?;

    let enhanced_text = if reply.enhanced_query.trim().is_empty() {
        raw_query.to_string()
    } else {
        reply.enhanced_query
    };

    Ok(EnhancedQuery {
        enhanced_text,
        top_k: clamp_top_k(reply.top_k.unwrap_or(DEFAULT_TOP_K)),
        channel_filter: reply.channel_filter.filter(|s| !s.is_empty()),
        user_filter: reply.user_filter.filter(|s| !s.is_empty()),
        date_from: reply.date_from.filter(|s| !s.is_empty()),
        date_to: reply.date_to.filter(|s| !s.is_empty()),
        intent: reply.intent,
        reasoning: reply.reasoning,
    })
}

/// Models sometimes wrap JSON in a markdown code fence despite the prompt.
fn strip_code_fence(content: &str) -> &str {
    let content = content
        .strip_prefix("```json")
        .or_else(|| content.strip_prefix("```"))
        .unwrap_or(content);
    content.strip_suffix("```").unwrap_or(content).trim()
}
