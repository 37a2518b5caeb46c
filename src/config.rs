use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_CHAT_API_BASE: &str = "https://slack.com/api";
pub const DEFAULT_EMBED_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_ENHANCER_MODEL: &str = "gpt-4o-mini";

/// Bearer tokens accepted by the request server: fixed prefix plus 48 hex chars.
pub const API_KEY_PREFIX: &str = "mcp_key_";
pub const API_KEY_HEX_LEN: usize = 48;

#[derive(Debug, Clone)]
pub struct Config {
    // Chat platform
    pub chat_bot_token: String,
    pub chat_channels: Vec<String>,
    pub chat_api_base: String,
    pub chat_workspace: Option<String>,
    pub chat_rate_limit_override: Option<u32>,

    // Embedding / LLM provider
    pub embed_api_key: String,
    pub embed_api_base: String,
    pub embed_model: String,
    pub embed_rate_limit_per_minute: u32,
    pub enhancer_model: String,
    pub enhancer_prompt_path: PathBuf,

    // Vector index
    pub vector_api_key: Option<String>,
    pub vector_api_base: Option<String>,
    pub vector_index_name: String,
    pub vector_local_path: PathBuf,

    // Ingestion
    pub state_path: PathBuf,
    pub refresh_interval_hours: u64,
    pub ingest_concurrency: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Request server
    pub api_keys: Vec<String>,
    pub listen_addr: SocketAddr,
    pub cors_origins: Option<Vec<String>>,

    // Operational log sink
    pub oplog_url: Option<String>,
    pub oplog_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chat_bot_token: String::new(),
            chat_channels: Vec::new(),
            chat_api_base: DEFAULT_CHAT_API_BASE.to_string(),
            chat_workspace: None,
            chat_rate_limit_override: None,
            embed_api_key: String::new(),
            embed_api_base: DEFAULT_EMBED_API_BASE.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            embed_rate_limit_per_minute: 3000,
            enhancer_model: DEFAULT_ENHANCER_MODEL.to_string(),
            enhancer_prompt_path: PathBuf::from("config/enhancer.toml"),
            vector_api_key: None,
            vector_api_base: None,
            vector_index_name: "messages".to_string(),
            vector_local_path: PathBuf::from("data/vectors.ndjson"),
            state_path: PathBuf::from("data/ingestion_state.json"),
            refresh_interval_hours: 1,
            ingest_concurrency: 3,
            chunk_size: 8000,
            chunk_overlap: 200,
            api_keys: Vec::new(),
            listen_addr: ([0, 0, 0, 0], 5000).into(),
            cors_origins: None,
            oplog_url: None,
            oplog_token: None,
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    ///
    /// Malformed optional values fall back to defaults with a warning;
    /// missing required values are caught later by [`Config::validate`].
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(token) = std::env::var("CHAT_BOT_TOKEN") {
            config.chat_bot_token = token;
        }
        if let Ok(channels) = std::env::var("CHAT_CHANNELS") {
            config.chat_channels = channels
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Ok(base) = std::env::var("CHAT_API_BASE") {
            config.chat_api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(ws) = std::env::var("CHAT_WORKSPACE") {
            if !ws.is_empty() {
                config.chat_workspace = Some(ws);
            }
        }
        if let Ok(val) = std::env::var("CHAT_RATE_LIMIT_PER_MINUTE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.chat_rate_limit_override = Some(n),
                _ => tracing::warn!(value = %val, "Invalid CHAT_RATE_LIMIT_PER_MINUTE, ignoring"),
            }
        }

        if let Ok(key) = std::env::var("EMBED_API_KEY") {
            config.embed_api_key = key;
        }
        if let Ok(base) = std::env::var("EMBED_API_BASE") {
            config.embed_api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("EMBED_MODEL") {
            config.embed_model = model;
        }
        if let Ok(val) = std::env::var("EMBED_RATE_LIMIT_PER_MINUTE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.embed_rate_limit_per_minute = n,
                _ => tracing::warn!(value = %val, "Invalid EMBED_RATE_LIMIT_PER_MINUTE, ignoring"),
            }
        }
        if let Ok(model) = std::env::var("ENHANCER_MODEL") {
            config.enhancer_model = model;
        }
        if let Ok(path) = std::env::var("ENHANCER_PROMPT_PATH") {
            config.enhancer_prompt_path = PathBuf::from(path);
        }

        if let Ok(key) = std::env::var("VECTOR_API_KEY") {
            if !key.is_empty() {
                config.vector_api_key = Some(key);
            }
        }
        if let Ok(base) = std::env::var("VECTOR_API_BASE") {
            if !base.is_empty() {
                config.vector_api_base = Some(base.trim_end_matches('/').to_string());
            }
        }
        if let Ok(name) = std::env::var("VECTOR_INDEX_NAME") {
            if !name.is_empty() {
                config.vector_index_name = name;
            }
        }
        if let Ok(path) = std::env::var("VECTOR_LOCAL_PATH") {
            config.vector_local_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("STATE_PATH") {
            config.state_path = PathBuf::from(path);
        }
        if let Ok(val) = std::env::var("REFRESH_INTERVAL_HOURS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.refresh_interval_hours = n,
                _ => tracing::warn!(value = %val, "Invalid REFRESH_INTERVAL_HOURS, using default"),
            }
        }
        if let Ok(val) = std::env::var("INGEST_CONCURRENCY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.ingest_concurrency = n,
                _ => tracing::warn!(value = %val, "Invalid INGEST_CONCURRENCY, using default"),
            }
        }
        if let Ok(val) = std::env::var("CHUNK_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.chunk_size = n,
                _ => tracing::warn!(value = %val, "Invalid CHUNK_SIZE, using default"),
            }
        }
        if let Ok(val) = std::env::var("CHUNK_OVERLAP") {
            match val.parse::<usize>() {
                Ok(n) => config.chunk_overlap = n,
                _ => tracing::warn!(value = %val, "Invalid CHUNK_OVERLAP, using default"),
            }
        }

        let mut keys: Vec<String> = Vec::new();
        if let Ok(key) = std::env::var("API_KEY") {
            if !key.is_empty() {
                keys.push(key);
            }
        }
        if let Ok(list) = std::env::var("WHITELIST_KEYS") {
            for key in list.split(',') {
                let key = key.trim();
                if !key.is_empty() && !keys.iter().any(|k| k == key) {
                    keys.push(key.to_string());
                }
            }
        }
        config.api_keys = keys;

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.cors_origins = Some(parsed);
            }
        }

        if let Ok(url) = std::env::var("OPLOG_URL") {
            if !url.is_empty() {
                config.oplog_url = Some(url);
            }
        }
        if let Ok(token) = std::env::var("OPLOG_TOKEN") {
            if !token.is_empty() {
                config.oplog_token = Some(token);
            }
        }

        config
    }

    /// Validate required settings for the selected run mode.
    pub fn validate(&self, serving: bool) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();
        if self.chat_bot_token.is_empty() {
            missing.push("CHAT_BOT_TOKEN");
        }
        if self.chat_channels.is_empty() {
            missing.push("CHAT_CHANNELS");
        }
        if self.embed_api_key.is_empty() {
            missing.push("EMBED_API_KEY");
        }
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        if self.vector_api_key.is_some() && self.vector_api_base.is_none() {
            return Err(Error::Config(
                "VECTOR_API_KEY is set but VECTOR_API_BASE is not".to_string(),
            ));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }

        if serving {
            if self.api_keys.is_empty() {
                return Err(Error::Config(
                    "serve mode requires API_KEY or WHITELIST_KEYS".to_string(),
                ));
            }
            for key in &self.api_keys {
                if !key_format_valid(key) {
                    return Err(Error::Config(format!(
                        "API key must be '{}' followed by {} hex characters",
                        API_KEY_PREFIX, API_KEY_HEX_LEN
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn remote_vector_enabled(&self) -> bool {
        self.vector_api_key.is_some()
    }
}

pub fn key_format_valid(key: &str) -> bool {
    key.len() == API_KEY_PREFIX.len() + API_KEY_HEX_LEN
        && key.starts_with(API_KEY_PREFIX)
        && key[API_KEY_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_hexdigit())
}
