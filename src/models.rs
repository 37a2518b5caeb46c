//! Core data types that flow through the ingestion and search pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Chat API → Message → normalize() → embedding text → chunk() → EmbeddingVector
//!                                                         ↓
//!                                                    VectorRecord → upsert()
//!                                                         ↓
//!                                                    query() → SearchHit
//! ```
//!
//! A message's identity is the pair `(channel_id, ts)`, where `ts` is the
//! platform's monotonic timestamp string (e.g. `"1718000000.000100"`). That
//! pair — optionally extended with a chunk index — is the stable key under
//! which a vector lives in the index.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dimensionality of every embedding vector stored in the index.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

/// Maximum length of the metadata text excerpt, in characters.
pub const EXCERPT_MAX_CHARS: usize = 300;

/// A workspace member, cached with a 24 h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub real_name: String,
}

impl User {
    /// The name shown in the workspace UI: display name if set, then real
    /// name, then handle, then the raw id.
    pub fn display(&self) -> &str {
        if !self.display_name.is_empty() {
            &self.display_name
        } else if !self.real_name.is_empty() {
            &self.real_name
        } else if !self.name.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

/// A channel, cached with a 24 h TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub is_member: bool,
    /// File id of the channel's canvas document, when one exists.
    #[serde(default)]
    pub canvas_file_id: Option<String>,
}

/// An emoji reaction attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
    pub count: u32,
}

/// A channel canvas document, indexed as a synthetic message.
#[derive(Debug, Clone)]
pub struct Canvas {
    pub id: String,
    pub title: String,
    pub body: String,
    pub channel_id: String,
    pub created_ts: String,
}

/// What kind of content a [`Message`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    ThreadReply,
    Canvas,
    RichPost,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::ThreadReply => "thread_reply",
            MessageKind::Canvas => "canvas",
            MessageKind::RichPost => "rich_post",
        }
    }
}

/// A single chat message after extraction, before chunking.
///
/// `text` holds the normalized body (mentions resolved, markup unwrapped).
/// During ingestion a thread root carries its replies inline in
/// `thread_replies`; replies are also emitted as standalone messages of kind
/// [`MessageKind::ThreadReply`].
#[derive(Debug, Clone)]
pub struct Message {
    pub channel_id: String,
    pub ts: String,
    pub text: String,
    pub user_id: String,
    pub thread_parent_ts: Option<String>,
    pub is_thread_root: bool,
    pub reply_count: u32,
    pub reactions: Vec<Reaction>,
    pub kind: MessageKind,
    pub thread_replies: Vec<Message>,
    pub canvas_title: Option<String>,
}

impl Message {
    /// The vector id for one chunk of this message.
    ///
    /// Single-chunk messages use `"{channel}:{ts}"`; multi-chunk messages
    /// append the chunk index.
    pub fn vector_id(&self, chunk_index: usize, chunk_total: usize) -> String {
        if chunk_total <= 1 {
            format!("{}:{}", self.channel_id, self.ts)
        } else {
            format!("{}:{}:{}", self.channel_id, self.ts, chunk_index)
        }
    }

    /// The message timestamp as Unix seconds. Platform timestamps are
    /// `"<secs>.<seq>"` strings; the fractional part is a sequence number,
    /// not sub-second time, but parsing the whole value keeps ordering.
    pub fn ts_secs(&self) -> f64 {
        self.ts.parse::<f64>().unwrap_or(0.0)
    }

    /// Short comma-joined reaction summary, e.g. `"thumbsup(3), eyes(1)"`.
    pub fn reactions_summary(&self) -> Option<String> {
        if self.reactions.is_empty() {
            return None;
        }
        Some(
            self.reactions
                .iter()
                .map(|r| format!("{}({})", r.name, r.count))
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

/// Metadata stored alongside each vector in the index.
///
/// `ts_secs` duplicates `ts` in numeric form so the index can evaluate
/// inclusive date-range predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub user_name: String,
    pub ts: String,
    pub ts_secs: f64,
    pub iso_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root_ts: Option<String>,
    pub kind: MessageKind,
    pub has_reactions: bool,
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub text_excerpt: String,
}

/// One vector plus its metadata, keyed by the stable vector id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// Per-channel resume point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCheckpoint {
    pub last_ingested_ts: String,
    pub last_success_at: DateTime<Utc>,
    pub message_count: u64,
}

/// Persisted ingestion state: one checkpoint per channel plus run bookkeeping.
/// Written atomically (temp file + rename) after each successful channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionState {
    #[serde(default)]
    pub run_id: u64,
    #[serde(default)]
    pub first_run_completed: bool,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelCheckpoint>,
}

/// Structured record of one ingestion run, written to the operational log
/// sink at the end of every run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: u64,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub channels_processed: u32,
    pub messages_processed: u64,
    pub messages_embedded: u64,
    pub messages_upserted: u64,
    pub errors_by_kind: BTreeMap<String, u32>,
    pub success: bool,
}

/// Classified intent of a search query, produced by the query enhancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Problem,
    Info,
    Decision,
    Urgent,
}

/// An LLM-enhanced search query with structured filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedQuery {
    pub enhanced_text: String,
    pub top_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl EnhancedQuery {
    /// The passthrough query used when enhancement is skipped or fails.
    pub fn passthrough(raw: &str, top_k: usize) -> Self {
        Self {
            enhanced_text: raw.to_string(),
            top_k,
            channel_filter: None,
            user_filter: None,
            date_from: None,
            date_to: None,
            intent: None,
            reasoning: None,
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub channel_name: String,
    pub user_name: String,
    pub ts: String,
    pub ts_iso: String,
    pub text_excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_root_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
}

/// The full response to one search request.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_query: Option<EnhancedQuery>,
    pub total: usize,
    pub results: Vec<SearchHit>,
}

/// Truncate text to a char-boundary-safe excerpt of at most
/// [`EXCERPT_MAX_CHARS`] characters.
pub fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(EXCERPT_MAX_CHARS).collect()
}
