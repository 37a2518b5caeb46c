//! Typed chat-platform client.
//!
//! Wraps the platform's REST API with rate governance, bounded retries, and
//! TTL caches for users and channels. Every endpoint the ingestion pipeline
//! touches is here: channel history (cursor-paginated, one page per governor
//! admission), thread replies, user and channel lookups, reactions, and
//! canvas extraction.
//!
//! The platform's wire contract: every response is HTTP 200 JSON with an
//! `ok` flag; failures set `ok: false` and an `error` string. Genuine rate
//! limiting arrives as HTTP 429 with a `Retry-After` header, which is fed
//! back into the governor before retrying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Provider, Result};
use crate::governor::RateGovernor;
use crate::models::{Canvas, Channel, Message, MessageKind, Reaction, User};
use crate::normalize;

/// Messages fetched per history/replies page.
const PAGE_LIMIT: u32 = 200;

/// How long user and channel cache entries stay fresh.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_RETRIES: u32 = 3;

/// One page of channel history plus the cursor for the next page, if any.
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

pub struct ChatClient {
    client: reqwest::Client,
    governor: Arc<RateGovernor>,
    base_url: String,
    token: String,
    users: RwLock<HashMap<String, (User, Instant)>>,
    channels: RwLock<HashMap<String, (Channel, Instant)>>,
}

impl ChatClient {
    pub fn new(config: &Config, governor: Arc<RateGovernor>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            client,
            governor,
            base_url: config.chat_api_base.clone(),
            token: config.chat_bot_token.clone(),
            users: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch one page of a channel's history, oldest-first.
    ///
    /// `oldest` is exclusive: only messages with `ts` strictly greater are
    /// returned, which is what makes incremental runs resume cleanly after
    /// a checkpoint.
    pub async fn history_page(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<HistoryPage> {
        let mut params = vec![
            ("channel", channel_id.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
            ("inclusive", "false".to_string()),
        ];
        if let Some(oldest) = oldest {
            params.push(("oldest", oldest.to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let body = self.call("conversations.history", &params).await?;
        let page: WireHistory = parse(body)?;

        let mut messages = Vec::with_capacity(page.messages.len());
        for wire in page.messages {
            if let Some(message) = self.convert(wire, channel_id).await {
                messages.push(message);
            }
        }
        // The platform returns newest-first; the pipeline wants ascending ts.
        sort_ascending(&mut messages);

        Ok(HistoryPage {
            messages,
            next_cursor: page
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty()),
        })
    }

    /// Fetch the replies of a thread, excluding the root message.
    pub async fn thread_replies(&self, channel_id: &str, root_ts: &str) -> Result<Vec<Message>> {
        let params = vec![
            ("channel", channel_id.to_string()),
            ("ts", root_ts.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let body = self.call("conversations.replies", &params).await?;
        let page: WireHistory = parse(body)?;

        let mut replies = Vec::new();
        for wire in page.messages {
            if wire.ts == root_ts {
                continue;
            }
            if let Some(mut message) = self.convert(wire, channel_id).await {
                message.kind = MessageKind::ThreadReply;
                replies.push(message);
            }
        }
        sort_ascending(&mut replies);
        Ok(replies)
    }

    /// Look up a user, serving from the 24 h cache when fresh.
    pub async fn user(&self, user_id: &str) -> Result<User> {
        if let Some(user) = cache_get(&self.users, user_id).await {
            return Ok(user);
        }

        let params = vec![("user", user_id.to_string())];
        let body = self.call("users.info", &params).await?;
        let wire: WireUserInfo = parse(body)?;
        let profile = wire.user.profile.unwrap_or_default();
        let user = User {
            id: wire.user.id,
            name: wire.user.name,
            display_name: profile.display_name,
            real_name: profile.real_name,
        };

        cache_put(&self.users, user_id, user.clone()).await;
        Ok(user)
    }

    /// Look up a channel, serving from the 24 h cache when fresh.
    pub async fn channel(&self, channel_id: &str) -> Result<Channel> {
        if let Some(channel) = cache_get(&self.channels, channel_id).await {
            return Ok(channel);
        }

        let params = vec![("channel", channel_id.to_string())];
        let body = self.call("conversations.info", &params).await?;
        let wire: WireChannelInfo = parse(body)?;
        let channel = Channel {
            id: wire.channel.id,
            name: wire.channel.name,
            is_member: wire.channel.is_member,
            canvas_file_id: wire
                .channel
                .properties
                .and_then(|p| p.canvas)
                .map(|c| c.file_id)
                .filter(|id| !id.is_empty()),
        };

        cache_put(&self.channels, channel_id, channel.clone()).await;
        Ok(channel)
    }

    /// Fetch reactions for one message. Best-effort: failures return empty.
    pub async fn reactions(&self, channel_id: &str, ts: &str) -> Vec<Reaction> {
        let params = vec![
            ("channel", channel_id.to_string()),
            ("timestamp", ts.to_string()),
        ];
        match self.call("reactions.get", &params).await {
            Ok(body) => parse::<WireReactionsGet>(body)
                .map(|r| r.message.reactions)
                .unwrap_or_default(),
            Err(e) => {
                debug!(channel = %channel_id, ts = %ts, error = %e, "Reaction lookup failed");
                Vec::new()
            }
        }
    }

    /// Extract a channel's canvas document as plaintext, when one exists.
    pub async fn canvas(&self, channel_id: &str) -> Result<Option<Canvas>> {
        let channel = self.channel(channel_id).await?;
        let Some(file_id) = channel.canvas_file_id else {
            return Ok(None);
        };

        let params = vec![("file", file_id.clone())];
        let body = self.call("files.info", &params).await?;
        let wire: WireFileInfo = parse(body)?;
        let file = wire.file;

        let body_text = canvas_plaintext(&file);
        if body_text.is_empty() {
            return Ok(None);
        }

        Ok(Some(Canvas {
            id: file_id,
            title: if file.title.is_empty() {
                "Canvas".to_string()
            } else {
                file.title
            },
            body: body_text,
            channel_id: channel_id.to_string(),
            created_ts: format!("{}.000000", file.created),
        }))
    }

    /// Reverse-lookup a user by any of their names in the cache.
    ///
    /// Only cached (recently seen) users are searchable; an unknown name
    /// returns `None` and the caller falls back to a name-based predicate.
    pub async fn find_cached_user(&self, name: &str) -> Option<User> {
        let wanted = name.trim().trim_start_matches('@').to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        let users = self.users.read().await;
        users
            .values()
            .filter(|(_, inserted)| inserted.elapsed() < CACHE_TTL)
            .map(|(user, _)| user)
            .find(|user| {
                user.name.to_lowercase() == wanted
                    || user.display_name.to_lowercase() == wanted
                    || user.real_name.to_lowercase() == wanted
            })
            .cloned()
    }

    /// Normalize a raw message body, resolving user mentions through the
    /// user cache.
    pub async fn normalize_text(&self, raw: &str) -> String {
        let mut names = HashMap::new();
        for id in normalize::mention_ids(raw) {
            match self.user(&id).await {
                Ok(user) => {
                    names.insert(id, user.display().to_string());
                }
                Err(e) => {
                    debug!(user = %id, error = %e, "Mention lookup failed, keeping id");
                }
            }
        }
        normalize::clean(raw, &names)
    }

    /// Convert one wire message into a domain [`Message`].
    ///
    /// Returns `None` for messages the index should not carry: bot
    /// messages, system subtypes, and messages whose normalized text is
    /// empty with no extractable attachment.
    async fn convert(&self, wire: WireMessage, channel_id: &str) -> Option<Message> {
        if matches!(wire.subtype.as_deref(), Some("bot_message") | Some("channel_join") | Some("channel_leave")) {
            return None;
        }
        let user_id = wire.user.clone()?;

        let (text, kind, canvas_title) = if !wire.text.trim().is_empty() {
            (self.normalize_text(&wire.text).await, MessageKind::Message, None)
        } else if let Some(file) = wire.files.iter().find(|f| !f.preview.trim().is_empty()) {
            (rich_post_text(file), MessageKind::RichPost, Some(file.display_title()))
        } else {
            return None;
        };
        if text.is_empty() {
            return None;
        }

        let is_thread_root =
            wire.reply_count > 0 && wire.thread_ts.as_deref() == Some(wire.ts.as_str());
        let thread_parent_ts = wire
            .thread_ts
            .clone()
            .filter(|parent| parent != &wire.ts);
        let kind = if thread_parent_ts.is_some() && kind == MessageKind::Message {
            MessageKind::ThreadReply
        } else {
            kind
        };

        Some(Message {
            channel_id: channel_id.to_string(),
            ts: wire.ts,
            text,
            user_id,
            thread_parent_ts,
            is_thread_root,
            reply_count: wire.reply_count,
            reactions: wire.reactions,
            kind,
            thread_replies: Vec::new(),
            canvas_title,
        })
    }

    /// Perform one governed, retried API call and return the raw JSON body.
    async fn call(&self, endpoint: &'static str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(jittered_backoff(attempt)).await;
            }

            self.governor.acquire(Provider::Chat, endpoint).await;

            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(params)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 429 {
                        let retry_after = crate::embedding::parse_retry_after(response.headers())
                            .unwrap_or_else(|| jittered_backoff(attempt + 1));
                        self.governor
                            .note_retry_after(Provider::Chat, endpoint, retry_after);
                        warn!(endpoint, ?retry_after, "Chat platform throttled, retrying");
                        last_err = Some(Error::UpstreamThrottled {
                            provider: Provider::Chat,
                            retry_after: Some(retry_after),
                        });
                        continue;
                    }

                    let body: Value = response
                        .json()
                        .await
                        .map_err(|e| Error::from_reqwest(Provider::Chat, e))?;

                    if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                        return Ok(body);
                    }

                    let code = body
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown_error")
                        .to_string();

                    match code.as_str() {
                        "ratelimited" => {
                            let retry_after = jittered_backoff(attempt + 1);
                            self.governor
                                .note_retry_after(Provider::Chat, endpoint, retry_after);
                            last_err = Some(Error::UpstreamThrottled {
                                provider: Provider::Chat,
                                retry_after: Some(retry_after),
                            });
                            continue;
                        }
                        "invalid_auth" | "account_inactive" | "token_revoked" | "not_authed" => {
                            return Err(Error::AuthUpstream {
                                provider: Provider::Chat,
                                detail: code,
                            });
                        }
                        _ => {
                            return Err(Error::UpstreamInvalid {
                                provider: Provider::Chat,
                                detail: format!("{}: {}", endpoint, code),
                            });
                        }
                    }
                }
                Err(e) => {
                    let err = Error::from_reqwest(Provider::Chat, e);
                    debug!(endpoint, attempt, error = %err, "Chat API transport error");
                    last_err = Some(err);
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(Error::UpstreamThrottled {
            provider: Provider::Chat,
            retry_after: None,
        }))
    }
}

/// Sort messages by ascending timestamp, numerically.
pub fn sort_ascending(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.ts_secs()
            .partial_cmp(&b.ts_secs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ts.cmp(&b.ts))
    });
}

/// Exponential backoff starting at 1 s, jittered ±25%.
fn jittered_backoff(attempt: u32) -> Duration {
    let base_ms = 1000u64 << (attempt - 1).min(5);
    let jitter = base_ms / 4;
    let ms = rand::thread_rng().gen_range(base_ms - jitter..=base_ms + jitter);
    Duration::from_millis(ms)
}

async fn cache_get<T: Clone>(
    cache: &RwLock<HashMap<String, (T, Instant)>>,
    key: &str,
) -> Option<T> {
    {
        let read = cache.read().await;
        if let Some((value, inserted)) = read.get(key) {
            if inserted.elapsed() < CACHE_TTL {
                return Some(value.clone());
            }
        } else {
            return None;
        }
    }
    // Entry exists but expired: evict on read.
    cache.write().await.remove(key);
    None
}

async fn cache_put<T>(cache: &RwLock<HashMap<String, (T, Instant)>>, key: &str, value: T) {
    cache
        .write()
        .await
        .insert(key.to_string(), (value, Instant::now()));
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|e| Error::UpstreamInvalid {
        provider: Provider::Chat,
        detail: e.to_string(),
    })
}

/// Flatten a rich attachment (post, code snippet, workflow block) into
/// indexable prose.
fn rich_post_text(file: &WireFile) -> String {
    let mut parts = Vec::new();
    let title = file.display_title();
    if !title.is_empty() {
        parts.push(format!("{}: {}", rich_label(&file.filetype), title));
    }
    if !file.preview.trim().is_empty() {
        parts.push(file.preview.trim().to_string());
    }
    parts.join("\n")
}

fn rich_label(filetype: &str) -> &'static str {
    match filetype {
        "post" | "docs" => "Post",
        "slack_list" | "list" => "List",
        "workflow" => "Workflow",
        _ => "File",
    }
}

/// Assemble canvas plaintext: title line plus any renderable text blocks,
/// ignoring markup that cannot be rendered to prose.
fn canvas_plaintext(file: &WireFile) -> String {
    let mut parts = Vec::new();
    let title = file.display_title();
    if !title.is_empty() {
        parts.push(format!("Canvas: {}", title));
    }
    for block in &file.title_blocks {
        collect_rich_text(block, &mut parts);
    }
    if !file.preview.trim().is_empty() {
        parts.push(file.preview.trim().to_string());
    }
    parts.join("\n")
}

fn collect_rich_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = map.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        out.push(text.trim().to_string());
                    }
                    return;
                }
            }
            if let Some(elements) = map.get("elements").and_then(Value::as_array) {
                for element in elements {
                    collect_rich_text(element, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_rich_text(item, out);
            }
        }
        _ => {}
    }
}

// ---- Wire types ----

#[derive(Deserialize)]
struct WireHistory {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    response_metadata: Option<WireResponseMetadata>,
}

#[derive(Deserialize)]
struct WireResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    ts: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    reply_count: u32,
    #[serde(default)]
    reactions: Vec<Reaction>,
    #[serde(default)]
    files: Vec<WireFile>,
}

#[derive(Deserialize, Default)]
struct WireFile {
    #[serde(default)]
    title: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    filetype: String,
    #[serde(default)]
    preview: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    title_blocks: Vec<Value>,
}

impl WireFile {
    fn display_title(&self) -> String {
        if !self.title.is_empty() {
            self.title.clone()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Deserialize)]
struct WireUserInfo {
    user: WireUser,
}

#[derive(Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile: Option<WireProfile>,
}

#[derive(Deserialize, Default)]
struct WireProfile {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    real_name: String,
}

#[derive(Deserialize)]
struct WireChannelInfo {
    channel: WireChannel,
}

#[derive(Deserialize)]
struct WireChannel {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_member: bool,
    #[serde(default)]
    properties: Option<WireChannelProperties>,
}

#[derive(Deserialize)]
struct WireChannelProperties {
    #[serde(default)]
    canvas: Option<WireCanvasRef>,
}

#[derive(Deserialize)]
struct WireCanvasRef {
    #[serde(default)]
    file_id: String,
}

#[derive(Deserialize)]
struct WireReactionsGet {
    #[serde(default)]
    message: WireReactionsMessage,
}

#[derive(Deserialize, Default)]
struct WireReactionsMessage {
    #[serde(default)]
    reactions: Vec<Reaction>,
}

#[derive(Deserialize)]
struct WireFileInfo {
    file: WireFile,
}
