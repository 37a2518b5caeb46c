//! Server-side sessions.
//!
//! A session is created by `initialize` and ties subsequent requests to an
//! authenticated subject via the `Mcp-Session-Id` header. Sessions live
//! for 24 hours and are never silently re-created: an expired or unknown
//! id is the client's signal to initialize again.
//!
//! Each session also carries a 60-requests-per-minute sliding window;
//! requests over the rate are rejected at the transport layer.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// How long a session stays valid after `initialize`.
pub fn session_ttl() -> chrono::Duration {
    chrono::Duration::hours(24)
}

const SESSION_RATE_LIMIT: usize = 60;
const SESSION_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub subject: String,
}

struct Entry {
    session: Session,
    requests: VecDeque<Instant>,
}

/// Outcome of admitting one request under a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    /// Unknown or expired session: JSON-RPC `-32002`.
    Invalid,
    /// Per-session request rate exceeded: HTTP 429.
    OverRate,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Entry>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for an authenticated subject.
    pub async fn create(&self, subject: &str) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + session_ttl(),
            subject: subject.to_string(),
        };

        self.sessions.write().await.insert(
            session.id,
            Entry {
                session: session.clone(),
                requests: VecDeque::new(),
            },
        );
        debug!(session = %session.id, "Session created");
        session
    }

    /// Validate a session id and count this request against its rate
    /// window. Expired sessions are removed on touch.
    pub async fn admit(&self, raw_id: Option<&str>) -> Admission {
        let Some(id) = raw_id.and_then(|raw| Uuid::parse_str(raw.trim()).ok()) else {
            return Admission::Invalid;
        };

        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&id) else {
            return Admission::Invalid;
        };

        if entry.session.expires_at <= Utc::now() {
            sessions.remove(&id);
            debug!(session = %id, "Session expired");
            return Admission::Invalid;
        }

        let now = Instant::now();
        while let Some(front) = entry.requests.front() {
            if now.duration_since(*front) >= SESSION_RATE_WINDOW {
                entry.requests.pop_front();
            } else {
                break;
            }
        }
        if entry.requests.len() >= SESSION_RATE_LIMIT {
            return Admission::OverRate;
        }
        entry.requests.push_back(now);
        Admission::Ok
    }

    /// Drop every expired session. Run periodically.
    pub async fn purge_expired(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.session.expires_at > now);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "Purged expired sessions");
        }
    }

    #[cfg(test)]
    async fn force_expire(&self, id: Uuid) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}
