//! Endpoint-scoped sliding-window rate governor.
//!
//! Every outbound call to the chat platform, the embedding provider, or the
//! LLM passes through [`RateGovernor::acquire`] first. Each `(provider,
//! endpoint)` pair owns an independent 60-second window of admission
//! timestamps plus an optional cooldown set from a server-issued retry-after
//! hint.
//!
//! Waiters for one key queue on that key's async mutex, so admission is FIFO
//! per key and suspension is cooperative — a sleeping waiter releases the
//! scheduler, and the cooldown is re-read after every sleep. Cooldowns live
//! outside the window lock so recording a retry-after hint never waits
//! behind a sleeping waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;
use crate::error::Provider;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-endpoint request-per-minute limits for the chat platform.
///
/// Endpoints not in this table fall back to the conservative default.
const CHAT_ENDPOINT_LIMITS: &[(&str, u32)] = &[
    ("conversations.history", 100),
    ("conversations.replies", 100),
    ("users.info", 100),
    ("conversations.info", 100),
    ("reactions.get", 100),
    ("files.info", 100),
    ("canvases.read", 50),
];

const CHAT_DEFAULT_LIMIT: u32 = 50;
const LLM_DEFAULT_LIMIT: u32 = 500;

type Key = (Provider, &'static str);

struct Window {
    limit: u32,
    admitted: VecDeque<Instant>,
}

pub struct RateGovernor {
    windows: std::sync::Mutex<HashMap<Key, Arc<Mutex<Window>>>>,
    cooldowns: std::sync::Mutex<HashMap<Key, Instant>>,
    chat_override: Option<u32>,
    embed_limit: u32,
}

impl RateGovernor {
    pub fn new(config: &Config) -> Self {
        Self {
            windows: std::sync::Mutex::new(HashMap::new()),
            cooldowns: std::sync::Mutex::new(HashMap::new()),
            chat_override: config.chat_rate_limit_override,
            embed_limit: config.embed_rate_limit_per_minute,
        }
    }

    fn limit_for(&self, provider: Provider, endpoint: &str) -> u32 {
        match provider {
            Provider::Chat => self.chat_override.unwrap_or_else(|| {
                CHAT_ENDPOINT_LIMITS
                    .iter()
                    .find(|(name, _)| *name == endpoint)
                    .map(|(_, limit)| *limit)
                    .unwrap_or(CHAT_DEFAULT_LIMIT)
            }),
            Provider::Embedding => self.embed_limit,
            Provider::Llm => LLM_DEFAULT_LIMIT,
            Provider::Vector => u32::MAX,
        }
    }

    fn window(&self, provider: Provider, endpoint: &'static str) -> Arc<Mutex<Window>> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .entry((provider, endpoint))
            .or_insert_with(|| {
                Arc::new(Mutex::new(Window {
                    limit: self.limit_for(provider, endpoint),
                    admitted: VecDeque::new(),
                }))
            })
            .clone()
    }

    /// The remaining cooldown for a key, clearing it once elapsed.
    fn active_cooldown(&self, key: Key) -> Option<Duration> {
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let until = cooldowns.get(&key)?;
        let now = Instant::now();
        if *until > now {
            Some(*until - now)
        } else {
            cooldowns.remove(&key);
            None
        }
    }

    /// Block until a request to `(provider, endpoint)` may proceed, then
    /// record the admission.
    ///
    /// Admission requires that any active cooldown has elapsed and that
    /// fewer than `limit` requests were admitted in the trailing 60 s.
    pub async fn acquire(&self, provider: Provider, endpoint: &'static str) {
        let key = (provider, endpoint);
        let window = self.window(provider, endpoint);
        let mut guard = window.lock().await;

        loop {
            // Honor a retry-after cooldown first; it may have been extended
            // while we slept.
            if let Some(wait) = self.active_cooldown(key) {
                debug!(%provider, endpoint, ?wait, "Waiting for retry-after cooldown");
                tokio::time::sleep(wait).await;
                continue;
            }

            let now = Instant::now();
            while let Some(front) = guard.admitted.front() {
                if now.duration_since(*front) >= WINDOW {
                    guard.admitted.pop_front();
                } else {
                    break;
                }
            }

            if (guard.admitted.len() as u32) < guard.limit {
                guard.admitted.push_back(now);
                return;
            }

            // Window full: sleep until the oldest admission leaves it.
            let oldest = *guard.admitted.front().unwrap_or(&now);
            let wait = WINDOW.saturating_sub(now.duration_since(oldest));
            debug!(%provider, endpoint, ?wait, "Rate limit window full, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a server-issued retry-after hint for a key.
    ///
    /// The cooldown only ever extends; a shorter hint never shortens an
    /// existing one. Waiters observe the new deadline when they next wake.
    pub fn note_retry_after(&self, provider: Provider, endpoint: &'static str, duration: Duration) {
        let until = Instant::now() + duration;
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cooldowns.entry((provider, endpoint)).or_insert(until);
        *entry = (*entry).max(until);
        debug!(%provider, endpoint, ?duration, "Recorded retry-after cooldown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(chat_limit: Option<u32>) -> RateGovernor {
        let mut config = Config::default();
        config.chat_rate_limit_override = chat_limit;
        RateGovernor::new(&config)
    }

    #[test]
    fn test_endpoint_limit_table() {
        let gov = governor(None);
        assert_eq!(gov.limit_for(Provider::Chat, "conversations.history"), 100);
        assert_eq!(gov.limit_for(Provider::Chat, "canvases.read"), 50);
        assert_eq!(gov.limit_for(Provider::Chat, "something.unknown"), 50);
        assert_eq!(gov.limit_for(Provider::Embedding, "embeddings"), 3000);
    }

    #[test]
    fn test_override_applies_to_all_chat_endpoints() {
        let gov = governor(Some(7));
        assert_eq!(gov.limit_for(Provider::Chat, "conversations.history"), 7);
        assert_eq!(gov.limit_for(Provider::Chat, "users.info"), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bound_holds() {
        let gov = governor(Some(10));
        let start = Instant::now();

        for _ in 0..10 {
            gov.acquire(Provider::Chat, "conversations.history").await;
        }
        // First ten admissions must not sleep.
        assert_eq!(Instant::now(), start);

        // The eleventh waits out the full window.
        gov.acquire(Provider::Chat, "conversations.history").await;
        assert!(Instant::now() - start >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_respected() {
        let gov = governor(Some(100));
        let start = Instant::now();

        gov.note_retry_after(Provider::Chat, "users.info", Duration::from_secs(30));
        gov.acquire(Provider::Chat, "users.info").await;
        assert!(Instant::now() - start >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_only_extends() {
        let gov = governor(Some(100));
        let start = Instant::now();

        gov.note_retry_after(Provider::Chat, "users.info", Duration::from_secs(30));
        gov.note_retry_after(Provider::Chat, "users.info", Duration::from_secs(5));
        gov.acquire(Provider::Chat, "users.info").await;
        assert!(Instant::now() - start >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let gov = governor(Some(1));
        let start = Instant::now();

        gov.acquire(Provider::Chat, "conversations.history").await;
        // A different endpoint has its own window and admits immediately.
        gov.acquire(Provider::Chat, "users.info").await;
        gov.acquire(Provider::Embedding, "embeddings").await;
        assert_eq!(Instant::now(), start);

        gov.note_retry_after(Provider::Chat, "users.info", Duration::from_secs(10));
        // The cooldown is scoped to its key.
        gov.acquire(Provider::Embedding, "embeddings").await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let gov = governor(Some(2));
        gov.acquire(Provider::Chat, "users.info").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        gov.acquire(Provider::Chat, "users.info").await;

        // The third admission needs the first to age out (t=60), not the
        // second (t=90).
        let before = Instant::now();
        gov.acquire(Provider::Chat, "users.info").await;
        let waited = Instant::now() - before;
        assert!(waited >= Duration::from_secs(29));
        assert!(waited <= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_extended_mid_wait_is_honored() {
        let gov = Arc::new(governor(Some(100)));
        gov.note_retry_after(Provider::Chat, "users.info", Duration::from_secs(10));

        let waiter = {
            let gov = Arc::clone(&gov);
            tokio::spawn(async move {
                let start = Instant::now();
                gov.acquire(Provider::Chat, "users.info").await;
                Instant::now() - start
            })
        };

        // Extend the cooldown while the waiter sleeps.
        tokio::time::sleep(Duration::from_secs(5)).await;
        gov.note_retry_after(Provider::Chat, "users.info", Duration::from_secs(20));

        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_secs(25), "waited {:?}", waited);
    }
}
