//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow per channel: fetch history → inline thread
//! replies → prepend canvas → normalize → embed → upsert → checkpoint.
//! Channels are processed with bounded concurrency, and a scheduler re-runs
//! the whole pipeline on a fixed interval.
//!
//! # Resumability
//!
//! Each channel carries a `last_ingested_ts` checkpoint. An initial run
//! (no checkpoint) fetches from channel creation forward; incremental runs
//! fetch strictly newer messages. Within a channel, messages are embedded
//! and upserted in ascending timestamp order, a pending high-water mark
//! advances after each successful upsert batch, and the checkpoint is
//! written atomically at end-of-stream — so a crash or shutdown never
//! loses acknowledged work and never skips unacknowledged work.
//!
//! # Failure isolation
//!
//! A failure in one channel does not stop another. Transient errors retry
//! with backoff and then skip the channel until the next scheduled run.
//! Fatal errors (rejected credentials, embedding dimension mismatch) abort
//! the whole run without advancing the failing channel's checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::chat::ChatClient;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::models::{
    excerpt, Canvas, Message, MessageKind, RunReport, VectorMetadata, VectorRecord,
};
use crate::oplog::OpLog;
use crate::state::StateStore;
use crate::store::VectorStore;
use crate::{chunk, store};

/// Messages per embedding batch fed to the provider.
pub const EMBED_TEXT_BATCH: usize = 64;

/// Bounded buffer size between the fetch stage and the embed/upsert stage.
const STAGE_BUFFER: usize = 200;

/// Maximum characters of thread-reply excerpts folded into a root
/// message's embedding text.
const THREAD_TAIL_MAX_CHARS: usize = 1000;

const CHANNEL_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Default)]
struct ChannelOutcome {
    processed: u64,
    embedded: u64,
    upserted: u64,
}

pub struct IngestionWorker {
    config: Arc<Config>,
    chat: Arc<ChatClient>,
    embedder: Arc<EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    state: Arc<StateStore>,
    oplog: Arc<OpLog>,
    run_lock: Mutex<()>,
    pending_run: std::sync::atomic::AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl IngestionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        chat: Arc<ChatClient>,
        embedder: Arc<EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        state: Arc<StateStore>,
        oplog: Arc<OpLog>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            chat,
            embedder,
            store,
            state,
            oplog,
            run_lock: Mutex::new(()),
            pending_run: std::sync::atomic::AtomicBool::new(false),
            shutdown,
        })
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run once at startup, then on every scheduler tick until shutdown.
    pub async fn run_forever(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.refresh_interval_hours * 3600);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.trigger().await {
                        Ok(_) => {}
                        // Coalesced into an already-active run; not a failure.
                        Err(Error::NotReady) => {}
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Ingestion run failed with a fatal error");
                        }
                        Err(e) => {
                            warn!(error = %e, "Ingestion run failed, will retry on next tick");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Ingestion worker shutting down");
                    return;
                }
            }
        }
    }

    /// Start a run unless one is already active; an overlapping trigger is
    /// coalesced into at most one pending run that fires when the active
    /// run finishes.
    pub async fn trigger(self: &Arc<Self>) -> Result<RunReport> {
        use std::sync::atomic::Ordering;

        loop {
            let Ok(guard) = self.run_lock.try_lock() else {
                info!("Ingestion run already active, coalescing trigger");
                self.pending_run.store(true, Ordering::SeqCst);
                return Err(Error::NotReady);
            };
            let result = self.run_once().await;
            drop(guard);

            if !self.pending_run.swap(false, Ordering::SeqCst) || self.shutting_down() {
                return result;
            }
            info!("Running coalesced ingestion trigger");
        }
    }

    /// Execute one full ingestion run over every configured channel.
    pub async fn run_once(self: &Arc<Self>) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = self.state.begin_run().await?;
        let snapshot = self.state.snapshot().await;
        let operation = if snapshot.first_run_completed {
            "incremental_refresh"
        } else {
            "initial_ingestion"
        };
        info!(run_id, operation, channels = self.config.chat_channels.len(), "Ingestion run starting");

        let semaphore = Arc::new(Semaphore::new(self.config.ingest_concurrency));
        let mut tasks: JoinSet<(String, Result<ChannelOutcome>)> = JoinSet::new();

        for channel_id in &self.config.chat_channels {
            let worker = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let channel_id = channel_id.clone();
            let since = snapshot
                .channels
                .get(&channel_id)
                .map(|cp| cp.last_ingested_ts.clone())
                .filter(|ts| !ts.is_empty());

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = worker.ingest_channel_with_retry(&channel_id, since).await;
                (channel_id, outcome)
            });
        }

        let mut report = RunReport {
            run_id,
            operation: operation.to_string(),
            started_at,
            finished_at: started_at,
            duration_secs: 0.0,
            channels_processed: 0,
            messages_processed: 0,
            messages_embedded: 0,
            messages_upserted: 0,
            errors_by_kind: BTreeMap::new(),
            success: true,
        };
        let mut fatal: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((channel_id, Ok(outcome))) => {
                    report.channels_processed += 1;
                    report.messages_processed += outcome.processed;
                    report.messages_embedded += outcome.embedded;
                    report.messages_upserted += outcome.upserted;
                    info!(
                        channel = %channel_id,
                        processed = outcome.processed,
                        upserted = outcome.upserted,
                        "Channel ingestion complete"
                    );
                }
                Ok((channel_id, Err(e))) => {
                    *report.errors_by_kind.entry(e.kind().to_string()).or_insert(0) += 1;
                    report.success = false;
                    if e.is_fatal() {
                        error!(channel = %channel_id, error = %e, "Fatal channel failure, aborting run");
                        fatal.get_or_insert(e);
                        tasks.abort_all();
                    } else {
                        warn!(channel = %channel_id, error = %e, "Channel skipped this run");
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    report.success = false;
                    *report
                        .errors_by_kind
                        .entry("internal".to_string())
                        .or_insert(0) += 1;
                    error!(error = %join_err, "Channel task panicked");
                }
            }
        }

        if fatal.is_none() && report.success {
            self.state.mark_first_run_complete().await?;
        }

        report.finished_at = Utc::now();
        report.duration_secs = (report.finished_at - report.started_at)
            .num_milliseconds() as f64
            / 1000.0;
        self.oplog.record_run(&report).await;
        info!(
            run_id,
            duration_secs = report.duration_secs,
            upserted = report.messages_upserted,
            success = report.success,
            "Ingestion run finished"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn ingest_channel_with_retry(
        &self,
        channel_id: &str,
        since: Option<String>,
    ) -> Result<ChannelOutcome> {
        let mut last_err = None;
        for attempt in 0..CHANNEL_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
            match self.ingest_channel(channel_id, since.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.retryable() && attempt + 1 < CHANNEL_MAX_ATTEMPTS => {
                    warn!(channel = %channel_id, attempt, error = %e, "Transient channel failure, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(Error::Internal("retries exhausted".to_string())))
    }

    /// Drive the stage pipeline for one channel.
    async fn ingest_channel(
        &self,
        channel_id: &str,
        since: Option<String>,
    ) -> Result<ChannelOutcome> {
        let channel = self.chat.channel(channel_id).await?;
        if !channel.is_member {
            warn!(channel = %channel_id, name = %channel.name, "Not a member of channel, skipping");
            return Ok(ChannelOutcome::default());
        }

        let (tx, mut rx) = mpsc::channel::<Message>(STAGE_BUFFER);

        // Fetch stage: stream pages, inlining thread replies per root and
        // prepending the canvas document once per run.
        let chat = Arc::clone(&self.chat);
        let fetch_channel = channel_id.to_string();
        let fetch_since = since.clone();
        let fetch = tokio::spawn(async move {
            if let Ok(Some(canvas)) = chat.canvas(&fetch_channel).await {
                if tx.send(canvas_message(canvas)).await.is_err() {
                    return Ok(());
                }
            }

            let mut cursor: Option<String> = None;
            loop {
                let page = chat
                    .history_page(&fetch_channel, fetch_since.as_deref(), cursor.as_deref())
                    .await?;

                for mut message in page.messages {
                    if message.is_thread_root && message.reply_count > 0 {
                        let replies = chat
                            .thread_replies(&fetch_channel, &message.ts)
                            .await
                            .unwrap_or_default();
                        message.thread_replies = replies.clone();
                        if tx.send(message).await.is_err() {
                            return Ok(());
                        }
                        for reply in replies {
                            if tx.send(reply).await.is_err() {
                                return Ok(());
                            }
                        }
                    } else if tx.send(message).await.is_err() {
                        return Ok(());
                    }
                }

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => return Ok::<(), Error>(()),
                }
            }
        });

        // Embed/upsert stage: batch, embed, upsert, advance the pending
        // high-water mark.
        let mut outcome = ChannelOutcome::default();
        let mut high_water: Option<String> = None;
        let mut batch: Vec<Message> = Vec::with_capacity(EMBED_TEXT_BATCH);
        let mut stage_err: Option<Error> = None;

        while let Some(message) = rx.recv().await {
            outcome.processed += 1;
            batch.push(message);

            if batch.len() >= EMBED_TEXT_BATCH {
                match self.process_batch(&channel.name, &mut batch).await {
                    Ok(ts) => {
                        outcome.embedded += ts.embedded;
                        outcome.upserted += ts.upserted;
                        merge_high_water(&mut high_water, ts.max_ts);
                    }
                    Err(e) => {
                        stage_err = Some(e);
                        break;
                    }
                }
                if self.shutting_down() {
                    info!(channel = %channel_id, "Shutdown requested, checkpointing early");
                    break;
                }
            }
        }
        // Stop the producer before the final flush.
        rx.close();

        if stage_err.is_none() && !batch.is_empty() {
            match self.process_batch(&channel.name, &mut batch).await {
                Ok(ts) => {
                    outcome.embedded += ts.embedded;
                    outcome.upserted += ts.upserted;
                    merge_high_water(&mut high_water, ts.max_ts);
                }
                Err(e) => stage_err = Some(e),
            }
        }

        let channel_err = stage_err.or(match fetch.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_err) => Some(Error::Internal(format!("fetch stage panicked: {}", join_err))),
        });

        // Acknowledged batches may be checkpointed after success or a
        // transient failure; a fatal abort leaves the checkpoint untouched.
        let (checkpoint, channel_err) = finalize_channel(high_water, channel_err);
        if let Some(ref ts) = checkpoint {
            self.state
                .advance_channel(channel_id, ts, outcome.upserted)
                .await?;
        }

        match channel_err {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Embed and upsert one batch of messages, in ascending `ts` order.
    async fn process_batch(
        &self,
        channel_name: &str,
        batch: &mut Vec<Message>,
    ) -> Result<BatchStats> {
        crate::chat::sort_ascending(batch);

        let mut texts: Vec<String> = Vec::new();
        let mut spans: Vec<(usize, usize)> = Vec::with_capacity(batch.len());
        let mut authors: Vec<String> = Vec::with_capacity(batch.len());

        for message in batch.iter() {
            let author = if message.user_id.is_empty() {
                "canvas".to_string()
            } else {
                match self.chat.user(&message.user_id).await {
                    Ok(user) => user.display().to_string(),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(_) => message.user_id.clone(),
                }
            };

            let embed_text = build_embedding_text(message, channel_name, &author);
            let chunks = chunk::chunk_text(
                &embed_text,
                self.config.chunk_size,
                self.config.chunk_overlap,
            );
            let start = texts.len();
            texts.extend(chunks);
            spans.push((start, texts.len()));
            authors.push(author);
        }

        let mut stats = BatchStats::default();
        if texts.is_empty() {
            return Ok(stats);
        }

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch_texts in texts.chunks(EMBED_TEXT_BATCH) {
            vectors.extend(self.embedder.embed_many(batch_texts).await?);
        }

        let mut records: Vec<VectorRecord> = Vec::with_capacity(texts.len());
        for ((message, (start, end)), author) in
            batch.iter().zip(spans.iter()).zip(authors.iter())
        {
            let chunk_total = end - start;
            for (chunk_index, offset) in (*start..*end).enumerate() {
                records.push(assemble_record(
                    message,
                    channel_name,
                    author,
                    chunk_index,
                    chunk_total,
                    &texts[offset],
                    std::mem::take(&mut vectors[offset]),
                ));
            }
            stats.embedded += 1;
        }

        for upsert_batch in records.chunks(store::UPSERT_BATCH_MAX) {
            self.store.upsert(upsert_batch).await?;
        }
        stats.upserted = batch.len() as u64;
        stats.max_ts = batch.last().map(|m| m.ts.clone());

        batch.clear();
        Ok(stats)
    }
}

#[derive(Debug, Default)]
struct BatchStats {
    embedded: u64,
    upserted: u64,
    max_ts: Option<String>,
}

/// Decide what a finished channel may checkpoint.
///
/// The pending high-water mark covers only successfully upserted batches,
/// so it is safe to write after a clean finish or a transient failure
/// (the next run resumes past the acknowledged prefix). A fatal error
/// aborts the run without advancing any checkpoint.
fn finalize_channel(
    high_water: Option<String>,
    channel_err: Option<Error>,
) -> (Option<String>, Option<Error>) {
    match channel_err {
        Some(e) if e.is_fatal() => (None, Some(e)),
        other => (high_water, other),
    }
}

fn merge_high_water(high_water: &mut Option<String>, candidate: Option<String>) {
    if let Some(candidate) = candidate {
        let newer = match high_water {
            Some(current) => {
                candidate.parse::<f64>().unwrap_or(0.0) > current.parse::<f64>().unwrap_or(0.0)
            }
            None => true,
        };
        if newer {
            *high_water = Some(candidate);
        }
    }
}

/// Turn a canvas document into the synthetic message the index carries.
fn canvas_message(canvas: Canvas) -> Message {
    Message {
        channel_id: canvas.channel_id,
        ts: canvas.created_ts,
        text: canvas.body,
        user_id: String::new(),
        thread_parent_ts: None,
        is_thread_root: false,
        reply_count: 0,
        reactions: Vec::new(),
        kind: MessageKind::Canvas,
        thread_replies: Vec::new(),
        canvas_title: Some(canvas.title),
    }
}

/// Build the text the embedding provider sees for one message: context
/// labels, the cleaned body, a reaction summary, and for thread roots a
/// bounded tail of reply excerpts.
pub fn build_embedding_text(message: &Message, channel_name: &str, author: &str) -> String {
    let mut parts = Vec::new();
    parts.push(format!("Channel: {}", channel_name));
    parts.push(format!("User: {}", author));

    match message.kind {
        MessageKind::Canvas => {
            if let Some(ref title) = message.canvas_title {
                parts.push(format!("Canvas: {}", title));
            }
            parts.push(format!("Canvas Content: {}", message.text));
        }
        MessageKind::ThreadReply => {
            parts.push("Thread Reply".to_string());
            parts.push(format!("Message: {}", message.text));
        }
        _ => {
            if message.is_thread_root && message.reply_count > 0 {
                parts.push(format!("Thread Parent ({} replies)", message.reply_count));
            }
            parts.push(format!("Message: {}", message.text));
        }
    }

    if let Some(summary) = message.reactions_summary() {
        parts.push(format!("Reactions: {}", summary));
    }

    if !message.thread_replies.is_empty() {
        let mut tail = String::new();
        for reply in &message.thread_replies {
            if tail.chars().count() >= THREAD_TAIL_MAX_CHARS {
                break;
            }
            if !tail.is_empty() {
                tail.push_str(" | ");
            }
            tail.push_str(&excerpt(&reply.text));
        }
        let tail: String = tail.chars().take(THREAD_TAIL_MAX_CHARS).collect();
        parts.push(format!("Replies: {}", tail));
    }

    parts.join("\n")
}

fn assemble_record(
    message: &Message,
    channel_name: &str,
    author: &str,
    chunk_index: usize,
    chunk_total: usize,
    chunk_text: &str,
    values: Vec<f32>,
) -> VectorRecord {
    let ts_secs = message.ts_secs();
    let iso_date = chrono::DateTime::from_timestamp(ts_secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    VectorRecord {
        id: message.vector_id(chunk_index, chunk_total),
        values,
        metadata: VectorMetadata {
            channel_id: message.channel_id.clone(),
            channel_name: channel_name.to_string(),
            user_id: message.user_id.clone(),
            user_name: author.to_string(),
            ts: message.ts.clone(),
            ts_secs,
            iso_date,
            thread_root_ts: message.thread_parent_ts.clone(),
            kind: message.kind,
            has_reactions: !message.reactions.is_empty(),
            chunk_index: chunk_index as u32,
            chunk_total: chunk_total as u32,
            text_excerpt: excerpt(chunk_text),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reaction;

    fn message(ts: &str, text: &str) -> Message {
        Message {
            channel_id: "C1".to_string(),
            ts: ts.to_string(),
            text: text.to_string(),
            user_id: "U1".to_string(),
            thread_parent_ts: None,
            is_thread_root: false,
            reply_count: 0,
            reactions: Vec::new(),
            kind: MessageKind::Message,
            thread_replies: Vec::new(),
            canvas_title: None,
        }
    }

    #[test]
    fn test_embedding_text_plain_message() {
        let msg = message("1.000000", "deploy finished");
        let text = build_embedding_text(&msg, "engineering", "jamie");
        assert!(text.contains("Channel: engineering"));
        assert!(text.contains("User: jamie"));
        assert!(text.contains("Message: deploy finished"));
        assert!(!text.contains("Reactions:"));
    }

    #[test]
    fn test_embedding_text_with_reactions_and_replies() {
        let mut msg = message("1.000000", "release plan");
        msg.is_thread_root = true;
        msg.reply_count = 2;
        msg.reactions = vec![Reaction {
            name: "rocket".into(),
            users: vec!["U2".into()],
            count: 2,
        }];
        msg.thread_replies = vec![
            message("2.000000", "looks good"),
            message("3.000000", "shipping friday"),
        ];

        let text = build_embedding_text(&msg, "engineering", "jamie");
        assert!(text.contains("Thread Parent (2 replies)"));
        assert!(text.contains("Reactions: rocket(2)"));
        assert!(text.contains("Replies: looks good | shipping friday"));
    }

    #[test]
    fn test_embedding_text_reply_tail_bounded() {
        let mut msg = message("1.000000", "root");
        msg.thread_replies = (0..50)
            .map(|i| message(&format!("{}.000000", i + 2), &"reply text ".repeat(20)))
            .collect();

        let text = build_embedding_text(&msg, "general", "jamie");
        let tail = text.lines().last().unwrap();
        assert!(tail.chars().count() <= THREAD_TAIL_MAX_CHARS + "Replies: ".len());
    }

    #[test]
    fn test_embedding_text_canvas() {
        let canvas = canvas_message(Canvas {
            id: "F1".into(),
            title: "Team Charter".into(),
            body: "Our goals.".into(),
            channel_id: "C1".into(),
            created_ts: "100.000000".into(),
        });
        let text = build_embedding_text(&canvas, "general", "canvas");
        assert!(text.contains("Canvas: Team Charter"));
        assert!(text.contains("Canvas Content: Our goals."));
    }

    #[test]
    fn test_assemble_record_metadata() {
        let mut msg = message("1718000000.000100", "hello world");
        msg.reactions = vec![Reaction {
            name: "eyes".into(),
            users: vec![],
            count: 1,
        }];

        let record = assemble_record(&msg, "engineering", "jamie", 0, 1, "chunked text", vec![0.0; 4]);
        assert_eq!(record.id, "C1:1718000000.000100");
        assert_eq!(record.metadata.channel_name, "engineering");
        assert_eq!(record.metadata.user_name, "jamie");
        assert_eq!(record.metadata.iso_date, "2024-06-10");
        assert!(record.metadata.has_reactions);
        assert_eq!(record.metadata.chunk_total, 1);
        assert_eq!(record.metadata.text_excerpt, "chunked text");
    }

    #[test]
    fn test_assemble_record_chunked_ids() {
        let msg = message("5.000000", "x");
        let a = assemble_record(&msg, "g", "u", 0, 2, "a", vec![]);
        let b = assemble_record(&msg, "g", "u", 1, 2, "b", vec![]);
        assert_eq!(a.id, "C1:5.000000:0");
        assert_eq!(b.id, "C1:5.000000:1");
        assert_eq!(a.metadata.chunk_total, 2);
    }

    #[tokio::test]
    async fn test_fatal_second_batch_leaves_checkpoint_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let state = crate::state::StateStore::load(&dir.path().join("state.json")).unwrap();
        state.advance_channel("C1", "3.000000", 3).await.unwrap();

        // A channel larger than one embed batch: the first batch upserts
        // and advances the pending high-water mark, the second hits a
        // fatal embedding failure.
        let mut high_water = None;
        merge_high_water(&mut high_water, Some("67.000000".to_string()));
        let stage_err = Some(Error::DimensionMismatch {
            expected: 1536,
            got: 768,
        });

        let (checkpoint, err) = finalize_channel(high_water, stage_err);
        assert!(checkpoint.is_none(), "fatal abort must not checkpoint");
        assert!(err.unwrap().is_fatal());

        // Nothing was written, so the checkpoint stays at its pre-run value.
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.channels["C1"].last_ingested_ts, "3.000000");
        assert_eq!(snapshot.channels["C1"].message_count, 3);
    }

    #[test]
    fn test_transient_failure_keeps_acknowledged_batches() {
        use crate::error::Provider;

        let (checkpoint, err) = finalize_channel(
            Some("67.000000".to_string()),
            Some(Error::UpstreamTimeout {
                provider: Provider::Chat,
            }),
        );
        assert_eq!(checkpoint.as_deref(), Some("67.000000"));
        assert!(!err.unwrap().is_fatal());
    }

    #[test]
    fn test_clean_finish_checkpoints_high_water() {
        let (checkpoint, err) = finalize_channel(Some("5.000000".to_string()), None);
        assert_eq!(checkpoint.as_deref(), Some("5.000000"));
        assert!(err.is_none());

        let (checkpoint, err) = finalize_channel(None, None);
        assert!(checkpoint.is_none());
        assert!(err.is_none());
    }

    #[test]
    fn test_merge_high_water_monotonic() {
        let mut hwm = None;
        merge_high_water(&mut hwm, Some("3.000000".to_string()));
        assert_eq!(hwm.as_deref(), Some("3.000000"));
        merge_high_water(&mut hwm, Some("2.000000".to_string()));
        assert_eq!(hwm.as_deref(), Some("3.000000"));
        merge_high_water(&mut hwm, Some("5.000000".to_string()));
        assert_eq!(hwm.as_deref(), Some("5.000000"));
        merge_high_water(&mut hwm, None);
        assert_eq!(hwm.as_deref(), Some("5.000000"));
    }
}
