//! Persistence behavior across restarts: the local vector journal and the
//! ingestion checkpoint file, exercised the way an initial run followed by
//! an incremental run exercises them.

use std::path::Path;

use chatter_search::models::{MessageKind, VectorMetadata, VectorRecord};
use chatter_search::state::StateStore;
use chatter_search::store::local::LocalStore;
use chatter_search::store::{Filter, VectorStore};

fn record(channel: &str, ts: &str, values: Vec<f32>) -> VectorRecord {
    let ts_secs: f64 = ts.parse().unwrap();
    VectorRecord {
        id: format!("{}:{}", channel, ts),
        values,
        metadata: VectorMetadata {
            channel_id: channel.to_string(),
            channel_name: "engineering".to_string(),
            user_id: "U1".to_string(),
            user_name: "jamie".to_string(),
            ts: ts.to_string(),
            ts_secs,
            iso_date: "2024-06-10".to_string(),
            thread_root_ts: None,
            kind: MessageKind::Message,
            has_reactions: false,
            chunk_index: 0,
            chunk_total: 1,
            text_excerpt: format!("message at {}", ts),
        },
    }
}

async fn open_store(dir: &Path) -> LocalStore {
    LocalStore::open(&dir.join("vectors.ndjson")).unwrap()
}

#[tokio::test]
async fn initial_run_persists_vectors_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let state = StateStore::load(&dir.path().join("state.json")).unwrap();

    // Initial run over a three-message channel.
    let run_id = state.begin_run().await.unwrap();
    assert_eq!(run_id, 1);

    store
        .upsert(&[
            record("C", "1.000000", vec![1.0, 0.0]),
            record("C", "2.000000", vec![0.9, 0.1]),
            record("C", "3.000000", vec![0.5, 0.5]),
        ])
        .await
        .unwrap();
    state.advance_channel("C", "3.000000", 3).await.unwrap();
    state.mark_first_run_complete().await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_vectors, 3);
    assert_eq!(stats.channels, vec!["C".to_string()]);

    let snapshot = state.snapshot().await;
    assert!(snapshot.first_run_completed);
    assert_eq!(snapshot.channels["C"].last_ingested_ts, "3.000000");
    assert_eq!(snapshot.channels["C"].message_count, 3);
}

#[tokio::test]
async fn incremental_run_adds_only_new_messages() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open_store(dir.path()).await;
        let state = StateStore::load(&dir.path().join("state.json")).unwrap();
        state.begin_run().await.unwrap();
        store
            .upsert(&[
                record("C", "1.000000", vec![1.0, 0.0]),
                record("C", "2.000000", vec![0.9, 0.1]),
                record("C", "3.000000", vec![0.5, 0.5]),
            ])
            .await
            .unwrap();
        state.advance_channel("C", "3.000000", 3).await.unwrap();
        state.mark_first_run_complete().await.unwrap();
    }

    // Restart: both stores reload from disk, then one new message arrives.
    let store = open_store(dir.path()).await;
    let state = StateStore::load(&dir.path().join("state.json")).unwrap();
    let snapshot = state.snapshot().await;
    assert_eq!(snapshot.channels["C"].last_ingested_ts, "3.000000");

    let run_id = state.begin_run().await.unwrap();
    assert_eq!(run_id, 2);
    store
        .upsert(&[record("C", "5.000000", vec![0.2, 0.8])])
        .await
        .unwrap();
    state.advance_channel("C", "5.000000", 1).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_vectors, 4);

    let snapshot = state.snapshot().await;
    assert_eq!(snapshot.channels["C"].last_ingested_ts, "5.000000");
    assert_eq!(snapshot.channels["C"].message_count, 4);
}

#[tokio::test]
async fn reingesting_same_range_produces_identical_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let batch = vec![
        record("C", "1.000000", vec![1.0, 0.0]),
        record("C", "2.000000", vec![0.9, 0.1]),
    ];
    store.upsert(&batch).await.unwrap();
    store.upsert(&batch).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_vectors, 2);

    let hits = store
        .query(&[1.0, 0.0], 10, &Filter::default())
        .await
        .unwrap();
    let mut ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["C:1.000000", "C:2.000000"]);
}

#[tokio::test]
async fn query_respects_channel_filter_and_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    // Five engineering messages and ten unrelated ones.
    let mut records = Vec::new();
    for i in 0..5 {
        records.push(record("ENG", &format!("{}.000000", i + 1), vec![1.0, 0.0]));
    }
    for i in 0..10 {
        records.push(record("MISC", &format!("{}.000000", i + 100), vec![0.0, 1.0]));
    }
    store.upsert(&records).await.unwrap();

    let filter = Filter {
        channel_id: Some("ENG".to_string()),
        ..Default::default()
    };
    let hits = store.query(&[1.0, 0.0], 3, &filter).await.unwrap();

    assert_eq!(hits.len(), 3);
    for hit in &hits {
        assert_eq!(hit.metadata.channel_id, "ENG");
    }
    // Equal scores, so ties break by ts descending.
    assert_eq!(hits[0].metadata.ts, "5.000000");
    assert_eq!(hits[1].metadata.ts, "4.000000");
    assert_eq!(hits[2].metadata.ts, "3.000000");
}

#[tokio::test]
async fn date_range_filter_selects_inclusive_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let march_1 = chatter_search::search::day_bound("2024-03-01", false).unwrap();
    let march_31_end = chatter_search::search::day_bound("2024-03-31", true).unwrap();
    let feb_29 = march_1 - 86_400;
    let april_1 = march_31_end + 1;

    store
        .upsert(&[
            record("C", &format!("{}.000000", feb_29), vec![1.0, 0.0]),
            record("C", &format!("{}.000000", march_1), vec![1.0, 0.0]),
            record("C", &format!("{}.000000", march_31_end), vec![1.0, 0.0]),
            record("C", &format!("{}.000000", april_1), vec![1.0, 0.0]),
        ])
        .await
        .unwrap();

    let filter = Filter {
        ts_from: Some(march_1),
        ts_to: Some(march_31_end),
        ..Default::default()
    };
    let hits = store.query(&[1.0, 0.0], 10, &filter).await.unwrap();

    let mut ts: Vec<f64> = hits.iter().map(|h| h.metadata.ts_secs).collect();
    ts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(ts, vec![march_1 as f64, march_31_end as f64]);
}

#[tokio::test]
async fn flush_compacts_journal_to_current_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vectors.ndjson");
    let store = LocalStore::open(&path).unwrap();

    let rec = record("C", "1.000000", vec![1.0, 0.0]);
    // Many overwrites of the same id grow the journal.
    for _ in 0..10 {
        store.upsert(&[rec.clone()]).await.unwrap();
    }
    store.flush().await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 1, "compaction rewrites one line per live vector");

    // And the rewritten journal still loads.
    drop(store);
    let store = LocalStore::open(&path).unwrap();
    assert_eq!(store.stats().await.unwrap().total_vectors, 1);
}
