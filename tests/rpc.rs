//! JSON-RPC dispatch behavior: authentication, sessions, envelope
//! validation, and the tool registry, driven through the server's dispatch
//! entry point with a locally-backed service.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

use chatter_search::auth::ApiKeys;
use chatter_search::chat::ChatClient;
use chatter_search::config::{Config, API_KEY_PREFIX};
use chatter_search::embedding::EmbeddingClient;
use chatter_search::enhancer::QueryEnhancer;
use chatter_search::governor::RateGovernor;
use chatter_search::search::SearchService;
use chatter_search::server::{dispatch, AppState, RpcOutcome};
use chatter_search::session::SessionManager;
use chatter_search::state::StateStore;
use chatter_search::store::local::LocalStore;

fn api_key() -> String {
    format!("{}{}", API_KEY_PREFIX, "4f".repeat(24))
}

fn test_state(dir: &TempDir) -> AppState {
    let mut config = Config::default();
    config.chat_bot_token = "xoxb-test".into();
    config.chat_channels = vec!["C1".into()];
    config.embed_api_key = "sk-test".into();
    config.api_keys = vec![api_key()];
    // A prompt path that does not exist disables enhancement.
    config.enhancer_prompt_path = dir.path().join("missing-prompt.toml");
    config.vector_local_path = dir.path().join("vectors.ndjson");
    config.state_path = dir.path().join("state.json");
    let config = Arc::new(config);

    let governor = Arc::new(RateGovernor::new(&config));
    let chat = Arc::new(ChatClient::new(&config, Arc::clone(&governor)).unwrap());
    let embedder = Arc::new(EmbeddingClient::new(&config, Arc::clone(&governor)).unwrap());
    let enhancer = Arc::new(QueryEnhancer::new(&config, Arc::clone(&governor)).unwrap());
    let store = Arc::new(LocalStore::open(&config.vector_local_path).unwrap());
    let state = Arc::new(StateStore::load(&config.state_path).unwrap());

    let search = Arc::new(SearchService::new(
        Arc::clone(&config),
        chat,
        embedder,
        enhancer,
        store,
        state,
    ));

    AppState {
        auth: Arc::new(ApiKeys::new(&config)),
        sessions: Arc::new(SessionManager::new()),
        search,
        config,
    }
}

fn authed_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", api_key())).unwrap(),
    );
    headers
}

async fn send(state: &AppState, headers: &HeaderMap, request: Value) -> RpcOutcome {
    dispatch(state, headers, request.to_string().as_bytes()).await
}

async fn initialize(state: &AppState) -> (HeaderMap, String) {
    let outcome = send(
        state,
        &authed_headers(),
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    let session_id = outcome.payload["result"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let mut headers = authed_headers();
    headers.insert(
        "Mcp-Session-Id",
        HeaderValue::from_str(&session_id).unwrap(),
    );
    (headers, session_id)
}

#[tokio::test]
async fn initialize_without_auth_is_http_401() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let outcome = send(
        &state,
        &HeaderMap::new(),
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
    assert_eq!(outcome.payload["error"]["code"], -32001);
}

#[tokio::test]
async fn initialize_creates_session_and_returns_server_info() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let outcome = send(
        &state,
        &authed_headers(),
        json!({ "jsonrpc": "2.0", "id": 7, "method": "initialize" }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    assert_eq!(outcome.payload["id"], 7);
    assert_eq!(outcome.payload["result"]["server_info"]["name"], "chatter-search");
    assert!(outcome.payload["result"]["session_id"].is_string());
    // The session id is also surfaced as a response header.
    assert_eq!(
        outcome.session_id.as_deref(),
        outcome.payload["result"]["session_id"].as_str()
    );
}

#[tokio::test]
async fn other_methods_without_auth_are_http_200_with_rpc_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let outcome = send(
        &state,
        &HeaderMap::new(),
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    assert_eq!(outcome.payload["error"]["code"], -32001);
    assert_eq!(outcome.payload["error"]["message"], "Authentication failed");
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let mut headers = HeaderMap::new();
    let wrong = format!("Bearer {}{}", API_KEY_PREFIX, "00".repeat(24));
    headers.insert("authorization", HeaderValue::from_str(&wrong).unwrap());

    let outcome = send(
        &state,
        &headers,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    assert_eq!(outcome.payload["error"]["code"], -32001);
}

#[tokio::test]
async fn missing_session_is_rpc_error_32002() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let outcome = send(
        &state,
        &authed_headers(),
        json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    assert_eq!(outcome.payload["error"]["code"], -32002);
}

#[tokio::test]
async fn tools_list_returns_three_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    let outcome = send(
        &state,
        &headers,
        json!({ "jsonrpc": "2.0", "id": 4, "method": "tools/list" }),
    )
    .await;
    let tools = outcome.payload["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 3);
    assert_eq!(tools[0]["name"], "search_messages");
    assert!(tools[0]["inputSchema"]["properties"]["query"].is_object());
}

#[tokio::test]
async fn unknown_tool_is_method_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    let outcome = send(
        &state,
        &headers,
        json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": { "name": "delete_everything", "arguments": {} },
        }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    assert_eq!(outcome.payload["error"]["code"], -32601);
    assert_eq!(outcome.payload["error"]["message"], "Method not found");
}

#[tokio::test]
async fn invalid_search_params_are_32602() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    let outcome = send(
        &state,
        &headers,
        json!({
            "jsonrpc": "2.0", "id": 6, "method": "tools/call",
            "params": { "name": "search_messages", "arguments": { "query": "q", "date_from": "03/01/2024" } },
        }),
    )
    .await;
    assert_eq!(outcome.payload["error"]["code"], -32602);
}

#[tokio::test]
async fn unknown_method_is_32601() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    let outcome = send(
        &state,
        &headers,
        json!({ "jsonrpc": "2.0", "id": 8, "method": "resources/list" }),
    )
    .await;
    assert_eq!(outcome.payload["error"]["code"], -32601);
}

#[tokio::test]
async fn malformed_bodies_are_32600() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    let outcome = dispatch(&state, &authed_headers(), b"{not json").await;
    assert_eq!(outcome.payload["error"]["code"], -32600);

    // Valid JSON, wrong protocol version.
    let outcome = send(
        &state,
        &authed_headers(),
        json!({ "jsonrpc": "1.0", "id": 9, "method": "ping" }),
    )
    .await;
    assert_eq!(outcome.payload["error"]["code"], -32600);

    // Missing method.
    let outcome = send(&state, &authed_headers(), json!({ "jsonrpc": "2.0", "id": 9 })).await;
    assert_eq!(outcome.payload["error"]["code"], -32600);
}

#[tokio::test]
async fn stats_tool_reports_empty_index() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    let outcome = send(
        &state,
        &headers,
        json!({
            "jsonrpc": "2.0", "id": 10, "method": "tools/call",
            "params": { "name": "stats", "arguments": {} },
        }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    let text = outcome.payload["result"]["content"][0]["text"].as_str().unwrap();
    let stats: Value = serde_json::from_str(text).unwrap();
    assert_eq!(stats["total_vectors"], 0);
    assert_eq!(stats["channels_indexed"], 0);
}

fn seed_record() -> chatter_search::models::VectorRecord {
    use chatter_search::models::{MessageKind, VectorMetadata, VectorRecord};
    VectorRecord {
        id: "C1:1.000000".to_string(),
        values: vec![1.0, 0.0],
        metadata: VectorMetadata {
            channel_id: "C1".to_string(),
            channel_name: "engineering".to_string(),
            user_id: "U1".to_string(),
            user_name: "jamie".to_string(),
            ts: "1.000000".to_string(),
            ts_secs: 1.0,
            iso_date: "2024-06-10".to_string(),
            thread_root_ts: None,
            kind: MessageKind::Message,
            has_reactions: false,
            chunk_index: 0,
            chunk_total: 1,
            text_excerpt: "deploy finished".to_string(),
        },
    }
}

#[tokio::test]
async fn search_before_first_run_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    // No completed ingestion run and an empty index.
    assert!(!state.search.ready().await);

    let outcome = send(
        &state,
        &headers,
        json!({
            "jsonrpc": "2.0", "id": 20, "method": "tools/call",
            "params": { "name": "search_messages", "arguments": { "query": "deploy" } },
        }),
    )
    .await;
    assert_eq!(outcome.status, StatusCode::OK);
    assert_eq!(outcome.payload["error"]["code"], -32004);
}

#[tokio::test]
async fn readiness_flips_once_index_holds_vectors() {
    let dir = tempfile::tempdir().unwrap();
    {
        let state = test_state(&dir);
        assert!(!state.search.ready().await);
    }

    // Seed the index file the way a previous deployment's run would have.
    {
        use chatter_search::store::VectorStore;
        let store = LocalStore::open(&dir.path().join("vectors.ndjson")).unwrap();
        store.upsert(&[seed_record()]).await.unwrap();
    }

    let state = test_state(&dir);
    assert!(state.search.ready().await);
}

#[tokio::test]
async fn session_expiry_returns_32002() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);

    // A syntactically valid session id that was never created behaves the
    // same as an expired one: removed-or-absent is indistinguishable.
    let mut headers = authed_headers();
    headers.insert(
        "Mcp-Session-Id",
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).unwrap(),
    );

    let outcome = send(
        &state,
        &headers,
        json!({ "jsonrpc": "2.0", "id": 11, "method": "ping" }),
    )
    .await;
    assert_eq!(outcome.payload["error"]["code"], -32002);
}

#[tokio::test]
async fn ping_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let (headers, _) = initialize(&state).await;

    let outcome = send(
        &state,
        &headers,
        json!({ "jsonrpc": "2.0", "id": 12, "method": "ping" }),
    )
    .await;
    assert_eq!(outcome.payload["result"], json!({}));
}
