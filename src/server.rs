//! JSON-RPC 2.0 request server.
//!
//! A single `POST /mcp` endpoint accepts `initialize`, `tools/list`,
//! `tools/call`, and `ping`. Bearer-token authentication guards every
//! method; all methods after `initialize` additionally require a valid
//! `Mcp-Session-Id` header.
//!
//! # Error contract
//!
//! | Code | Meaning |
//! |------|---------|
//! | `-32600` | malformed request envelope |
//! | `-32601` | unknown method or tool |
//! | `-32602` | invalid tool parameters |
//! | `-32001` | authentication failed |
//! | `-32002` | session invalid or expired |
//! | `-32003` | upstream provider failure (`data: {provider, retryable}`) |
//! | `-32004` | service not ready |
//! | `-32603` | internal error (includes recovered handler panics) |
//!
//! Transport status is HTTP 200 for protocol-level errors, with two
//! exceptions: `initialize` without credentials is rejected with HTTP 401,
//! and a session over its request rate gets HTTP 429.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::ApiKeys;
use crate::config::Config;
use crate::error::Error;
use crate::search::{SearchOverrides, SearchService};
use crate::session::{Admission, SessionManager};
use crate::tools;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const CODE_MALFORMED: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL: i64 = -32603;
pub const CODE_AUTH_FAILED: i64 = -32001;
pub const CODE_SESSION_INVALID: i64 = -32002;
pub const CODE_UPSTREAM_FAILURE: i64 = -32003;
pub const CODE_NOT_READY: i64 = -32004;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<ApiKeys>,
    pub sessions: Arc<SessionManager>,
    pub search: Arc<SearchService>,
}

/// The full outcome of dispatching one request: transport status, JSON
/// payload, and an optional session header to set on the response.
pub struct RpcOutcome {
    pub status: StatusCode,
    pub payload: Value,
    pub session_id: Option<String>,
}

impl RpcOutcome {
    fn ok(payload: Value) -> Self {
        Self {
            status: StatusCode::OK,
            payload,
            session_id: None,
        }
    }
}

/// Run the request server until the shutdown signal fires, then drain.
pub async fn run_server(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = state.config.listen_addr;

    // Expired-session sweep, every ten minutes.
    let sessions = Arc::clone(&state.sessions);
    let mut purge_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            tokio::select! {
                _ = interval.tick() => sessions.purge_expired().await,
                _ = purge_shutdown.changed() => return,
            }
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Request server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = match state.config.cors_origins {
        Some(ref origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any),
    };

    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = dispatch(&state, &headers, &body).await;

    let mut response = (outcome.status, Json(outcome.payload)).into_response();
    if let Some(session_id) = outcome.session_id {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response.headers_mut().insert("Mcp-Session-Id", value);
        }
    }
    response
}

/// Parse, authenticate, and route one JSON-RPC request.
pub async fn dispatch(state: &AppState, headers: &HeaderMap, body: &[u8]) -> RpcOutcome {
    let Ok(request) = serde_json::from_slice::<Value>(body) else {
        return RpcOutcome::ok(rpc_error(Value::Null, CODE_MALFORMED, "Malformed request", None));
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return RpcOutcome::ok(rpc_error(id, CODE_MALFORMED, "Malformed request", None));
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return RpcOutcome::ok(rpc_error(id, CODE_MALFORMED, "Malformed request", None));
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
    let authenticated = state.auth.verify(auth_header).is_ok();

    if method == "initialize" {
        // Unauthenticated initialize is rejected at the connection level.
        if !authenticated {
            return RpcOutcome {
                status: StatusCode::UNAUTHORIZED,
                payload: rpc_error(id, CODE_AUTH_FAILED, "Authentication failed", None),
                session_id: None,
            };
        }
        return handle_initialize(state, id).await;
    }

    if !authenticated {
        return RpcOutcome::ok(rpc_error(id, CODE_AUTH_FAILED, "Authentication failed", None));
    }

    let session_header = headers.get("Mcp-Session-Id").and_then(|v| v.to_str().ok());
    match state.sessions.admit(session_header).await {
        Admission::Ok => {}
        Admission::Invalid => {
            return RpcOutcome::ok(rpc_error(id, CODE_SESSION_INVALID, "Session invalid", None));
        }
        Admission::OverRate => {
            warn!(session = ?session_header, "Session over request rate");
            return RpcOutcome {
                status: StatusCode::TOO_MANY_REQUESTS,
                payload: json!({ "error": "session request rate exceeded" }),
                session_id: None,
            };
        }
    }

    match method {
        "ping" => RpcOutcome::ok(rpc_result(id, json!({}))),
        "tools/list" => RpcOutcome::ok(rpc_result(id, json!({ "tools": tools::descriptors() }))),
        "tools/call" => handle_tools_call(state, id, params).await,
        other => {
            warn!(method = other, "Unknown method");
            RpcOutcome::ok(rpc_error(id, CODE_METHOD_NOT_FOUND, "Method not found", None))
        }
    }
}

async fn handle_initialize(state: &AppState, id: Value) -> RpcOutcome {
    let session = state.sessions.create("bearer").await;
    let session_id = session.id.to_string();

    let result = json!({
        "session_id": session_id,
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false },
        },
        "server_info": {
            "name": "chatter-search",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    RpcOutcome {
        status: StatusCode::OK,
        payload: rpc_result(id, result),
        session_id: Some(session_id),
    }
}

async fn handle_tools_call(state: &AppState, id: Value, params: Value) -> RpcOutcome {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return RpcOutcome::ok(rpc_error(
            id,
            CODE_INVALID_PARAMS,
            "Invalid params: 'name' is required",
            None,
        ));
    };

    if !tools::is_known_tool(name) {
        return RpcOutcome::ok(rpc_error(id, CODE_METHOD_NOT_FOUND, "Method not found", None));
    }

    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let name = name.to_string();
    let task_state = state.clone();

    // Run the handler on its own task so a panic is recovered here and
    // reported as an internal error instead of tearing down the server.
    let handle = tokio::spawn(async move { call_tool(&task_state, &name, arguments).await });

    match handle.await {
        Ok(Ok(result)) => RpcOutcome::ok(rpc_result(id, result)),
        Ok(Err(ToolError::InvalidParams(message))) => RpcOutcome::ok(rpc_error(
            id,
            CODE_INVALID_PARAMS,
            &format!("Invalid params: {}", message),
            None,
        )),
        Ok(Err(ToolError::Failed(e))) => {
            let (code, data) = match &e {
                Error::NotReady => (CODE_NOT_READY, None),
                _ => (
                    CODE_UPSTREAM_FAILURE,
                    Some(json!({
                        "provider": e.provider().map(|p| p.as_str()),
                        "retryable": e.retryable(),
                    })),
                ),
            };
            warn!(error = %e, "Tool call failed");
            RpcOutcome::ok(rpc_error(id, code, &e.to_string(), data))
        }
        Err(join_err) => {
            error!(error = %join_err, "Tool handler panicked");
            RpcOutcome::ok(rpc_error(id, CODE_INTERNAL, "Internal error", None))
        }
    }
}

enum ToolError {
    InvalidParams(String),
    Failed(Error),
}

async fn call_tool(state: &AppState, name: &str, arguments: Value) -> Result<Value, ToolError> {
    match name {
        tools::TOOL_SEARCH => {
            let args = tools::validate_search_args(&arguments)
                .map_err(|e| ToolError::InvalidParams(e.to_string()))?;
            // No completed run and an empty index: nothing to search yet.
            if !state.search.ready().await {
                return Err(ToolError::Failed(Error::NotReady));
            }
            let overrides = SearchOverrides {
                skip_enhancement: false,
                top_k: args.top_k,
                channel_filter: args.channel_filter,
                user_filter: args.user_filter,
                date_from: args.date_from,
                date_to: args.date_to,
            };
            let response = state
                .search
                .search(&args.query, &overrides)
                .await
                .map_err(ToolError::Failed)?;
            Ok(tools::tool_content(
                serde_json::to_value(&response).unwrap_or(Value::Null),
                false,
            ))
        }
        tools::TOOL_LIST_CHANNELS => {
            let channels = state.search.list_channels().await;
            let listed: Vec<Value> = channels
                .iter()
                .map(|c| json!({ "id": c.id, "name": c.name, "is_member": c.is_member }))
                .collect();
            Ok(tools::tool_content(json!({ "channels": listed }), false))
        }
        tools::TOOL_STATS => {
            let stats = state.search.stats().await.map_err(ToolError::Failed)?;
            Ok(tools::tool_content(
                serde_json::to_value(&stats).unwrap_or(Value::Null),
                false,
            ))
        }
        _ => Err(ToolError::InvalidParams(format!("unknown tool: {}", name))),
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_envelopes() {
        let ok = rpc_result(json!(1), json!({ "x": 1 }));
        assert_eq!(ok["jsonrpc"], "2.0");
        assert_eq!(ok["id"], 1);
        assert_eq!(ok["result"]["x"], 1);

        let err = rpc_error(json!("abc"), CODE_METHOD_NOT_FOUND, "Method not found", None);
        assert_eq!(err["error"]["code"], -32601);
        assert_eq!(err["error"]["message"], "Method not found");
        assert!(err["error"].get("data").is_none());

        let err = rpc_error(
            Value::Null,
            CODE_UPSTREAM_FAILURE,
            "boom",
            Some(json!({ "retryable": true })),
        );
        assert_eq!(err["error"]["data"]["retryable"], true);
    }
}
