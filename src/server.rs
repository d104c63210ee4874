//! Client-facing gateway server.
//!
//! Accepts one WebSocket per session, authenticates the handshake query
//! parameters against the account key, and hands the upgraded socket to a
//! [`Pipeline`]. Plain HTTP routes expose liveness and usage totals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::auth::{verify_session_auth, AccountKeys};
use crate::config::Config;
use crate::events::ApiStyle;
use crate::persist::{FileStore, Persistence};
use crate::provider::UpstreamConnector;
use crate::session::pipeline::{Pipeline, SessionParams, SwitchTuning};

/// Maximum HTTP request body size. WebSocket frames are not affected.
const MAX_BODY_SIZE: usize = 65_536;

/// Plain-HTTP request timeout (seconds).
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ── Storage selection ─────────────────────────────────────────────

/// How sessions obtain their persistence handle.
#[derive(Clone)]
pub enum StoreMode {
    /// One process-wide backend shared by every session.
    Shared(Arc<dyn Persistence>),
    /// A fresh file-tree backend per session, rooted at this directory.
    PerSession(PathBuf),
}

impl StoreMode {
    fn for_session(&self) -> Arc<dyn Persistence> {
        match self {
            Self::Shared(store) => Arc::clone(store),
            Self::PerSession(base) => Arc::new(FileStore::new(base.clone())),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    keys: Arc<AccountKeys>,
    store_mode: StoreMode,
    connector: Arc<dyn UpstreamConnector>,
}

pub struct Gateway {
    config: Arc<Config>,
    state: AppState,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        keys: Arc<AccountKeys>,
        store_mode: StoreMode,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        let state = AppState {
            config: Arc::clone(&config),
            keys,
            store_mode,
            connector,
        };
        Self { config, state }
    }

    fn router(&self) -> Router {
        // The timeout bounds response production only; an upgraded session
        // outlives it.
        Router::new()
            .route("/health", get(health_handler))
            .route("/usage", get(usage_handler))
            .route("/ws", get(ws_handler))
            .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
            .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
            .with_state(self.state.clone())
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Binding {addr}"))?;
        tracing::info!(addr, "Gateway listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ── Plain HTTP handlers ───────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "voxswitch",
    })
}

#[derive(Deserialize)]
struct UsageQuery {
    account: String,
    from_ms: Option<i64>,
    to_ms: Option<i64>,
}

async fn usage_handler(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Response {
    let store = state.store_mode.for_session();
    match store
        .usage_sum(&query.account, query.from_ms, query.to_ms)
        .await
    {
        Ok(Some(totals)) => Json(serde_json::json!({ "totalTokens": totals.total_tokens }))
            .into_response(),
        Ok(None) => Json(serde_json::json!({ "totalTokens": null })).into_response(),
        Err(e) => {
            tracing::error!(account = query.account, error = %e, "Usage lookup failed");
            (StatusCode::SERVICE_UNAVAILABLE, "usage accounting unavailable").into_response()
        }
    }
}

// ── WebSocket handshake ───────────────────────────────────────────

/// Validate the handshake query parameters and resolve the session
/// identity. Missing parameters reject with 400, authentication failures
/// with 403.
async fn authorize(
    keys: &AccountKeys,
    params: &HashMap<String, String>,
) -> Result<SessionParams, (StatusCode, &'static str)> {
    let account_id = params
        .get("rs_accid")
        .filter(|v| !v.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing rs_accid"))?;
    let session_id = params
        .get("rs_u_sessid")
        .filter(|v| !v.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing rs_u_sessid"))?;
    let auth = params
        .get("rs_auth")
        .filter(|v| !v.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "missing rs_auth"))?;

    let style = match params.get("rs_api") {
        Some(tag) => {
            ApiStyle::from_tag(tag).ok_or((StatusCode::BAD_REQUEST, "unknown rs_api"))?
        }
        None => ApiStyle::OpenAi,
    };
    let provider = match params.get("rs_core") {
        Some(tag) => {
            ApiStyle::from_tag(tag).ok_or((StatusCode::BAD_REQUEST, "unknown rs_core"))?
        }
        None => style,
    };

    let Some(key) = keys.lookup(account_id).await else {
        tracing::warn!(account_id, "Rejecting session for unknown account");
        return Err((StatusCode::FORBIDDEN, "authentication failed"));
    };
    if !verify_session_auth(&key, session_id, auth) {
        tracing::warn!(account_id, session_id, "Rejecting session with bad signature");
        return Err((StatusCode::FORBIDDEN, "authentication failed"));
    }

    Ok(SessionParams {
        style,
        provider,
        account_id: account_id.clone(),
        session_id: session_id.clone(),
    })
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match authorize(&state.keys, &params).await {
        Ok(session) => session,
        Err((status, message)) => return (status, message).into_response(),
    };

    tracing::info!(
        account_id = %session.account_id,
        session_id = %session.session_id,
        style = %session.style,
        provider = %session.provider,
        "Session accepted"
    );

    ws.on_upgrade(move |socket| run_session(socket, state, session))
}

/// Bridge one upgraded socket to a session pipeline: inbound text frames
/// become client events, pipeline output becomes outbound text frames.
async fn run_session(socket: WebSocket, state: AppState, session: SessionParams) {
    let session_id = session.session_id.clone();

    let (downstream_tx, mut downstream_rx) = mpsc::unbounded_channel::<String>();
    let (client_tx, client_rx) = mpsc::unbounded_channel::<Value>();

    let pipeline = Pipeline::new(
        session,
        downstream_tx,
        state.store_mode.for_session(),
        Arc::clone(&state.connector),
        SwitchTuning::from_config(&state.config),
    );
    let session_task = tokio::spawn(pipeline.run(client_rx));

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer_session_id = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(json) = downstream_rx.recv().await {
            if ws_tx.send(Message::Text(json)).await.is_err() {
                tracing::debug!(
                    session_id = %writer_session_id,
                    "Client socket writer closed"
                );
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(raw) => {
                    if client_tx.send(raw).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Malformed client frame dropped"
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Client socket error");
                break;
            }
        }
    }

    // Ending the client channel lets the pipeline loop finish and clean up.
    drop(client_tx);
    if let Err(e) = session_task.await {
        tracing::error!(session_id = %session_id, error = %e, "Session task panicked");
    }
    writer.abort();
    tracing::info!(session_id = %session_id, "Session ended");
}

// ── Tests ─────────────────────────────────────────────────────────
