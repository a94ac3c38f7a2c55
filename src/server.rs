//! HTTP front end: a thin proxy that re-streams chat turns as NDJSON.

use crate::llm::{ChatEvent, ChatRequest, ChatTransport, ErrorKind, EventCallback};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
struct AppState {
    transport: Arc<ChatTransport>,
}

pub fn router(transport: Arc<ChatTransport>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/models", get(models))
        .route("/api/health", get(health))
        .with_state(AppState { transport })
}

pub async fn run(listen: &str, transport: Arc<ChatTransport>) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(transport))
        .await
        .context("HTTP server failed")
}

/// Failures that are answered with a plain status instead of a stream
fn early_failure_status(event: &ChatEvent) -> Option<StatusCode> {
    if !event.is_failure() || !event.snapshot().is_empty() {
        return None;
    }
    match event.error_kind? {
        ErrorKind::Unreachable => Some(StatusCode::SERVICE_UNAVAILABLE),
        ErrorKind::MissingCredential => Some(StatusCode::BAD_REQUEST),
        _ => None,
    }
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    if request.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Message is required" })),
        )
            .into_response();
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ChatEvent>();
    let cancel = CancellationToken::new();
    // Dropping the response body (client went away) cancels the turn
    let guard = cancel.clone().drop_guard();

    let callback: EventCallback = Box::new(move |event: &ChatEvent| {
        tx.send(event.clone())
            .map_err(|_| anyhow::anyhow!("client disconnected"))
    });
    tokio::spawn(async move {
        let outcome = state.transport.send(&request, &cancel, &callback).await;
        debug!("Chat turn finished: {:?}", outcome);
    });

    let Some(first) = rx.recv().await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Chat turn ended without a response" })),
        )
            .into_response();
    };

    if let Some(status) = early_failure_status(&first) {
        let details = match first.error_kind {
            Some(ErrorKind::Unreachable) => "Start Ollama with `ollama serve` and retry",
            _ => "Provide an apiKey in the request or store one with `thinkchat set-key`",
        };
        return (
            status,
            Json(json!({
                "error": first.error,
                "details": details,
                "errorKind": first.error_kind,
            })),
        )
            .into_response();
    }

    let body = stream::unfold(
        (Some(first), rx, guard),
        |(pending, mut rx, guard)| async move {
            let event = match pending {
                Some(event) => event,
                None => rx.recv().await?,
            };
            let line = Bytes::from(event.to_line());
            Some((Ok::<_, Infallible>(line), (None, rx, guard)))
        },
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "models": state.transport.list_models().await }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let reachable = state.transport.local_server_reachable().await;
    Json(json!({ "status": "ok", "ollama": reachable }))
}
