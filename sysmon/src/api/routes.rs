use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use super::server::AppState;
use crate::mcp::handler::{PROTOCOL_VERSION, SERVER_NAME};

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.handler.sessions().len(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds()
    }))
}

/// Describes the server to clients that GET the MCP endpoint without asking for a stream
pub async fn server_info(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .handler
        .tools()
        .list()
        .into_iter()
        .map(|t| t["name"].clone())
        .collect();

    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocolVersion": PROTOCOL_VERSION,
        "transports": ["streamable-http", "sse"],
        "endpoints": {
            "mcp": "/mcp",
            "sse": "/sse",
            "health": "/health"
        },
        "tools": tools,
        "authentication": state.auth_enabled
    }))
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
