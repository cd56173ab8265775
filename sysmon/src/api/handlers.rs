//! Streamable HTTP endpoints: `POST` messages, `GET` event stream, `DELETE` session

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use super::server::AppState;
use super::sse::{session_stream, ReplyRoute, StreamKind, StreamParams};
use crate::mcp::handler::BatchOutcome;
use crate::mcp::message::{JsonRpcResponse, RpcErrorKind};
use crate::mcp::session::{Provisioning, Session};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const EVENT_STREAM: &str = "text/event-stream";

/// Session id fallbacks for clients that cannot set headers (browsers)
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub session: Option<String>,
}

fn session_id_from(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.session_id.clone())
        .or_else(|| query.session.clone())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(LAST_EVENT_ID_HEADER)?.to_str().ok()?;
    match raw.trim().parse::<u64>() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::debug!(last_event_id = %raw, "Ignoring non-numeric Last-Event-ID");
            None
        }
    }
}

/// Which reply framings the client accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acceptance {
    pub json: bool,
    pub sse: bool,
}

impl Acceptance {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
            return Self {
                json: true,
                sse: false,
            };
        };
        if accept.trim().is_empty() {
            return Self {
                json: true,
                sse: false,
            };
        }

        let mut acceptance = Self {
            json: false,
            sse: false,
        };
        for media in accept.split(',') {
            let media = media.split(';').next().unwrap_or("").trim();
            match media {
                "application/json" | "application/*" | "*/*" => acceptance.json = true,
                EVENT_STREAM => acceptance.sse = true,
                _ => {}
            }
        }
        acceptance
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    Acceptance::from_headers(headers).sse
}

fn rpc_error(status: StatusCode, kind: RpcErrorKind, message: impl Into<String>) -> Response {
    (
        status,
        Json(JsonRpcResponse::error(Value::Null, kind, message)),
    )
        .into_response()
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn keep_alive(state: &AppState) -> KeepAlive {
    KeepAlive::new()
        .interval(state.stream.keepalive())
        .text("ping")
}

/// HTTP status for a single-message error reply
fn error_status(outcome: &BatchOutcome) -> Option<StatusCode> {
    match outcome.single_error()? {
        RpcErrorKind::SessionNotFound => Some(StatusCode::NOT_FOUND),
        RpcErrorKind::ParseError | RpcErrorKind::InvalidRequest => Some(StatusCode::BAD_REQUEST),
        _ => None,
    }
}

fn json_reply(outcome: &BatchOutcome) -> Response {
    match outcome.body() {
        Some(body) => {
            let status = error_status(outcome).unwrap_or(StatusCode::OK);
            (status, Json(body)).into_response()
        }
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn serialized_replies(outcome: &BatchOutcome) -> Vec<String> {
    outcome
        .replies
        .iter()
        .filter_map(|reply| serde_json::to_string(reply).ok())
        .collect()
}

fn sse_reply(state: &AppState, session: Arc<Session>, outcome: &mut BatchOutcome) -> Response {
    let replies = outcome.calls.take().map(|receiver| ReplyRoute {
        receiver,
        pending: outcome.deferred.iter().cloned().collect::<HashSet<_>>(),
    });
    let stream = session_stream(StreamParams {
        session,
        store: state.handler.sessions().clone(),
        kind: StreamKind::Reply,
        last_event_id: None,
        prelude: serialized_replies(outcome),
        replies,
        endpoint: None,
        idle_timeout: state.stream.idle_timeout(),
        owns_session: false,
    });
    Sse::new(stream).keep_alive(keep_alive(state)).into_response()
}

/// Replies for a client that only takes event streams but has no session
fn detached_sse_reply(outcome: &BatchOutcome) -> Response {
    let events: Vec<Result<Event, Infallible>> = serialized_replies(outcome)
        .into_iter()
        .map(|data| Ok(Event::default().data(data)))
        .collect();
    Sse::new(futures::stream::iter(events)).into_response()
}

/// POST: one message or a batch
pub async fn handle_post(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let accept = Acceptance::from_headers(&headers);
    if !accept.json && !accept.sse {
        return rpc_error(
            StatusCode::NOT_ACCEPTABLE,
            RpcErrorKind::InvalidRequest,
            "Accept must include application/json or text/event-stream",
        );
    }

    let body: Value = match serde_json::from_slice(&body) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        Ok(_) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                RpcErrorKind::ParseError,
                "Body must be a JSON object or array",
            )
        }
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable request body");
            return rpc_error(
                StatusCode::BAD_REQUEST,
                RpcErrorKind::ParseError,
                format!("Parse error: {}", e),
            );
        }
    };

    let session_id = session_id_from(&headers, &query);
    let stream_reply = accept.sse && (!accept.json || state.handler.has_streaming_call(&body));

    let mut outcome = if stream_reply {
        state
            .handler
            .dispatch_batch_streamed(body, session_id.as_deref())
            .await
    } else {
        state
            .handler
            .dispatch_batch(body, session_id.as_deref())
            .await
    };

    let response = if error_status(&outcome).is_some() || !stream_reply {
        json_reply(&outcome)
    } else {
        let session = outcome
            .session_id
            .as_deref()
            .and_then(|id| state.handler.sessions().get(id));
        match session {
            Some(session) => sse_reply(&state, session, &mut outcome),
            None if accept.json => json_reply(&outcome),
            None => detached_sse_reply(&outcome),
        }
    };

    match &outcome.new_session {
        Some(id) => with_session_header(response, id),
        None => response,
    }
}

/// GET: event stream, or server info for non-SSE clients
pub async fn handle_get(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    if !wants_event_stream(&headers) {
        return super::routes::server_info(State(state)).await.into_response();
    }
    open_stream(&state, &headers, &query, StreamKind::Listen)
}

/// GET /sse: legacy stream announcing where to POST
pub async fn handle_legacy_sse(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    open_stream(&state, &headers, &query, StreamKind::Legacy)
}

fn open_stream(
    state: &AppState,
    headers: &HeaderMap,
    query: &SessionQuery,
    kind: StreamKind,
) -> Response {
    let store = state.handler.sessions();
    let (session, created_here) = match session_id_from(headers, query) {
        Some(id) => match store.get(&id) {
            Some(session) => (session, false),
            None => {
                return rpc_error(
                    StatusCode::NOT_FOUND,
                    RpcErrorKind::SessionNotFound,
                    "Session not found",
                )
            }
        },
        None if store.config().auto_provision => {
            let session = store.create(Provisioning::AutoProvisioned);
            tracing::info!(session_id = %session.id(), kind = kind.as_str(), "Auto-provisioned session for stream");
            (session, true)
        }
        None => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                RpcErrorKind::InvalidRequest,
                "Missing session ID",
            )
        }
    };

    let session_id = session.id().to_string();
    let endpoint = (kind == StreamKind::Legacy).then(|| format!("/sse?sessionId={}", session_id));
    let stream = session_stream(StreamParams {
        session,
        store: store.clone(),
        kind,
        last_event_id: last_event_id(headers),
        prelude: Vec::new(),
        replies: None,
        endpoint,
        idle_timeout: state.stream.idle_timeout(),
        owns_session: created_here,
    });

    let response = Sse::new(stream).keep_alive(keep_alive(state)).into_response();
    with_session_header(response, &session_id)
}

/// DELETE: terminate a session. Idempotent.
pub async fn handle_delete(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> StatusCode {
    match session_id_from(&headers, &query) {
        Some(id) => {
            let existed = state.handler.sessions().remove(&id);
            tracing::info!(session_id = %id, existed, "Session terminated by client");
        }
        None => tracing::debug!("DELETE without session id"),
    }
    StatusCode::NO_CONTENT
}
