//! Server-Sent Events delivery of a session outbox
//!
//! Every frame carries the EventLog id of its payload, so a client that
//! reconnects with `Last-Event-ID` gets the missed events replayed first.

use axum::response::sse::Event;
use futures::stream::Stream;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::mcp::session::{OutboundMessage, OutboxEvent, Session, SessionStore};
use crate::metrics;

/// What a stream is for, used in logs and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standalone `GET` stream
    Listen,
    /// Reply stream of a `POST`
    Reply,
    /// 2024-11-05 `/sse` stream
    Legacy,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Reply => "reply",
            StreamKind::Legacy => "legacy",
        }
    }
}

pub struct StreamParams {
    pub session: Arc<Session>,
    pub store: Arc<SessionStore>,
    pub kind: StreamKind,
    /// Resume marker from `Last-Event-ID`
    pub last_event_id: Option<u64>,
    /// Serialized replies written (and logged) before the outbox is tailed
    pub prelude: Vec<String>,
    /// Output of the calls this stream answers. Only read by reply streams,
    /// which never touch the outbox.
    pub replies: Option<ReplyRoute>,
    /// Data of an initial `endpoint` event
    pub endpoint: Option<String>,
    pub idle_timeout: Duration,
    /// The session was created for this stream and goes away with it
    pub owns_session: bool,
}

/// Per-request channel carrying the output of deferred tool calls
pub struct ReplyRoute {
    pub receiver: mpsc::Receiver<OutboundMessage>,
    /// Request keys still waiting for their result
    pub pending: HashSet<String>,
}

/// Runs cleanup however the stream ends, including the client going away
struct StreamGuard {
    session: Arc<Session>,
    store: Arc<SessionStore>,
    kind: StreamKind,
    reason: &'static str,
    remove_session: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        metrics::record_stream_closed(self.kind.as_str(), self.reason);
        tracing::info!(
            session_id = %self.session.id(),
            kind = self.kind.as_str(),
            reason = self.reason,
            "SSE stream closed"
        );
        if self.remove_session {
            tracing::debug!(session_id = %self.session.id(), "Removing auto-provisioned session");
            self.store.remove(self.session.id());
        }
    }
}

fn frame(id: u64, data: String) -> Event {
    Event::default().id(id.to_string()).data(data)
}

/// Build the event stream for a session.
///
/// A session owned by the stream is removed when the stream ends for any
/// reason other than being superseded.
pub fn session_stream(params: StreamParams) -> impl Stream<Item = Result<Event, Infallible>> {
    let StreamParams {
        session,
        store,
        kind,
        last_event_id,
        prelude,
        replies,
        endpoint,
        idle_timeout,
        owns_session,
    } = params;

    async_stream::stream! {
        metrics::record_stream_opened(kind.as_str());
        let mut guard = StreamGuard {
            session: session.clone(),
            store,
            kind,
            reason: "disconnected",
            remove_session: owns_session,
        };
        tracing::info!(session_id = %session.id(), kind = kind.as_str(), last_event_id = ?last_event_id, "SSE stream opened");

        if let Some(endpoint) = endpoint {
            yield Ok(Event::default().event("endpoint").data(endpoint));
        }

        for data in prelude {
            let id = session.store_event(data.clone());
            metrics::record_stream_event(false);
            yield Ok(frame(id, data));
        }

        if kind == StreamKind::Reply {
            let Some(ReplyRoute { mut receiver, mut pending }) = replies else {
                guard.reason = "answered";
                return;
            };
            while !pending.is_empty() {
                let message = match tokio::time::timeout(idle_timeout, receiver.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        guard.reason = "calls_ended";
                        return;
                    }
                    Err(_) => {
                        tracing::info!(session_id = %session.id(), idle_secs = idle_timeout.as_secs(), "SSE stream idle timeout");
                        guard.reason = "idle_timeout";
                        return;
                    }
                };
                let id = session.store_event(message.data.clone());
                metrics::record_stream_event(false);
                yield Ok(frame(id, message.data));
                if let Some(key) = message.response_to.as_deref() {
                    pending.remove(key);
                }
            }
            guard.reason = "answered";
            return;
        }

        let Some(mut subscription) = session.attach().await else {
            tracing::warn!(session_id = %session.id(), "Previous stream did not release the outbox");
            guard.reason = "attach_timeout";
            return;
        };

        if let Some(marker) = last_event_id {
            let (oldest, newest) = session.event_bounds();
            if oldest.is_some_and(|oldest| marker.saturating_add(1) < oldest) {
                tracing::warn!(
                    session_id = %session.id(),
                    last_event_id = marker,
                    oldest_retained = ?oldest,
                    "Resume point is older than retained history, some events are lost"
                );
            }
            let missed = session.events_after(marker);
            tracing::debug!(session_id = %session.id(), replayed = missed.len(), newest, "Replaying events");
            for event in missed {
                metrics::record_stream_event(true);
                yield Ok(frame(event.id, event.data));
            }
        }

        loop {
            let next = match tokio::time::timeout(idle_timeout, subscription.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::info!(session_id = %session.id(), idle_secs = idle_timeout.as_secs(), "SSE stream idle timeout");
                    guard.reason = "idle_timeout";
                    break;
                }
            };

            match next {
                OutboxEvent::Message(message) => {
                    let id = session.store_event(message.data.clone());
                    metrics::record_stream_event(false);
                    yield Ok(frame(id, message.data));
                }
                OutboxEvent::Superseded => {
                    guard.reason = "superseded";
                    guard.remove_session = false;
                    break;
                }
                OutboxEvent::Closed => {
                    guard.reason = "session_closed";
                    guard.remove_session = false;
                    break;
                }
            }
        }
    }
}
