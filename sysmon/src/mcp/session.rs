//! Session state for MCP Streamable HTTP
//!
//! A [`Session`] owns a bounded outbox (many producers, one attached stream)
//! and an [`EventLog`] used for `Last-Event-ID` replay. The [`SessionStore`]
//! owns session lifetimes.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::event_log::{EventLog, StoredEvent};
use crate::config::{OutboxFullPolicy, SessionConfig};
use crate::metrics;

/// How long a new stream waits for the previous one to let go of the outbox
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// How a session came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    /// Created by an `initialize` handshake
    ExplicitlyInitialized,
    /// Created for a client that skipped the handshake; removed when its stream drops
    AutoProvisioned,
}

impl Provisioning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provisioning::ExplicitlyInitialized => "explicit",
            Provisioning::AutoProvisioned => "auto",
        }
    }
}

/// Session error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session outbox is full")]
    ChannelFull,
    #[error("Session is closed")]
    Closed,
}

/// A message queued for delivery on the session stream
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Serialized JSON-RPC message
    pub data: String,
    /// Request key of the tool call this message belongs to
    pub call: Option<String>,
    /// Request key when this is the final reply to a request
    pub response_to: Option<String>,
}

impl OutboundMessage {
    pub fn notification<T: Serialize>(message: &T) -> crate::Result<Self> {
        Ok(Self {
            data: serde_json::to_string(message)?,
            call: None,
            response_to: None,
        })
    }

    /// Notification produced by a running call
    pub fn progress<T: Serialize>(message: &T, request_key: String) -> crate::Result<Self> {
        Ok(Self {
            data: serde_json::to_string(message)?,
            call: Some(request_key),
            response_to: None,
        })
    }

    pub fn response<T: Serialize>(message: &T, request_key: String) -> crate::Result<Self> {
        Ok(Self {
            data: serde_json::to_string(message)?,
            call: Some(request_key.clone()),
            response_to: Some(request_key),
        })
    }
}

/// What the attached stream observed next
#[derive(Debug)]
pub enum OutboxEvent {
    Message(OutboundMessage),
    /// Another stream attached to this session
    Superseded,
    /// The session was removed and the outbox drained
    Closed,
}

enum Routed {
    Sent,
    Full,
    Unrouted(OutboundMessage),
}

/// Exclusive consumer handle for a session outbox
pub struct OutboxSubscription {
    receiver: OwnedMutexGuard<mpsc::Receiver<OutboundMessage>>,
    generation: watch::Receiver<u64>,
}

impl OutboxSubscription {
    pub async fn next(&mut self) -> OutboxEvent {
        tokio::select! {
            biased;
            changed = self.generation.changed() => match changed {
                Ok(()) => OutboxEvent::Superseded,
                Err(_) => OutboxEvent::Closed,
            },
            msg = self.receiver.recv() => match msg {
                Some(msg) => OutboxEvent::Message(msg),
                None => OutboxEvent::Closed,
            },
        }
    }
}

pub struct Session {
    id: String,
    provisioning: Provisioning,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    initialized: AtomicBool,
    outbox_tx: RwLock<Option<mpsc::Sender<OutboundMessage>>>,
    outbox_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>>,
    full_policy: OutboxFullPolicy,
    stream_generation: watch::Sender<u64>,
    events: Mutex<EventLog>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    /// Calls whose output goes to the POST stream that started them
    reply_routes: Mutex<HashMap<String, mpsc::Sender<OutboundMessage>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("provisioning", &self.provisioning)
            .field("created_at", &self.created_at)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Session {
    fn new(id: String, provisioning: Provisioning, config: &SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.outbox_capacity.max(1));
        let (generation, _) = watch::channel(0);
        Self {
            id,
            provisioning,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            initialized: AtomicBool::new(provisioning == Provisioning::ExplicitlyInitialized),
            outbox_tx: RwLock::new(Some(tx)),
            outbox_rx: Arc::new(tokio::sync::Mutex::new(rx)),
            full_policy: config.outbox_full_policy,
            stream_generation: generation,
            events: Mutex::new(EventLog::new(config.event_log_capacity)),
            in_flight: Mutex::new(HashMap::new()),
            reply_routes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provisioning(&self) -> Provisioning {
        self.provisioning
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Enqueue without blocking.
    ///
    /// Output of a routed call goes to its reply stream; everything else,
    /// and routed output whose reply stream is gone, goes to the outbox.
    pub fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let message = match self.send_routed(message) {
            Routed::Sent => return Ok(()),
            Routed::Full => return self.outbox_full(),
            Routed::Unrouted(message) => message,
        };

        let guard = self.outbox_tx.read();
        let Some(tx) = guard.as_ref() else {
            return Err(SessionError::Closed);
        };

        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => self.outbox_full(),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    fn send_routed(&self, message: OutboundMessage) -> Routed {
        let Some(key) = message.call.clone() else {
            return Routed::Unrouted(message);
        };
        let mut routes = self.reply_routes.lock();
        let Some(route) = routes.get(&key) else {
            return Routed::Unrouted(message);
        };
        match route.try_send(message) {
            Ok(()) => Routed::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Routed::Full,
            Err(mpsc::error::TrySendError::Closed(message)) => {
                routes.remove(&key);
                tracing::debug!(session_id = %self.id, request_id = %key, "Reply stream gone, call output moves to the outbox");
                Routed::Unrouted(message)
            }
        }
    }

    fn outbox_full(&self) -> Result<(), SessionError> {
        match self.full_policy {
            OutboxFullPolicy::Error => {
                metrics::record_outbox_full(false);
                Err(SessionError::ChannelFull)
            }
            OutboxFullPolicy::Drop => {
                metrics::record_outbox_full(true);
                tracing::warn!(session_id = %self.id, "Outbox full, message dropped");
                Ok(())
            }
        }
    }

    /// Deliver the output of call `request_key` on `route` instead of the outbox.
    ///
    /// The route is dropped when the call finishes or is cancelled, so a
    /// receiver sees end-of-stream once all its calls are over.
    pub fn route_call(&self, request_key: &str, route: mpsc::Sender<OutboundMessage>) {
        self.reply_routes.lock().insert(request_key.to_string(), route);
    }

    /// Take over the outbox, superseding any stream currently attached.
    ///
    /// Returns `None` if the previous stream does not release it in time.
    pub async fn attach(&self) -> Option<OutboxSubscription> {
        self.stream_generation.send_modify(|g| *g += 1);
        let generation = self.stream_generation.subscribe();

        let receiver = tokio::time::timeout(ATTACH_TIMEOUT, self.outbox_rx.clone().lock_owned())
            .await
            .ok()?;

        Some(OutboxSubscription {
            receiver,
            generation,
        })
    }

    /// Record an outbound payload in the replay log
    pub fn store_event(&self, data: String) -> u64 {
        self.events.lock().store(data)
    }

    pub fn events_after(&self, last_seen: u64) -> Vec<StoredEvent> {
        self.events.lock().events_after(last_seen)
    }

    /// (oldest retained id, newest stored id)
    pub fn event_bounds(&self) -> (Option<u64>, u64) {
        let log = self.events.lock();
        (log.first_id(), log.last_id())
    }

    /// Track a running tool invocation; the token fires on cancel or session close
    pub fn register_call(&self, request_key: String) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.in_flight.lock().insert(request_key, token.clone());
        token
    }

    pub fn finish_call(&self, request_key: &str) {
        self.in_flight.lock().remove(request_key);
        self.reply_routes.lock().remove(request_key);
    }

    /// Cancel a running tool invocation. Returns false if none was running.
    pub fn cancel_call(&self, request_key: &str) -> bool {
        self.reply_routes.lock().remove(request_key);
        match self.in_flight.lock().remove(request_key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn close(&self) {
        self.outbox_tx.write().take();
        self.shutdown.cancel();
        self.in_flight.lock().clear();
        self.reply_routes.lock().clear();
        tracing::info!(
            session_id = %self.id,
            provisioning = self.provisioning.as_str(),
            was_initialized = self.is_initialized(),
            duration_secs = (Utc::now() - self.created_at).num_seconds(),
            "Closing session"
        );
    }
}

/// Owns all live sessions
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: SessionConfig,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session with a fresh id
    pub fn create(&self, provisioning: Provisioning) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(Session::new(id.clone(), provisioning, &self.config));
        sessions.insert(id.clone(), session.clone());
        let total = sessions.len();
        drop(sessions);

        metrics::record_session_created(provisioning.as_str(), total);
        tracing::info!(
            session_id = %id,
            provisioning = provisioning.as_str(),
            total_sessions = total,
            "Session created"
        );
        session
    }

    /// Look up a session, refreshing its activity timestamp
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read();
        match sessions.get(id) {
            Some(session) => {
                session.touch();
                Some(session.clone())
            }
            None => {
                tracing::debug!(session_id = %id, total_sessions = sessions.len(), "Session not found");
                None
            }
        }
    }

    /// Remove a session. Idempotent; returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(id);
            metrics::set_active_sessions(sessions.len());
            removed
        };

        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => {
                tracing::debug!(session_id = %id, "Attempted to remove non-existent session");
                false
            }
        }
    }

    /// Remove every session idle for longer than `max_age`
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<Arc<Session>> =
                ids.iter().filter_map(|id| sessions.remove(id)).collect();
            metrics::set_active_sessions(sessions.len());
            expired
        };

        for session in &expired {
            session.close();
        }

        if !expired.is_empty() {
            metrics::record_sessions_expired(expired.len());
            tracing::info!(
                expired_sessions = expired.len(),
                remaining_sessions = self.len(),
                max_age_secs = max_age.as_secs(),
                "Cleaned up expired sessions"
            );
        }
        expired.len()
    }

    /// Remove every session, ending attached streams and running tools
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let drained = sessions.drain().map(|(_, s)| s).collect();
            metrics::set_active_sessions(0);
            drained
        };
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            tracing::info!(closed_sessions = drained.len(), "Closed all sessions");
        }
        drained.len()
    }

    /// Run `sweep_expired` on the configured interval until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep_expired(store.config.max_age());
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
