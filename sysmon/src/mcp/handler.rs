//! MCP JSON-RPC 2.0 handler
//!
//! Interprets inbound messages against session state. Transports call
//! [`McpHandler::dispatch_batch`] and decide how to frame the outcome.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::message::{request_key, JsonRpcResponse, Message, RpcErrorKind};
use super::runner::StreamingToolRunner;
use super::session::{OutboundMessage, Provisioning, Session, SessionStore};
use super::tools::{RegisteredTool, ToolContext, ToolRegistry};
use crate::collector::MetricsCollector;
use crate::config::SessionConfig;
use crate::metrics;
use crate::Error;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
pub const SERVER_NAME: &str = "sysmon-mcp";

/// Methods a client may call without completing the handshake
const AUTO_PROVISION_METHODS: &[&str] = &["tools/list", "tools/call", "ping"];

const KNOWN_METHODS: &[&str] = &[
    "initialize",
    "tools/list",
    "tools/call",
    "ping",
    "initialized",
    "notifications/initialized",
    "notifications/cancelled",
];

/// Result of dispatching one message
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Immediate reply; `None` for notifications, responses and deferred calls
    pub reply: Option<JsonRpcResponse>,
    /// Session created while handling this message
    pub new_session: Option<String>,
    /// Request key of a streaming call whose result arrives on the outbox
    pub deferred: Option<String>,
}

impl Dispatched {
    fn reply(reply: JsonRpcResponse) -> Self {
        Self {
            reply: Some(reply),
            ..Self::default()
        }
    }

    fn none() -> Self {
        Self::default()
    }

    fn created(mut self, session_id: Option<String>) -> Self {
        if self.new_session.is_none() {
            self.new_session = session_id;
        }
        self
    }
}

/// Result of dispatching a whole POST body or stdio line
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Replies for requests only, in input order
    pub replies: Vec<JsonRpcResponse>,
    /// Session the batch ended up bound to
    pub session_id: Option<String>,
    /// Set when the batch created a session
    pub new_session: Option<String>,
    /// Streaming calls still running
    pub deferred: Vec<String>,
    /// Input was a single object rather than an array
    pub single: bool,
    /// Output of the deferred calls, when dispatched with
    /// [`McpHandler::dispatch_batch_streamed`]. Ends once every call is over.
    pub calls: Option<mpsc::Receiver<OutboundMessage>>,
}

impl BatchOutcome {
    /// Reply body: one reply is a bare object, several an array, none nothing
    pub fn body(&self) -> Option<Value> {
        match self.replies.len() {
            0 => None,
            1 if self.single => serde_json::to_value(&self.replies[0]).ok(),
            _ => serde_json::to_value(&self.replies).ok(),
        }
    }

    /// Error kind of the only reply of a single-message request
    pub fn single_error(&self) -> Option<RpcErrorKind> {
        match (self.single, self.replies.as_slice()) {
            (true, [only]) => only.error_kind(),
            _ => None,
        }
    }
}

/// MCP protocol handler
pub struct McpHandler {
    sessions: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
    runner: StreamingToolRunner,
}

impl McpHandler {
    pub fn new(sessions: Arc<SessionStore>, tools: Arc<ToolRegistry>, ctx: ToolContext) -> Self {
        let runner = StreamingToolRunner::new(ctx.collector.clone());
        Self {
            sessions,
            tools,
            ctx,
            runner,
        }
    }

    /// Handler with a fresh session store and the built-in system tools
    pub fn with_system_tools(config: SessionConfig, collector: Arc<dyn MetricsCollector>) -> Self {
        Self::new(
            Arc::new(SessionStore::new(config)),
            Arc::new(ToolRegistry::with_system_tools()),
            ToolContext { collector },
        )
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Whether `value` (object or array) contains a `tools/call` of a streaming tool
    pub fn has_streaming_call(&self, value: &Value) -> bool {
        let is_streaming = |msg: &Value| {
            msg.get("method").and_then(Value::as_str) == Some("tools/call")
                && msg
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| self.tools.is_streaming(name))
        };
        match value {
            Value::Array(items) => items.iter().any(is_streaming),
            other => is_streaming(other),
        }
    }

    /// Dispatch an object or an array of messages.
    ///
    /// A session created by an earlier message is used by the later ones.
    /// Output of streaming calls goes to the session outbox.
    pub async fn dispatch_batch(&self, body: Value, session_id: Option<&str>) -> BatchOutcome {
        self.dispatch_batch_inner(body, session_id, None).await
    }

    /// Like [`dispatch_batch`](Self::dispatch_batch), but the output of the
    /// streaming calls started here is kept apart in [`BatchOutcome::calls`]
    /// for the stream answering this request.
    pub async fn dispatch_batch_streamed(
        &self,
        body: Value,
        session_id: Option<&str>,
    ) -> BatchOutcome {
        let (route, receiver) = mpsc::channel(self.sessions.config().outbox_capacity.max(1));
        let mut outcome = self.dispatch_batch_inner(body, session_id, Some(route)).await;
        if !outcome.deferred.is_empty() {
            outcome.calls = Some(receiver);
        }
        outcome
    }

    async fn dispatch_batch_inner(
        &self,
        body: Value,
        session_id: Option<&str>,
        route: Option<mpsc::Sender<OutboundMessage>>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            session_id: session_id.map(str::to_string),
            ..BatchOutcome::default()
        };

        let messages = match body {
            Value::Array(items) if items.is_empty() => {
                outcome.single = true;
                outcome.replies.push(JsonRpcResponse::error(
                    Value::Null,
                    RpcErrorKind::InvalidRequest,
                    "Empty batch",
                ));
                return outcome;
            }
            Value::Array(items) => items,
            single => {
                outcome.single = true;
                vec![single]
            }
        };

        for message in messages {
            let dispatched = self
                .dispatch_routed(message, outcome.session_id.as_deref(), route.as_ref())
                .await;
            if let Some(id) = dispatched.new_session {
                outcome.session_id = Some(id.clone());
                outcome.new_session = Some(id);
            }
            if let Some(reply) = dispatched.reply {
                outcome.replies.push(reply);
            }
            if let Some(key) = dispatched.deferred {
                outcome.deferred.push(key);
            }
        }
        outcome
    }

    /// Dispatch a single message
    pub async fn dispatch(&self, message: Value, session_id: Option<&str>) -> Dispatched {
        self.dispatch_routed(message, session_id, None).await
    }

    async fn dispatch_routed(
        &self,
        message: Value,
        session_id: Option<&str>,
        route: Option<&mpsc::Sender<OutboundMessage>>,
    ) -> Dispatched {
        match Message::classify(message) {
            Message::Request { id, method, params } => {
                let dispatched = self
                    .handle_request(id, &method, params, session_id, route)
                    .await;
                let status = match &dispatched.reply {
                    Some(r) if r.is_error() => "error",
                    Some(_) => "ok",
                    None => "deferred",
                };
                metrics::record_rpc(method_label(&method), status);
                dispatched
            }
            Message::Notification { method, params } => {
                metrics::record_rpc(method_label(&method), "notification");
                self.handle_notification(&method, params, session_id);
                Dispatched::none()
            }
            Message::Response { id } => {
                tracing::debug!(id = %id, "Ignoring client response");
                Dispatched::none()
            }
            Message::Invalid { id, reason } => {
                tracing::warn!(reason = %reason, "Invalid JSON-RPC message");
                match id {
                    Some(id) => Dispatched::reply(JsonRpcResponse::error(
                        id,
                        RpcErrorKind::InvalidRequest,
                        reason,
                    )),
                    None => Dispatched::none(),
                }
            }
        }
    }

    async fn handle_request(
        &self,
        id: Value,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
        route: Option<&mpsc::Sender<OutboundMessage>>,
    ) -> Dispatched {
        tracing::debug!(method = %method, session_id = ?session_id, "Handling request");

        if method == "initialize" {
            return self.handle_initialize(id, session_id);
        }

        let (session, created) = match self.resolve_session(session_id, method) {
            Ok(found) => found,
            Err(reply) => return Dispatched::reply(reply.with_id(id)),
        };

        if !session.is_initialized() && !AUTO_PROVISION_METHODS.contains(&method) {
            return Dispatched::reply(JsonRpcResponse::error(
                id,
                RpcErrorKind::InvalidRequest,
                "Session not initialized",
            ))
            .created(created);
        }

        let dispatched = match method {
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params, &session, route).await,
            "ping" => Dispatched::reply(JsonRpcResponse::success(id, json!({}))),
            _ => Dispatched::reply(JsonRpcResponse::error(
                id,
                RpcErrorKind::MethodNotFound,
                format!("Method not found: {}", method),
            )),
        };
        dispatched.created(created)
    }

    fn handle_initialize(&self, id: Value, session_id: Option<&str>) -> Dispatched {
        if let Some(existing) = session_id {
            tracing::warn!(session_id = %existing, "initialize sent with a session id");
            return Dispatched::reply(JsonRpcResponse::error(
                id,
                RpcErrorKind::InvalidRequest,
                "initialize must not carry a session id",
            ));
        }

        let session = self.sessions.create(Provisioning::ExplicitlyInitialized);
        let result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "sessionId": session.id()
        });

        Dispatched {
            reply: Some(JsonRpcResponse::success(id, result)),
            new_session: Some(session.id().to_string()),
            deferred: None,
        }
    }

    /// Find the session for a request, auto-provisioning when allowed.
    /// Returns the session and, if it was just created, its id.
    fn resolve_session(
        &self,
        session_id: Option<&str>,
        method: &str,
    ) -> std::result::Result<(Arc<Session>, Option<String>), PendingError> {
        match session_id {
            Some(id) => match self.sessions.get(id) {
                Some(session) => Ok((session, None)),
                None => Err(PendingError(
                    RpcErrorKind::SessionNotFound,
                    "Session not found".to_string(),
                )),
            },
            None if self.sessions.config().auto_provision
                && AUTO_PROVISION_METHODS.contains(&method) =>
            {
                let session = self.sessions.create(Provisioning::AutoProvisioned);
                tracing::info!(session_id = %session.id(), method = %method, "Auto-provisioned session");
                let id = session.id().to_string();
                Ok((session, Some(id)))
            }
            None => Err(PendingError(
                RpcErrorKind::InvalidRequest,
                "Missing session ID".to_string(),
            )),
        }
    }

    fn handle_tools_list(&self, id: Value) -> Dispatched {
        Dispatched::reply(JsonRpcResponse::success(
            id,
            json!({ "tools": self.tools.list() }),
        ))
    }

    async fn handle_tools_call(
        &self,
        id: Value,
        params: Option<Value>,
        session: &Arc<Session>,
        route: Option<&mpsc::Sender<OutboundMessage>>,
    ) -> Dispatched {
        let Some(params) = params.as_ref().and_then(Value::as_object) else {
            return Dispatched::reply(JsonRpcResponse::error(
                id,
                RpcErrorKind::InvalidParams,
                "params must be an object",
            ));
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Dispatched::reply(JsonRpcResponse::error(
                id,
                RpcErrorKind::InvalidParams,
                "Missing tool name",
            ));
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let Some(tool) = self.tools.get(name) else {
            return Dispatched::reply(JsonRpcResponse::error(
                id,
                RpcErrorKind::MethodNotFound,
                format!("Unknown tool: {}", name),
            ));
        };

        tracing::debug!(session_id = %session.id(), tool = %name, "Calling tool");

        match tool {
            RegisteredTool::Unary(tool) => match tool.call(arguments, &self.ctx).await {
                Ok(text) => Dispatched::reply(JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{
                            "type": "text",
                            "text": text
                        }]
                    }),
                )),
                Err(Error::InvalidParams(msg)) => Dispatched::reply(JsonRpcResponse::error(
                    id,
                    RpcErrorKind::InvalidParams,
                    msg,
                )),
                Err(e) => {
                    tracing::error!(session_id = %session.id(), tool = %name, error = %e, "Tool failed");
                    Dispatched::reply(JsonRpcResponse::error(
                        id,
                        RpcErrorKind::ToolExecution,
                        e.to_string(),
                    ))
                }
            },
            RegisteredTool::Streaming(tool) => match tool.schedule(&arguments) {
                Ok(schedule) => {
                    let key = request_key(&id);
                    if let Some(route) = route {
                        session.route_call(&key, route.clone());
                    }
                    self.runner.start(session.clone(), id, name, schedule);
                    Dispatched {
                        deferred: Some(key),
                        ..Dispatched::none()
                    }
                }
                Err(e) => Dispatched::reply(JsonRpcResponse::error(
                    id,
                    RpcErrorKind::InvalidParams,
                    e.to_string(),
                )),
            },
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>, session_id: Option<&str>) {
        let session = session_id.and_then(|id| self.sessions.get(id));

        match method {
            "notifications/initialized" | "initialized" => {
                if let Some(session) = session {
                    session.mark_initialized();
                    tracing::debug!(session_id = %session.id(), "Client initialized");
                }
            }
            "notifications/cancelled" => {
                let request_id = params.as_ref().and_then(|p| p.get("requestId"));
                match (session, request_id) {
                    (Some(session), Some(request_id)) => {
                        let key = request_key(request_id);
                        if session.cancel_call(&key) {
                            tracing::info!(session_id = %session.id(), request_id = %key, "Cancelled in-flight call");
                        } else {
                            tracing::debug!(session_id = %session.id(), request_id = %key, "No in-flight call to cancel");
                        }
                    }
                    _ => tracing::debug!("Dropping cancellation without session or requestId"),
                }
            }
            other => {
                tracing::debug!(method = %other, "Dropping unhandled notification");
            }
        }
    }
}

/// An error reply waiting for its request id
struct PendingError(RpcErrorKind, String);

impl PendingError {
    fn with_id(self, id: Value) -> JsonRpcResponse {
        JsonRpcResponse::error(id, self.0, self.1)
    }
}

fn method_label(method: &str) -> &str {
    if KNOWN_METHODS.contains(&method) {
        method
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CpuInfo, MemoryInfo, MetricsSnapshot, StaticCollector};
    use crate::mcp::session::OutboxEvent;
    use std::time::Duration;

    fn handler_with(config: SessionConfig) -> McpHandler {
        let collector = Arc::new(StaticCollector::new(MetricsSnapshot {
            cpu: CpuInfo {
                count: 8,
                model_name: "Test CPU".to_string(),
                usage_percent: 10.0,
            },
            memory: MemoryInfo {
                total_bytes: 8 * 1024 * 1024 * 1024,
                available_bytes: 4 * 1024 * 1024 * 1024,
                used_bytes: 4 * 1024 * 1024 * 1024,
                used_percent: 50.0,
            },
        }));
        McpHandler::new(
            Arc::new(SessionStore::new(config)),
            Arc::new(ToolRegistry::with_system_tools()),
            ToolContext { collector },
        )
    }

    fn handler() -> McpHandler {
        handler_with(SessionConfig::default())
    }

    async fn initialize(handler: &McpHandler) -> String {
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}), None)
            .await;
        d.new_session.unwrap()
    }

    fn error_code(d: &Dispatched) -> i32 {
        d.reply.as_ref().unwrap().error.as_ref().unwrap().code
    }

    #[tokio::test]
    async fn test_initialize_creates_session() {
        let handler = handler();
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}), None)
            .await;
        let reply = d.reply.unwrap();
        let result = reply.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["capabilities"]["tools"], json!({}));
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);

        let sid = d.new_session.unwrap();
        assert_eq!(result["sessionId"], sid.as_str());
        assert!(handler.sessions().get(&sid).unwrap().is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_with_session_rejected() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 2, "method": "initialize"}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32600);
        assert!(d.new_session.is_none());
        assert_eq!(handler.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}), Some(&sid))
            .await;
        let result = d.reply.unwrap().result.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t["name"].is_string() && t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let handler = handler();
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}), Some("nope"))
            .await;
        assert_eq!(error_code(&d), -32001);
        assert_eq!(d.reply.unwrap().id, json!(2));
    }

    #[tokio::test]
    async fn test_auto_provision() {
        let handler = handler();
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"}), None)
            .await;
        assert!(!d.reply.unwrap().is_error());
        let sid = d.new_session.unwrap();
        let session = handler.sessions().get(&sid).unwrap();
        assert_eq!(session.provisioning(), Provisioning::AutoProvisioned);
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn test_auto_provision_disabled_or_not_allowed() {
        let handler = handler_with(SessionConfig {
            auto_provision: false,
            ..SessionConfig::default()
        });
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"}), None)
            .await;
        assert_eq!(error_code(&d), -32600);
        assert!(handler.sessions().is_empty());

        let handler = self::handler();
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 6, "method": "resources/list"}), None)
            .await;
        assert_eq!(error_code(&d), -32600);
        assert!(handler.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_uninitialized_session_only_allow_list() {
        let handler = handler();
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None)
            .await;
        let sid = d.new_session.unwrap();

        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32600);

        handler
            .dispatch(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}), Some(&sid))
            .await;
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32601);
    }

    #[tokio::test]
    async fn test_tools_call_get_system_info() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let d = handler
            .dispatch(
                json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "get_system_info"}}),
                Some(&sid),
            )
            .await;
        let result = d.reply.unwrap().result.unwrap();
        assert_eq!(result["content"][0]["type"], "text");
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("8 cores"));
        assert!(text.contains("8.0 GB total"));
    }

    #[tokio::test]
    async fn test_tools_call_errors() {
        let handler = handler();
        let sid = initialize(&handler).await;

        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32602);

        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": 7}}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32602);

        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "rm_rf"}}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32601);

        let d = handler
            .dispatch(
                json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                       "params": {"name": "system_monitor_stream", "arguments": {"interval": "soon"}}}),
                Some(&sid),
            )
            .await;
        assert_eq!(error_code(&d), -32602);
        assert!(d.deferred.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_and_notifications() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 9, "method": "bogus"}), Some(&sid))
            .await;
        assert_eq!(error_code(&d), -32601);

        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "method": "bogus"}), Some(&sid))
            .await;
        assert!(d.reply.is_none());

        let d = handler
            .dispatch(json!({"jsonrpc": "2.0", "id": 9, "result": {}}), Some(&sid))
            .await;
        assert!(d.reply.is_none());

        let d = handler.dispatch(json!("hello"), Some(&sid)).await;
        assert!(d.reply.is_none());
    }

    #[tokio::test]
    async fn test_streaming_call_deferred_and_cancelled() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let d = handler
            .dispatch(
                json!({"jsonrpc": "2.0", "id": "s1", "method": "tools/call",
                       "params": {"name": "system_monitor_stream", "arguments": {"duration": "1m", "interval": "1s"}}}),
                Some(&sid),
            )
            .await;
        assert!(d.reply.is_none());
        assert_eq!(d.deferred.as_deref(), Some("\"s1\""));

        let session = handler.sessions().get(&sid).unwrap();
        assert_eq!(session.in_flight_count(), 1);

        handler
            .dispatch(
                json!({"jsonrpc": "2.0", "method": "notifications/cancelled", "params": {"requestId": "s1"}}),
                Some(&sid),
            )
            .await;
        assert_eq!(session.in_flight_count(), 0);

        let mut sub = session.attach().await.unwrap();
        match sub.next().await {
            OutboxEvent::Message(m) => assert!(m.data.contains("\"phase\":\"start\"")),
            other => panic!("unexpected {:?}", other),
        }
        let next = tokio::time::timeout(Duration::from_millis(1500), sub.next()).await;
        assert!(next.is_err(), "no more messages after cancel");
    }

    #[tokio::test]
    async fn test_batch_rules() {
        let handler = handler();

        let outcome = handler.dispatch_batch(json!([]), None).await;
        assert_eq!(outcome.single_error(), Some(RpcErrorKind::InvalidRequest));

        let outcome = handler
            .dispatch_batch(
                json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "initialize"},
                    {"jsonrpc": "2.0", "method": "notifications/initialized"},
                    {"jsonrpc": "2.0", "id": 2, "method": "tools/list"}
                ]),
                None,
            )
            .await;
        assert_eq!(outcome.replies.len(), 2);
        assert!(outcome.replies.iter().all(|r| !r.is_error()));
        let body = outcome.body().unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["id"], 1);
        assert_eq!(body[1]["id"], 2);
        let sid = outcome.new_session.clone().unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some(sid.as_str()));

        let outcome = handler
            .dispatch_batch(
                json!([
                    {"jsonrpc": "2.0", "method": "notifications/initialized"},
                    {"jsonrpc": "2.0", "id": 3, "method": "ping"}
                ]),
                Some(&sid),
            )
            .await;
        assert!(!outcome.single);
        assert_eq!(outcome.replies.len(), 1);
        assert!(outcome.body().unwrap().is_array());

        let outcome = handler
            .dispatch_batch(json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}), Some(&sid))
            .await;
        assert!(outcome.body().unwrap().is_object());

        let outcome = handler
            .dispatch_batch(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}), Some(&sid))
            .await;
        assert!(outcome.body().is_none());
    }

    #[tokio::test]
    async fn test_streamed_batches_keep_their_own_output() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let call = |id: &str| {
            json!({"jsonrpc": "2.0", "id": id, "method": "tools/call",
                   "params": {"name": "system_monitor_stream", "arguments": {"duration": "300ms", "interval": "100ms"}}})
        };

        let mut first = handler.dispatch_batch_streamed(call("a"), Some(&sid)).await;
        let mut second = handler.dispatch_batch_streamed(call("b"), Some(&sid)).await;
        assert_eq!(first.deferred, vec!["\"a\"".to_string()]);

        for (outcome, key) in [(&mut first, "\"a\""), (&mut second, "\"b\"")] {
            let mut calls = outcome.calls.take().unwrap();
            let mut last = None;
            while let Some(message) = tokio::time::timeout(Duration::from_secs(3), calls.recv()).await.unwrap() {
                assert_eq!(message.call.as_deref(), Some(key));
                last = Some(message);
            }
            assert_eq!(last.unwrap().response_to.as_deref(), Some(key));
        }

        let session = handler.sessions().get(&sid).unwrap();
        let mut sub = session.attach().await.unwrap();
        let leaked = tokio::time::timeout(Duration::from_millis(200), sub.next()).await;
        assert!(leaked.is_err(), "routed output must not reach the outbox");
    }

    #[tokio::test]
    async fn test_streamed_batch_without_streaming_call_has_no_channel() {
        let handler = handler();
        let sid = initialize(&handler).await;
        let outcome = handler
            .dispatch_batch_streamed(json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}), Some(&sid))
            .await;
        assert!(outcome.calls.is_none());
        assert_eq!(outcome.replies.len(), 1);
    }

    #[test]
    fn test_has_streaming_call() {
        let handler = handler();
        let call = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "system_monitor_stream"}});
        assert!(handler.has_streaming_call(&call));
        assert!(handler.has_streaming_call(&json!([{"method": "ping", "id": 2}, call])));
        assert!(!handler.has_streaming_call(
            &json!({"method": "tools/call", "id": 1, "params": {"name": "get_system_info"}})
        ));
    }
}
