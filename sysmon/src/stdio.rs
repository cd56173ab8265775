//! Line-delimited JSON-RPC over stdin/stdout
//!
//! One message (or batch) per line. Replies and session outbox items go
//! through a single writer task so lines never interleave.

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::mcp::message::{JsonRpcResponse, RpcErrorKind};
use crate::mcp::session::OutboxEvent;
use crate::mcp::McpHandler;
use crate::{Error, Result};

const MAX_LINE_LENGTH: usize = 1024 * 1024;
const WRITE_QUEUE: usize = 256;

pub struct StdioServer {
    handler: Arc<McpHandler>,
}

impl StdioServer {
    pub fn new(handler: Arc<McpHandler>) -> Self {
        Self { handler }
    }

    /// Serve on the process stdin/stdout until EOF
    pub async fn run(self) -> Result<()> {
        self.run_with(tokio::io::stdin(), tokio::io::stdout()).await
    }

    pub async fn run_with<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<String>(WRITE_QUEUE);
        let writer_task = tokio::spawn(write_lines(writer, out_rx));

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut session_id: Option<String> = None;
        let mut forwarder: Option<JoinHandle<()>> = None;
        let mut result = Ok(());

        tracing::info!("stdio transport ready");

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(max = MAX_LINE_LENGTH, "Discarding oversized line");
                    send_reply(&out_tx, &parse_error("Message too large")).await;
                    continue;
                }
                Err(LinesCodecError::Io(e)) => {
                    result = Err(Error::Io(e));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let body: Value = match serde_json::from_str(&line) {
                Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
                Ok(_) => {
                    send_reply(&out_tx, &parse_error("Message must be a JSON object or array")).await;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Unparseable stdio line");
                    send_reply(&out_tx, &parse_error(&format!("Parse error: {}", e))).await;
                    continue;
                }
            };

            let dispatch = self.handler.dispatch_batch(body, session_id.as_deref());
            let outcome = match AssertUnwindSafe(dispatch).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!("Panic while dispatching stdio message");
                    let reply =
                        JsonRpcResponse::error(Value::Null, RpcErrorKind::Internal, "Internal error");
                    send_reply(&out_tx, &reply).await;
                    continue;
                }
            };

            if let (None, Some(new_id)) = (&session_id, &outcome.new_session) {
                tracing::info!(session_id = %new_id, "stdio session established");
                forwarder = self.spawn_forwarder(new_id, out_tx.clone());
                session_id = Some(new_id.clone());
            }

            if let Some(body) = outcome.body() {
                if out_tx.send(body.to_string()).await.is_err() {
                    tracing::warn!("stdout writer stopped");
                    break;
                }
            }
        }

        tracing::info!("stdin closed, shutting down stdio transport");
        if let Some(id) = &session_id {
            self.handler.sessions().remove(id);
        }
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        drop(out_tx);
        if let Ok(Err(e)) = writer_task.await {
            result = result.and(Err(e));
        }
        result
    }

    /// Pipe the session outbox (progress notifications, deferred results) to stdout
    fn spawn_forwarder(&self, session_id: &str, out: mpsc::Sender<String>) -> Option<JoinHandle<()>> {
        let session = self.handler.sessions().get(session_id)?;
        Some(tokio::spawn(async move {
            let Some(mut subscription) = session.attach().await else {
                tracing::warn!(session_id = %session.id(), "Could not attach to session outbox");
                return;
            };
            while let OutboxEvent::Message(message) = subscription.next().await {
                session.store_event(message.data.clone());
                if out.send(message.data).await.is_err() {
                    break;
                }
            }
        }))
    }
}

async fn write_lines<W>(writer: W, mut rx: mpsc::Receiver<String>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(line) = rx.recv().await {
        sink.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => Error::Io(e),
            other => Error::Server(other.to_string()),
        })?;
    }
    Ok(())
}

fn parse_error(message: &str) -> JsonRpcResponse {
    JsonRpcResponse::error(Value::Null, RpcErrorKind::ParseError, message)
}

async fn send_reply(out: &mpsc::Sender<String>, reply: &JsonRpcResponse) {
    match serde_json::to_string(reply) {
        Ok(line) => {
            let _ = out.send(line).await;
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CpuInfo, MemoryInfo, MetricsSnapshot, StaticCollector};
    use crate::config::SessionConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn handler() -> Arc<McpHandler> {
        let collector = Arc::new(StaticCollector::new(MetricsSnapshot {
            cpu: CpuInfo {
                count: 2,
                model_name: "Test CPU".to_string(),
                usage_percent: 5.0,
            },
            memory: MemoryInfo {
                total_bytes: 1 << 30,
                available_bytes: 1 << 29,
                used_bytes: 1 << 29,
                used_percent: 50.0,
            },
        }));
        Arc::new(McpHandler::with_system_tools(SessionConfig::default(), collector))
    }

    async fn run_lines(handler: Arc<McpHandler>, input: &str) -> Vec<Value> {
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        StdioServer::new(handler)
            .run_with(input.as_bytes(), server_out)
            .await
            .unwrap();
        let lines: Vec<String> = FramedRead::new(client_out, LinesCodec::new())
            .map(|l| l.unwrap())
            .collect()
            .await;
        lines.iter().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_handshake_and_list() {
        let handler = handler();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#, "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, "\n",
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#, "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"get_system_info"}}"#, "\n",
        );
        let replies = run_lines(handler.clone(), input).await;
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["id"], 1);
        assert!(replies[0]["result"]["sessionId"].is_string());
        assert_eq!(replies[1]["result"]["tools"].as_array().unwrap().len(), 2);
        assert!(replies[2]["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("2 cores"));
        // EOF removes the implicit session
        assert!(handler.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_parse_errors_do_not_stop_the_loop() {
        let input = concat!(
            "not json\n",
            "42\n",
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#, "\n",
        );
        let replies = run_lines(handler(), input).await;
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["error"]["code"], -32700);
        assert_eq!(replies[1]["error"]["code"], -32700);
        assert_eq!(replies[2]["id"], 1);
    }

    #[tokio::test]
    async fn test_batch_line() {
        let input = concat!(
            r#"[{"jsonrpc":"2.0","id":1,"method":"initialize"},{"jsonrpc":"2.0","id":2,"method":"ping"}]"#,
            "\n",
        );
        let replies = run_lines(handler(), input).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_streaming_call_over_stdio() {
        let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(StdioServer::new(handler()).run_with(server_in, server_out));

        let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let call = json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "system_monitor_stream", "arguments": {"duration": "350ms", "interval": "100ms"}}});
        client_in
            .write_all(format!("{}\n{}\n", init, call).as_bytes())
            .await
            .unwrap();

        let mut lines = FramedRead::new(client_out, LinesCodec::new());
        let mut progress = 0;
        let terminal = loop {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let msg: Value = serde_json::from_str(&line).unwrap();
            if msg["method"] == "tool_progress" && msg["params"]["iteration"].is_u64() {
                progress += 1;
            }
            if msg["id"] == 2 {
                break msg;
            }
        };
        assert_eq!(terminal["result"]["status"], "completed");
        assert_eq!(terminal["result"]["total_samples"], progress);
        assert!(progress >= 2);

        drop(client_in);
        server.await.unwrap().unwrap();
    }
}
