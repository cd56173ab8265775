//! Drives streaming tools: periodic samples pushed into a session outbox

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::duration::format_duration;
use super::message::{request_key, JsonRpcNotification, JsonRpcResponse};
use super::session::{OutboundMessage, Session, SessionError};
use super::tools::StreamSchedule;
use crate::collector::MetricsCollector;
use crate::metrics;

pub const PROGRESS_METHOD: &str = "tool_progress";

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Deadline reached and the terminal result was queued
    Completed { samples: u64 },
    /// Cancelled by the client or by session removal
    Cancelled { samples: u64 },
    /// The session outbox went away
    Closed { samples: u64 },
}

/// Whether the loop may keep going after an enqueue attempt
enum Delivery {
    Continue,
    Stop,
}

pub struct StreamingToolRunner {
    collector: Arc<dyn MetricsCollector>,
}

impl StreamingToolRunner {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector }
    }

    /// Queue the start notification and spawn the sampling loop.
    ///
    /// The loop is registered as an in-flight call on the session under the
    /// request id, so `notifications/cancelled` and session removal stop it.
    pub fn start(
        &self,
        session: Arc<Session>,
        request_id: Value,
        tool: &str,
        schedule: StreamSchedule,
    ) -> JoinHandle<RunOutcome> {
        let key = request_key(&request_id);
        let cancel = session.register_call(key.clone());

        tracing::info!(
            session_id = %session.id(),
            tool = %tool,
            request_id = %key,
            duration = %format_duration(schedule.duration),
            interval = %format_duration(schedule.interval),
            "Starting streaming tool"
        );

        let start = progress(json!({
            "phase": "start",
            "requestId": request_id,
            "duration": format_duration(schedule.duration),
            "interval": format_duration(schedule.interval),
        }), &key);
        let proceed = matches!(deliver(&session, start), Delivery::Continue);

        let run = SampleLoop {
            session,
            collector: self.collector.clone(),
            request_id,
            key,
            schedule,
            cancel,
        };
        tokio::spawn(async move {
            if !proceed {
                run.session.finish_call(&run.key);
                return RunOutcome::Closed { samples: 0 };
            }
            run.run().await
        })
    }
}

struct SampleLoop {
    session: Arc<Session>,
    collector: Arc<dyn MetricsCollector>,
    request_id: Value,
    key: String,
    schedule: StreamSchedule,
    cancel: CancellationToken,
}

impl SampleLoop {
    async fn run(self) -> RunOutcome {
        let outcome = self.sample_until_deadline().await;
        self.session.finish_call(&self.key);

        match outcome {
            RunOutcome::Completed { samples } => {
                tracing::info!(session_id = %self.session.id(), request_id = %self.key, samples, "Stream completed");
            }
            RunOutcome::Cancelled { samples } => {
                tracing::info!(session_id = %self.session.id(), request_id = %self.key, samples, "Stream cancelled");
            }
            RunOutcome::Closed { samples } => {
                tracing::debug!(session_id = %self.session.id(), request_id = %self.key, samples, "Session closed, stream stopped");
            }
        }
        outcome
    }

    async fn sample_until_deadline(&self) -> RunOutcome {
        let started = Instant::now();
        let deadline = started + self.schedule.duration;
        let mut ticker = tokio::time::interval_at(started + self.schedule.interval, self.schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut iteration: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return RunOutcome::Cancelled { samples: iteration };
                }
                _ = ticker.tick() => {}
            }

            if Instant::now() >= deadline {
                return self.finish(iteration, started.elapsed());
            }

            iteration += 1;
            let params = match self.collector.collect().await {
                Ok(snapshot) => {
                    metrics::record_tool_sample(true);
                    tracing::debug!(
                        session_id = %self.session.id(),
                        iteration,
                        cpu_usage = snapshot.cpu.usage_percent,
                        memory_usage = snapshot.memory.used_percent,
                        "Sample collected"
                    );
                    json!({
                        "requestId": self.request_id,
                        "iteration": iteration,
                        "timestamp": Utc::now().to_rfc3339(),
                        "cpu": round2(snapshot.cpu.usage_percent),
                        "memory": round2(snapshot.memory.used_percent),
                    })
                }
                Err(e) => {
                    metrics::record_tool_sample(false);
                    tracing::warn!(session_id = %self.session.id(), iteration, error = %e, "Sample collection failed");
                    json!({
                        "requestId": self.request_id,
                        "iteration": iteration,
                        "error": e.to_string(),
                    })
                }
            };

            // Cancellation observed while collecting wins over delivery
            if self.cancel.is_cancelled() {
                return RunOutcome::Cancelled { samples: iteration - 1 };
            }

            if let Delivery::Stop = deliver(&self.session, progress(params, &self.key)) {
                return RunOutcome::Closed { samples: iteration };
            }
        }
    }

    fn finish(&self, samples: u64, elapsed: std::time::Duration) -> RunOutcome {
        let result = JsonRpcResponse::success(
            self.request_id.clone(),
            json!({
                "status": "completed",
                "total_samples": samples,
                "content": [{
                    "type": "text",
                    "text": format!(
                        "System monitor stream completed: {} samples over {}",
                        samples,
                        format_duration(elapsed)
                    )
                }]
            }),
        );

        let message = match OutboundMessage::response(&result, self.key.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(session_id = %self.session.id(), error = %e, "Failed to encode terminal result");
                return RunOutcome::Closed { samples };
            }
        };

        match self.session.send(message) {
            Ok(()) => RunOutcome::Completed { samples },
            Err(SessionError::ChannelFull) => {
                tracing::error!(session_id = %self.session.id(), request_id = %self.key, "Outbox full, terminal result lost");
                RunOutcome::Completed { samples }
            }
            Err(SessionError::Closed) => RunOutcome::Closed { samples },
        }
    }
}

fn progress(params: Value, key: &str) -> Option<OutboundMessage> {
    OutboundMessage::progress(
        &JsonRpcNotification::new(PROGRESS_METHOD, params),
        key.to_string(),
    )
    .ok()
}

fn deliver(session: &Session, message: Option<OutboundMessage>) -> Delivery {
    let Some(message) = message else {
        return Delivery::Continue;
    };
    match session.send(message) {
        Ok(()) => Delivery::Continue,
        Err(SessionError::ChannelFull) => {
            tracing::warn!(session_id = %session.id(), "Outbox full, progress sample dropped");
            Delivery::Continue
        }
        Err(SessionError::Closed) => Delivery::Stop,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
