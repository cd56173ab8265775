//! MCP tool registry and definitions

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::duration::parse_duration;
use crate::collector::MetricsCollector;
use crate::{Error, Result};

pub const DEFAULT_STREAM_DURATION: &str = "30s";
pub const DEFAULT_STREAM_INTERVAL: &str = "2s";

/// Context passed to tool calls
#[derive(Clone)]
pub struct ToolContext {
    pub collector: Arc<dyn MetricsCollector>,
}

/// A tool that answers with a single text result
#[async_trait]
pub trait McpTool: Send + Sync {
    /// Tool name (used in tools/call)
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    /// Execute the tool, returning the text content
    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

/// How long a streaming tool runs and how often it samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSchedule {
    pub duration: Duration,
    pub interval: Duration,
}

/// A tool whose result is delivered as a series of progress notifications
/// followed by one terminal result
pub trait StreamingTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> Value;

    /// Validate arguments before anything is started
    fn schedule(&self, params: &Value) -> Result<StreamSchedule>;
}

#[derive(Clone)]
pub enum RegisteredTool {
    Unary(Arc<dyn McpTool>),
    Streaming(Arc<dyn StreamingTool>),
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        match self {
            RegisteredTool::Unary(t) => t.name(),
            RegisteredTool::Streaming(t) => t.name(),
        }
    }

    /// Catalog entry in MCP format
    pub fn descriptor(&self) -> Value {
        let (name, description, schema) = match self {
            RegisteredTool::Unary(t) => (t.name(), t.description(), t.input_schema()),
            RegisteredTool::Streaming(t) => (t.name(), t.description(), t.input_schema()),
        };
        json!({
            "name": name,
            "description": description,
            "inputSchema": schema
        })
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, RegisteredTool::Streaming(_))
    }
}

/// Registry of available MCP tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the system tools installed
    pub fn with_system_tools() -> Self {
        let mut registry = Self::new();
        register_system_tools(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn McpTool>) {
        self.tools
            .insert(tool.name().to_string(), RegisteredTool::Unary(tool));
    }

    pub fn register_streaming(&mut self, tool: Arc<dyn StreamingTool>) {
        self.tools
            .insert(tool.name().to_string(), RegisteredTool::Streaming(tool));
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// List all tools in MCP format, sorted by name
    pub fn list(&self) -> Vec<Value> {
        self.tools.values().map(RegisteredTool::descriptor).collect()
    }

    /// Whether `name` is a streaming tool
    pub fn is_streaming(&self, name: &str) -> bool {
        self.get(name).is_some_and(RegisteredTool::is_streaming)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// One-shot CPU and memory snapshot
pub struct GetSystemInfoTool;

#[async_trait]
impl McpTool for GetSystemInfoTool {
    fn name(&self) -> &str {
        "get_system_info"
    }

    fn description(&self) -> &str {
        "Gets system information: CPU and memory"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn call(&self, _params: Value, ctx: &ToolContext) -> Result<String> {
        let snapshot = ctx.collector.collect().await?;
        tracing::debug!(
            cpu_count = snapshot.cpu.count,
            cpu_usage = snapshot.cpu.usage_percent,
            memory_total = snapshot.memory.total_bytes,
            memory_used_percent = snapshot.memory.used_percent,
            "System information retrieved"
        );
        Ok(format!(
            "{}\n\n{}",
            snapshot.format_text(),
            serde_json::to_string_pretty(&snapshot)?
        ))
    }
}

/// Periodic CPU and memory samples over a bounded duration
pub struct SystemMonitorStreamTool;

impl SystemMonitorStreamTool {
    fn duration_arg(params: &Value, key: &str, default: &str) -> Result<Duration> {
        match params.get(key) {
            None | Some(Value::Null) => parse_duration(default),
            Some(Value::String(s)) if s.is_empty() => parse_duration(default),
            Some(Value::String(s)) => parse_duration(s)
                .map_err(|e| Error::InvalidParams(format!("invalid {} format: {}", key, e))),
            Some(other) => Err(Error::InvalidParams(format!(
                "{} must be a duration string, got {}",
                key, other
            ))),
        }
    }
}

impl StreamingTool for SystemMonitorStreamTool {
    fn name(&self) -> &str {
        "system_monitor_stream"
    }

    fn description(&self) -> &str {
        "Streams real-time system information: CPU and memory monitoring"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "duration": {
                    "type": "string",
                    "description": "Monitoring duration (e.g., '30s', '5m')",
                    "default": DEFAULT_STREAM_DURATION
                },
                "interval": {
                    "type": "string",
                    "description": "Update interval (e.g., '1s', '2s')",
                    "default": DEFAULT_STREAM_INTERVAL
                }
            },
            "required": []
        })
    }

    fn schedule(&self, params: &Value) -> Result<StreamSchedule> {
        let duration = Self::duration_arg(params, "duration", DEFAULT_STREAM_DURATION)?;
        let interval = Self::duration_arg(params, "interval", DEFAULT_STREAM_INTERVAL)?;
        if interval.is_zero() {
            return Err(Error::InvalidParams("interval must be greater than zero".to_string()));
        }
        Ok(StreamSchedule { duration, interval })
    }
}

/// Register the built-in system tools
pub fn register_system_tools(registry: &mut ToolRegistry) {
    registry.register(Arc::new(GetSystemInfoTool));
    registry.register_streaming(Arc::new(SystemMonitorStreamTool));
}
