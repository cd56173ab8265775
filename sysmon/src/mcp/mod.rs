//! MCP (Model Context Protocol) core
//!
//! - SessionStore: session lifetimes, outboxes and replay logs
//! - McpHandler: JSON-RPC 2.0 dispatch against session state
//! - StreamingToolRunner: periodic sampling into a session outbox
//! - ToolRegistry: static tool catalog

pub mod duration;
pub mod event_log;
pub mod handler;
pub mod message;
pub mod runner;
pub mod session;
pub mod tools;

pub use handler::{BatchOutcome, Dispatched, McpHandler};
pub use message::{JsonRpcResponse, RpcErrorKind};
pub use session::{Provisioning, Session, SessionStore};
pub use tools::{ToolContext, ToolRegistry};
