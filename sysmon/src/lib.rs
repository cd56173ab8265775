//! sysmon: system-metric tools served over MCP
//!
//! Streamable HTTP with resumable SSE sessions ([`api`]) and line-delimited
//! stdio ([`stdio`]) share one dispatcher ([`mcp::McpHandler`]).

pub mod api;
pub mod collector;
pub mod config;
pub mod error;
pub mod mcp;
pub mod metrics;
pub mod security;
pub mod stdio;

pub use config::Config;
pub use error::{Error, Result};
