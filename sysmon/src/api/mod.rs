//! HTTP transport (axum)

pub mod handlers;
pub mod routes;
pub mod server;
pub mod sse;

pub use server::{ApiServer, AppState};
