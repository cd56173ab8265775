//! Shared-secret access control

pub mod middleware;

pub use middleware::{auth_middleware, mask_key};
