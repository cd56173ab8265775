use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Metrics collection failed: {0}")]
    Collector(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
