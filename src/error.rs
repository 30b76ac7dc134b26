//! Error types for Agentry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Conversation error: {0}")]
    Conversation(String),

    #[error("Invocation error: {0}")]
    Invoke(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
