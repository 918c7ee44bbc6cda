//! Error types for the chat bridge

use thiserror::Error;

/// Main error type for the chat bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Control error: {0}")]
    Control(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
