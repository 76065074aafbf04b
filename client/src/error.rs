//! Error types for the client runtime.

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Engine error: {0}")]
    Engine(#[from] ghostline_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("No bucket on channel {0}")]
    UnknownChannel(u32),

    #[error("Bucket already registered: {0}")]
    DuplicateBucket(String),

    #[error("Worker for bucket {0} has stopped")]
    WorkerGone(String),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
