use std::path::PathBuf;
use thiserror::Error;

/// Errors from harness operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reasoning error: {0}")]
    Reason(#[from] trellis_reason::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("unsupported model family: {0}")]
    UnsupportedFamily(String),
}

pub type Result<T> = std::result::Result<T, Error>;
