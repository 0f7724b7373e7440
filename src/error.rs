use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable { backend: &'static str, message: String },

    #[error("{backend} backend failed: {message}")]
    Backend { backend: &'static str, message: String },

    #[error("clang AST dump could not be recovered: {0}")]
    UnrecoverableDump(String),

    #[error("detector {name} failed: {message}")]
    Detector { name: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{path:?} is {size} bytes, limit is {limit}")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("analysis of {path:?} exceeded {seconds}s")]
    Timeout { path: PathBuf, seconds: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
