//! Typed errors. Only configuration problems are fatal, and only at startup.

use std::path::PathBuf;

use crate::model::RunId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("history io error")]
    Io(#[from] std::io::Error),
    #[error("history encoding error")]
    Encoding(#[from] serde_json::Error),
    #[error("entry for run {got} is older than stored run {latest}")]
    OutOfOrder { latest: RunId, got: RunId },
    #[error("history store unavailable: {0}")]
    Unavailable(String),
}
