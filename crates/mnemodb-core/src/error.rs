use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MnemoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("store format error: {0}")]
    StoreFormat(String),
    #[error("store opened read-only: {0}")]
    ReadOnlyStore(PathBuf),
    #[error("index not found: {0}")]
    IndexNotFound(PathBuf),
    #[error("index format error: {0}")]
    IndexFormat(String),
    #[error("malformed id index: {0}")]
    MalformedIndex(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, MnemoError>;
