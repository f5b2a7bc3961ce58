//! The error taxonomy shared by every fallible operation in this crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("cache invalid: {0}")]
    CacheInvalid(String),

    #[error("entry corrupt: {0}")]
    EntryCorrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, CacheError>;
