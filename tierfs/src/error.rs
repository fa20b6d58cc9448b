//! Crate-wide error type.
//!
//! Mirrors the failure classes the cache engine distinguishes: state that
//! vanished on the metadata service, caller-contract violations, local disk
//! failures and failures reported by a remote collaborator. Throttling is not
//! an error here; throttles delay the caller instead.

use crate::meta::MetaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Inode or chunk-map entry is gone on the authoritative side.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-contract violation; nothing was modified.
    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata service or object store returned a failure.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("config error: {0}")]
    Config(String),

    /// A queue or background task has already been stopped.
    #[error("shut down: {0}")]
    Shutdown(&'static str),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub(crate) fn remote(e: impl std::fmt::Display) -> Self {
        Error::Remote(e.to_string())
    }
}

impl From<MetaError> for Error {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotFound(what) => Error::NotFound(what),
            MetaError::Param(msg) => Error::Param(msg),
            MetaError::Remote(msg) => Error::Remote(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
