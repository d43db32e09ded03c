//! Error types for update synthesis.
//!
//! Only conditions that terminate a run live here. A rejected downgrade or an
//! already up-to-date system is normal control flow and is reported through
//! [`crate::update::Outcome`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a [`crate::feed::RevisionFeed`] or [`crate::feed::BlobStore`].
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("revision '{0}' not found")]
    RevisionNotFound(String),

    #[error("blob '{0}' not found")]
    BlobNotFound(String),

    #[error("invalid blob reference: {0}")]
    InvalidBlob(String),

    #[error("malformed revision record '{path}': {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("feed I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("feed closed: {0}")]
    Closed(String),
}

/// Terminating failures of an update run.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Missing or malformed operator input.
    #[error("{0}")]
    Usage(String),

    #[error("{0} is not a valid message reference")]
    InvalidReference(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Streamed content does not match its declared checksum.
    #[error("checksum mismatch for {filename}: {actual} !== {expected}")]
    Integrity {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] FeedError),

    #[error("failed to read {path}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("packaging failed at {path}: {source}")]
    Packaging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UpdateError {
    pub fn packaging<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::Packaging {
            path: path.into(),
            source,
        }
    }
}
