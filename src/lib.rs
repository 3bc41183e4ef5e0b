//! Cloud storage backend for LSM key-value stores.
//!
//! This crate provides a virtual file environment that lets an LSM engine
//! persist its immutable data files in S3-compatible object storage and its
//! write-ahead log in an ordered log stream, while still seeing the ordinary
//! local-filesystem interface it expects.
//!
//! # Architecture
//!
//! ```text
//! Engine file ops → CloudEnv ── data files ──→ object store (+ local cache)
//!                            ── log files  ──→ log stream ──→ tailer → cache
//!                            ── everything else ──→ local filesystem
//! ```
//!
//! Ownership of a shared storage prefix is coordinated through a small
//! pointer object (`CLOUDMANIFEST`) that names the currently authoritative
//! engine manifest; every writer open mints a fresh epoch so that files from
//! concurrent or stale writers never collide.

pub mod config;
pub mod dbid;
pub mod deferred;
pub mod env;
pub mod filename;
pub mod manifest;
pub mod purge;
pub mod remote;
pub mod savepoint;
pub mod stream;
pub mod tailer;

pub use config::{CloudConfig, EpochStrategy, RemotePath};
pub use env::{CloudEnv, EnvOptions, RandomAccessFile, SequentialFile, WritableFile};

use thiserror::Error;

/// Errors surfaced by the cloud storage backend.
///
/// Adapter layers translate wire-level failures into these kinds; nothing
/// below this enum escapes to callers.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The named object or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A retryable failure (network, 5xx). Already retried within the
    /// adapter's budget before being surfaced.
    #[error("transient error: {0}")]
    Transient(String),

    /// A non-retryable remote failure (4xx, bad arguments).
    #[error("permanent error: {0}")]
    Permanent(String),

    /// An invariant was violated: dangling manifest pointer, malformed
    /// stream record, and similar.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The retry budget for a transient failure was exhausted.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation is forbidden on this file class (e.g. renaming a data
    /// or log file).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An unexpected internal failure, including an unhealthy tailer.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// Whether the error is a candidate for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }

    /// Whether the error means "no such object", across both the remote and
    /// local representations.
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::NotFound(_) => true,
            CloudError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<object_store::Error> for CloudError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => CloudError::NotFound(path),
            object_store::Error::AlreadyExists { path, .. } => {
                CloudError::Permanent(format!("already exists: {path}"))
            }
            object_store::Error::Precondition { path, .. } => {
                CloudError::Permanent(format!("precondition failed: {path}"))
            }
            object_store::Error::InvalidPath { .. } => CloudError::Permanent(e.to_string()),
            object_store::Error::NotImplemented => CloudError::NotSupported(e.to_string()),
            object_store::Error::UnknownConfigurationKey { .. } => {
                CloudError::Permanent(e.to_string())
            }
            // Generic covers network and server-side failures; treat
            // anything unrecognized as retryable.
            other => CloudError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(e: serde_json::Error) -> Self {
        CloudError::Corruption(e.to_string())
    }
}

/// Result type alias for cloud storage operations.
pub type CloudResult<T> = Result<T, CloudError>;
