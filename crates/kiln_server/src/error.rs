//! # Server Error Types
//!
//! Errors surfaced by the tick-thread side of the server.

use std::path::PathBuf;

use kiln_core::{PoolError, PromiseError};
use thiserror::Error;

use crate::session::SessionId;

/// Errors raised by the server context and its pipeline.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The worker pool refused a task.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A promise was settled twice or read too early.
    #[error(transparent)]
    Promise(#[from] PromiseError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A capability registration conflicted.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A session with this id is already registered.
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),

    /// No session with this id is registered.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// A background thread could not be started.
    #[error("failed to start {what}: {source}")]
    Thread {
        /// Which thread.
        what: &'static str,
        /// The OS error.
        source: std::io::Error,
    },
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// The OS error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range and has no sensible fallback.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Capability registry conflicts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A default implementation was already registered.
    #[error("a default implementation of {api} is already registered")]
    DefaultAlreadyProvided {
        /// Capability type name.
        api: &'static str,
    },

    /// An override was already registered by someone else.
    #[error("{api} is already overridden by {owner}")]
    AlreadyOverridden {
        /// Capability type name.
        api: &'static str,
        /// Owner of the existing override.
        owner: String,
    },

    /// An override was offered for a capability with no default.
    #[error("no default implementation of {api} to override")]
    NoDefault {
        /// Capability type name.
        api: &'static str,
    },
}
