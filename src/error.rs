//! Error types for the fetch pipeline
//!
//! Each layer gets its own enum: configuration, the credential layer, a single
//! network attempt, local persistence. `FailureKind` is the classification the
//! scheduler and the run summary work with.

use std::fmt;
use thiserror::Error;

/// Invalid or missing configuration. Fatal: the run never starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable required")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read symbols file {path}: {reason}")]
    SymbolsFile { path: String, reason: String },
}

/// Failures of the credential layer (token endpoint, authorization code).
#[derive(Debug, Error)]
pub enum AuthError {
    /// The endpoint refused the grant: the code or refresh token is bad.
    #[error("token endpoint rejected the grant (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token endpoint request failed: {0}")]
    Transport(String),

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("authorization code unavailable: {0}")]
    CodeUnavailable(String),

    #[error("no usable credential")]
    Unavailable,
}

impl AuthError {
    /// Whether the refresh credential itself should be considered dead.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::Rejected { .. })
    }
}

/// Outcome of one network attempt against the price-history endpoint.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by remote (HTTP 429)")]
    RateLimited,

    #[error("authorization rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Parse(String),

    #[error("no access token available")]
    NoCredential,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::RateLimited => FailureKind::RemoteRateLimited,
            FetchError::Auth { .. } | FetchError::NoCredential => FailureKind::Auth,
            FetchError::Timeout | FetchError::Transient(_) | FetchError::Parse(_) => {
                FailureKind::Transient
            }
            FetchError::Http { .. } => FailureKind::NonRetryable,
        }
    }
}

/// Local state file could not be written or read back.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl PersistenceError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Terminal classification of a failed work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Auth,
    RemoteRateLimited,
    Transient,
    NonRetryable,
    Persistence,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Whether an immediate re-run is likely to help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::RemoteRateLimited | FailureKind::Transient | FailureKind::Cancelled
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Auth => "auth",
            FailureKind::RemoteRateLimited => "remote-rate-limited",
            FailureKind::Transient => "transient",
            FailureKind::NonRetryable => "non-retryable",
            FailureKind::Persistence => "persistence",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// A work unit that ended without success.
#[derive(Debug, Error)]
#[error("{kind} failure after {attempts} attempt(s): {source}")]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub attempts: u32,
    #[source]
    pub source: FetchError,
}

impl UnitFailure {
    pub fn new(source: FetchError, attempts: u32) -> Self {
        Self {
            kind: source.kind(),
            attempts,
            source,
        }
    }
}
