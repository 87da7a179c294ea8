//! Error types for the sync layer.

use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for upstream API calls.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Result type for fetcher streams.
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type for catalog calls.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// An upstream API failure, split by whether retrying can help.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Timeouts, 429 and 5xx.
    #[error("retryable upstream error: {message}")]
    Retryable {
        message: String,
        status: Option<u16>,
        /// Server-requested delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// Authentication failures and other permanent 4xx responses.
    #[error("fatal upstream error: {message}")]
    Fatal {
        message: String,
        status: Option<u16>,
    },
}

impl UpstreamError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            status: None,
        }
    }

    /// Classifies an HTTP error status: 408, 429 and 5xx are retryable,
    /// everything else is fatal.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        if status == 408 || status == 429 || (500..600).contains(&status) {
            Self::Retryable {
                message,
                status: Some(status),
                retry_after,
            }
        } else {
            Self::Fatal {
                message,
                status: Some(status),
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { retry_after, .. } => *retry_after,
            Self::Fatal { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Retryable { status, .. } | Self::Fatal { status, .. } => *status,
        }
    }
}

/// A fetch that could not complete. Tagged with the kind and the page so the
/// coordinator can apply the kind's error policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetching '{kind}' failed on page {page} after {attempts} attempt(s): {source}")]
    Upstream {
        kind: String,
        page: usize,
        attempts: u32,
        source: UpstreamError,
    },

    #[error("fetching '{kind}' was cancelled on page {page}")]
    Cancelled { kind: String, page: usize },
}

impl FetchError {
    pub fn kind(&self) -> &str {
        match self {
            Self::Upstream { kind, .. } | Self::Cancelled { kind, .. } => kind,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A catalog call that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// The catalog refused the write: validation failure, conflict, unknown
    /// blueprint.
    #[error("catalog rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The catalog could not be reached or answered with a server error.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    /// The catalog answered with a body we could not decode.
    #[error("could not decode catalog response: {0}")]
    Decode(String),
}

impl CatalogError {
    /// Whether the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors surfaced by the runtime and listeners.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mapping error: {0}")]
    Mapping(#[from] ocean_mapping::Error),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// An event payload that cannot be understood. Retrying will not help.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker queue is full.
    #[error("event queue is full")]
    QueueFull,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A spawned task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether processing the same input again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_retryable(),
            Self::Fetch(FetchError::Upstream { source, .. }) => source.is_retryable(),
            Self::Fetch(FetchError::Cancelled { .. }) => true,
            Self::Catalog(e) => e.is_transient(),
            Self::Io(_) | Self::QueueFull => true,
            Self::Mapping(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::InvalidEvent(_)
            | Self::ChannelClosed
            | Self::Task(_) => false,
        }
    }
}
