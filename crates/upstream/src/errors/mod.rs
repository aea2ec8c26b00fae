//! Error types and retry classification for upstream fetching.
//!
//! This module provides:
//! - [`UpstreamError`]: The error enum for all upstream operations
//! - [`RetryClass`]: Classification for determining retry behavior

mod retry;

pub use retry::RetryClass;

use thiserror::Error;

/// Status codes the transport retries.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Returns true when an HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Errors that can occur while talking to the upstream price API.
///
/// Each variant is classified into a [`RetryClass`] via
/// [`retry_class`](Self::retry_class).
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Connection refused, DNS failure, timeout, or any other failure before
    /// a response arrived.
    #[error("Transport error: {message}")]
    Transport {
        /// Error text from the HTTP client
        message: String,
        /// Whether the client reported a timeout
        timeout: bool,
    },

    /// The upstream answered with a non-success status.
    #[error("HTTP {status} from upstream: {body}")]
    Status {
        /// The HTTP status code
        status: u16,
        /// Leading part of the response body, for diagnostics
        body: String,
    },

    /// The response body could not be read.
    #[error("Failed to read response body: {0}")]
    BodyRead(String),

    /// The response body was readable but not in the expected shape.
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Every attempt of the retry budget failed.
    #[error("Request failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// The last error seen
        #[source]
        source: Box<UpstreamError>,
    },

    /// Every available credential was tried and failed.
    #[error("All {tried} credential(s) failed, last error: {source}")]
    CredentialsExhausted {
        /// Number of credentials that were actually used
        tried: usize,
        /// The last underlying error
        #[source]
        source: Box<UpstreamError>,
    },

    /// No credential is currently usable: none configured, all cooling down,
    /// or all skipped by the local rate limiter.
    #[error("No credentials available: {0}")]
    NoCredentialsAvailable(String),

    /// The endpoint template is missing a required placeholder or has both.
    #[error("Invalid endpoint template '{template}': {message}")]
    InvalidTemplate {
        /// The offending template
        template: String,
        /// What is wrong with it
        message: String,
    },

    /// A chunk of a larger fetch failed.
    #[error("Chunk {index}/{total} ({ids} ids) failed: {source}")]
    ChunkFailed {
        /// One-based chunk index
        index: usize,
        /// Number of chunks in the fetch
        total: usize,
        /// Number of identifiers in the chunk
        ids: usize,
        /// The underlying error
        #[source]
        source: Box<UpstreamError>,
    },

    /// Invalid local configuration (HTTP client, rate limits, ...).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The operation was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,
}

impl UpstreamError {
    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use pricecache_upstream::errors::{RetryClass, UpstreamError};
    ///
    /// let error = UpstreamError::Status { status: 503, body: String::new() };
    /// assert_eq!(error.retry_class(), RetryClass::Retry);
    ///
    /// let error = UpstreamError::Status { status: 400, body: String::new() };
    /// assert_eq!(error.retry_class(), RetryClass::NextCredential);
    ///
    /// assert_eq!(UpstreamError::Cancelled.retry_class(), RetryClass::Never);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transport { .. } => RetryClass::Retry,
            Self::Status { status, .. } if is_retryable_status(*status) => RetryClass::Retry,

            Self::Status { .. }
            | Self::BodyRead(_)
            | Self::InvalidResponse(_)
            | Self::RetriesExhausted { .. } => RetryClass::NextCredential,

            // Wrappers keep the class of what they wrap when it is terminal.
            Self::CredentialsExhausted { source, .. } | Self::ChunkFailed { source, .. } => {
                match source.retry_class() {
                    RetryClass::Never => RetryClass::Never,
                    _ => RetryClass::NextCredential,
                }
            }

            Self::NoCredentialsAvailable(_) => RetryClass::NextCredential,

            Self::InvalidTemplate { .. } | Self::Config(_) | Self::Cancelled => RetryClass::Never,
        }
    }

    /// True if this error, or anything it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RetriesExhausted { source, .. }
            | Self::CredentialsExhausted { source, .. }
            | Self::ChunkFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True for an upstream 429 anywhere in the chain.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Status { status: 429, .. } => true,
            Self::RetriesExhausted { source, .. }
            | Self::CredentialsExhausted { source, .. }
            | Self::ChunkFailed { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(error: &reqwest::Error) -> Self {
        Self::Transport {
            message: error.to_string(),
            timeout: error.is_timeout(),
        }
    }
}
