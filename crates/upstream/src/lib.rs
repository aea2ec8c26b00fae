//! Upstream access for the price cache.
//!
//! This crate knows how to talk to a rate-limited price API:
//!
//! - [`transport`]: HTTP GET with bounded, jittered retries
//! - [`credentials`]: paid/demo/anonymous keys with cooldown and per-kind rate limits
//! - [`request`]: endpoint templates and URL construction
//! - [`chunked`]: splitting identifier lists into request-sized chunks
//! - [`client`]: the production [`BatchClient`] built from the pieces above
//!
//! Payloads are passed through as raw JSON bytes; nothing here knows the
//! shape of a price record.

pub mod chunked;
pub mod client;
pub mod credentials;
pub mod errors;
pub mod models;
pub mod request;
pub mod transport;

pub use chunked::{plan_chunks, BatchClient, ChunkConfig, ChunkSink, ChunkedFetcher, NoopSink};
pub use client::{split_payloads, UpstreamClient};
pub use credentials::{
    CredentialSet, KeyRotator, RateLimitConfig, RateLimitPolicy, RotatorConfig,
};
pub use errors::{RetryClass, UpstreamError};
pub use models::{Credential, CredentialKind, Payloads};
pub use request::{EndpointConfig, EndpointTemplate, FetchMode, RequestBuilder};
pub use transport::{
    AttemptOutcome, RetryConfig, RetryTransport, StatusEvent, StatusHandler, TransportResponse,
    UpstreamRequest,
};
