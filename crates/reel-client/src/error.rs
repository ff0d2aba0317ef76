//! Client error types.

use thiserror::Error;

/// Client error type.
///
/// Transport and protocol failures are resolved locally (reconnect or
/// drop) and surface only through status streams; the variants here
/// that reach callers synchronously are `SubscriptionCapacity`,
/// `ResourceAcquisition` (via item state), and the construction-time
/// validation errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connect or send failure; retryable via backoff
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame; dropped and logged
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid endpoint URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Not connected to relay
    #[error("not connected to relay")]
    NotConnected,

    /// Already connected to relay
    #[error("already connected to relay")]
    AlreadyConnected,

    /// Multiplexer at its distinct-signature cap; caller must back off
    #[error("subscription capacity reached: {active} of {cap} distinct filters active")]
    SubscriptionCapacity { active: usize, cap: usize },

    /// Preload failure; retryable up to the circuit-breaker limit
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(String),

    /// Signing unavailable or relay rejected the assertion; soft failure
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
