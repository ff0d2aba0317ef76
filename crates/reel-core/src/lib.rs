//! Protocol value types for the reel feed engine.
//!
//! This crate holds everything that can be reasoned about without a
//! runtime: the event structure carried on the relay wire, subscription
//! filters and their normalized signatures, and the authentication
//! assertion built in response to relay challenges. The connection and
//! cache machinery lives in `reel-client`.

pub mod auth;
pub mod event;
pub mod filter;

pub use auth::{AuthError, Signer, build_assertion, validate_assertion};
pub use event::{Event, EventTemplate, MEDIA_EXTENSIONS};
pub use filter::{Filter, FilterSignature};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
