//! Relay authentication assertions.
//!
//! When a relay issues an AUTH challenge, the client answers with a
//! signed ephemeral event (kind 22242) binding the relay url, the
//! challenge value, and the moment of sending. The timestamp is
//! generated at send time and validated locally before the assertion
//! ever leaves the process: a relay will reject anything that drifts
//! more than an hour from its own clock, so there is no point
//! transmitting it.

use crate::event::{Event, EventTemplate};
use crate::unix_now;
use thiserror::Error;

/// Event kind for client authentication assertions.
pub const AUTH_KIND: u16 = 22242;

/// Tag name carrying the relay url.
pub const RELAY_TAG: &str = "relay";

/// Tag name carrying the challenge value.
pub const CHALLENGE_TAG: &str = "challenge";

/// Maximum tolerated drift between assertion timestamp and current time.
pub const MAX_TIMESTAMP_DRIFT_SECS: u64 = 3600;

/// Errors that can occur while building or validating an assertion.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid event kind: expected {AUTH_KIND}, got {0}")]
    InvalidKind(u16),

    #[error("missing required tag: {0}")]
    MissingTag(String),

    #[error("tag mismatch for {tag}: expected {expected}, got {actual}")]
    TagMismatch {
        tag: String,
        expected: String,
        actual: String,
    },

    #[error("timestamp drifts {drift_secs}s from current time (max {MAX_TIMESTAMP_DRIFT_SECS}s)")]
    TimestampDrift { drift_secs: u64 },
}

/// Signing capability supplied by the caller.
///
/// The engine never holds key material; whoever constructs it decides
/// whether signing is available at all. Without a signer, endpoints
/// simply stay unauthenticated.
pub trait Signer: Send + Sync {
    /// Public key the produced events will carry.
    fn public_key(&self) -> String;

    /// Sign an event template, producing a complete event.
    fn sign(&self, template: EventTemplate) -> Result<Event, AuthError>;
}

/// Build a signed assertion answering `challenge` from `relay_url`.
///
/// The timestamp is taken at call time, never cached, and the produced
/// assertion is validated before being returned.
pub fn build_assertion(
    relay_url: &str,
    challenge: &str,
    signer: &dyn Signer,
) -> Result<Event, AuthError> {
    let template = EventTemplate {
        created_at: unix_now(),
        kind: AUTH_KIND,
        tags: vec![
            vec![RELAY_TAG.to_string(), relay_url.to_string()],
            vec![CHALLENGE_TAG.to_string(), challenge.to_string()],
        ],
        content: String::new(),
    };
    let event = signer.sign(template)?;
    validate_assertion(&event, relay_url, challenge, unix_now())?;
    Ok(event)
}

/// Validate an assertion's kind, bindings, and timestamp drift.
pub fn validate_assertion(
    event: &Event,
    relay_url: &str,
    challenge: &str,
    now: u64,
) -> Result<(), AuthError> {
    if event.kind != AUTH_KIND {
        return Err(AuthError::InvalidKind(event.kind));
    }

    check_tag(event, RELAY_TAG, relay_url)?;
    check_tag(event, CHALLENGE_TAG, challenge)?;

    let drift = event.created_at.abs_diff(now);
    if drift > MAX_TIMESTAMP_DRIFT_SECS {
        return Err(AuthError::TimestampDrift { drift_secs: drift });
    }
    Ok(())
}

fn check_tag(event: &Event, tag: &str, expected: &str) -> Result<(), AuthError> {
    let actual = event
        .tag_value(tag)
        .ok_or_else(|| AuthError::MissingTag(tag.to_string()))?;
    if actual != expected {
        return Err(AuthError::TagMismatch {
            tag: tag.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
