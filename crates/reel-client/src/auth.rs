//! Per-endpoint authentication handshake.
//!
//! Relays that gate content behind authentication send an AUTH
//! challenge after connecting. The handler answers with a signed
//! assertion and tracks each endpoint's progress through the
//! handshake. Authentication failure is soft: the endpoint stays
//! usable for whatever the relay serves unauthenticated.

use crate::connection::RelayConnection;
use crate::message::ClientMessage;
use reel_core::auth::{Signer, build_assertion};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake progress for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No challenge received, or the last attempt failed
    Unauthenticated,
    /// Challenge received, response not yet sent
    ChallengeReceived,
    /// Assertion sent, awaiting the relay's verdict
    Responding,
    /// Relay accepted the assertion
    Authenticated,
}

/// Answers relay AUTH challenges and tracks per-endpoint state.
pub struct AuthHandler {
    signer: Option<Arc<dyn Signer>>,
    states: RwLock<HashMap<String, AuthState>>,
}

impl AuthHandler {
    /// Create a handler. Without a signer every challenge is declined
    /// and endpoints stay unauthenticated.
    pub fn new(signer: Option<Arc<dyn Signer>>) -> Self {
        Self {
            signer,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Handshake state for one endpoint.
    pub async fn state_of(&self, url: &str) -> AuthState {
        self.states
            .read()
            .await
            .get(url)
            .copied()
            .unwrap_or(AuthState::Unauthenticated)
    }

    /// Forget an endpoint's handshake progress, e.g. after disconnect.
    /// A reconnected relay issues a fresh challenge.
    pub async fn reset(&self, url: &str) {
        self.states.write().await.remove(url);
    }

    /// Answer a challenge from `conn`'s relay.
    ///
    /// Never returns an error: every failure mode downgrades to
    /// `Unauthenticated` and is logged, because an endpoint that
    /// rejects our assertion is still worth keeping for public events.
    pub async fn handle_challenge(&self, conn: &RelayConnection, challenge: &str) {
        let url = conn.url().to_string();
        self.states
            .write()
            .await
            .insert(url.clone(), AuthState::ChallengeReceived);

        let Some(signer) = &self.signer else {
            debug!(url = %url, "auth challenge received but no signer configured");
            return;
        };

        let assertion = match build_assertion(&url, challenge, signer.as_ref()) {
            Ok(event) => event,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to build auth assertion");
                self.states
                    .write()
                    .await
                    .insert(url, AuthState::Unauthenticated);
                return;
            }
        };

        self.states
            .write()
            .await
            .insert(url.clone(), AuthState::Responding);

        let event_id = assertion.id.clone();
        let message = ClientMessage::Auth(assertion);
        match conn.send_with_ack(&event_id, &message, ACK_TIMEOUT).await {
            Ok(receipt) if receipt.accepted => {
                info!(url = %url, "authenticated with relay");
                self.states
                    .write()
                    .await
                    .insert(url, AuthState::Authenticated);
            }
            Ok(receipt) => {
                warn!(url = %url, reason = %receipt.message, "relay rejected auth assertion");
                self.states
                    .write()
                    .await
                    .insert(url, AuthState::Unauthenticated);
            }
            Err(e) => {
                warn!(url = %url, error = %e, "auth handshake failed");
                self.states
                    .write()
                    .await
                    .insert(url, AuthState::Unauthenticated);
            }
        }
    }
}
