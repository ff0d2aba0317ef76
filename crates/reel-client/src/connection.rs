//! Single relay endpoint connection.
//!
//! One persistent WebSocket per endpoint: connect with a deadline,
//! decode inbound frames once into [`RelayMessage`], publish them on a
//! broadcast stream, and track publish acknowledgments. Reconnect
//! scheduling lives in the pool's supervisor; this type only owns the
//! backoff counters.

use crate::backoff::Backoff;
use crate::config::CoreConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-endpoint transport configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Base reconnection delay
    pub reconnect_base: Duration,
    /// Maximum reconnection delay, also the extended cool-down length
    pub reconnect_cap: Duration,
    /// Consecutive failures before the extended cool-down
    pub max_reconnect_attempts: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(2),
            reconnect_cap: Duration::from_secs(30 * 60),
            max_reconnect_attempts: 8,
        }
    }
}

impl EndpointConfig {
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            reconnect_base: config.reconnect_base,
            reconnect_cap: config.reconnect_cap,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Acknowledgment for a published event.
#[derive(Debug, Clone)]
pub struct OkReceipt {
    /// Event ID the relay acknowledged
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Relay message (empty if accepted, reason if rejected)
    pub message: String,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckSender = oneshot::Sender<OkReceipt>;

/// One endpoint's persistent connection.
pub struct RelayConnection {
    url: Url,
    config: EndpointConfig,
    state_tx: watch::Sender<ConnectionState>,
    ws: Arc<Mutex<Option<WsStream>>>,
    /// Decoded inbound frames
    messages_tx: broadcast::Sender<RelayMessage>,
    /// Pending publish acknowledgments (event_id -> oneshot sender)
    pending_acks: Arc<Mutex<HashMap<String, AckSender>>>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    backoff: Mutex<Backoff>,
}

impl RelayConnection {
    /// Create a new connection (does not connect yet).
    pub fn new(url: &str, config: EndpointConfig) -> Result<Self> {
        let url = Url::parse(url)?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (messages_tx, _) = broadcast::channel(1024);
        let backoff = Backoff::new(
            config.reconnect_base,
            config.reconnect_cap,
            config.max_reconnect_attempts,
        );

        Ok(Self {
            url,
            config,
            state_tx,
            ws: Arc::new(Mutex::new(None)),
            messages_tx,
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Mutex::new(None),
            backoff: Mutex::new(backoff),
        })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Stream of decoded inbound frames.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.messages_tx.subscribe()
    }

    /// Connect to the endpoint.
    ///
    /// On success the backoff schedule resets to base. On failure the
    /// caller advances it via [`Self::next_reconnect_delay`].
    pub async fn connect(&self) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            return Err(ClientError::AlreadyConnected);
        }
        self.state_tx.send_replace(ConnectionState::Connecting);

        debug!(url = %self.url, "connecting to relay");

        let ws_stream = match timeout(
            self.config.connect_timeout,
            connect_async(self.url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ClientError::Transport(e.to_string()));
            }
            Err(_) => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        *self.ws.lock().await = Some(ws_stream);
        self.state_tx.send_replace(ConnectionState::Connected);
        self.backoff.lock().await.reset();

        info!(url = %self.url, "connected to relay");

        self.start_recv_loop().await;
        Ok(())
    }

    /// Start the background receive loop decoding inbound frames.
    async fn start_recv_loop(&self) {
        let ws = Arc::clone(&self.ws);
        let state_tx = self.state_tx.clone();
        let messages_tx = self.messages_tx.clone();
        let pending_acks = Arc::clone(&self.pending_acks);
        let url = self.url.to_string();

        let handle = tokio::spawn(async move {
            loop {
                if *state_tx.borrow() != ConnectionState::Connected {
                    break;
                }

                // Short read timeout so state changes are noticed.
                let text = {
                    let mut ws_guard = ws.lock().await;
                    let Some(stream) = ws_guard.as_mut() else {
                        break;
                    };
                    match timeout(Duration::from_millis(100), stream.next()).await {
                        Ok(Some(Ok(Message::Text(text)))) => Some(text),
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            let _ = stream.send(Message::Pong(data)).await;
                            None
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!(url = %url, "relay closed connection");
                            break;
                        }
                        Ok(Some(Err(e))) => {
                            warn!(url = %url, error = %e, "websocket error");
                            break;
                        }
                        Ok(Some(Ok(_))) => None, // ignore binary/pong frames
                        Ok(None) => break,       // stream ended
                        Err(_) => None,          // read timeout, loop again
                    }
                };

                let Some(text) = text else { continue };

                // Decode once; malformed frames are dropped without
                // touching connection state.
                let message = match RelayMessage::from_json(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(url = %url, error = %e, "dropping malformed frame");
                        continue;
                    }
                };

                if let RelayMessage::Ok {
                    event_id,
                    accepted,
                    message: reason,
                } = &message
                {
                    let mut acks = pending_acks.lock().await;
                    if let Some(tx) = acks.remove(event_id) {
                        let _ = tx.send(OkReceipt {
                            event_id: event_id.clone(),
                            accepted: *accepted,
                            message: reason.clone(),
                        });
                    }
                }

                let _ = messages_tx.send(message);
            }

            // Receive loop ended: the connection is gone.
            state_tx.send_replace(ConnectionState::Disconnected);
            ws.lock().await.take();
            pending_acks.lock().await.clear();
        });

        *self.recv_task.lock().await = Some(handle);
    }

    /// Disconnect from the endpoint.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);

        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }

        if let Some(mut stream) = self.ws.lock().await.take() {
            let _ = stream.close(None).await;
        }
        self.pending_acks.lock().await.clear();

        info!(url = %self.url, "disconnected from relay");
    }

    /// Resolves once the connection reaches `Disconnected`.
    pub async fn wait_for_disconnect(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Send a message to this endpoint.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let text = message.to_json()?;
        debug!(url = %self.url, frame = %text, "sending frame");

        let mut ws = self.ws.lock().await;
        let Some(stream) = ws.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Send a message and wait for the relay's OK acknowledgment of
    /// `event_id`.
    pub async fn send_with_ack(
        &self,
        event_id: &str,
        message: &ClientMessage,
        ack_timeout: Duration,
    ) -> Result<OkReceipt> {
        let (tx, rx) = oneshot::channel();
        {
            let mut acks = self.pending_acks.lock().await;
            acks.insert(event_id.to_string(), tx);
        }

        if let Err(e) = self.send(message).await {
            self.pending_acks.lock().await.remove(event_id);
            return Err(e);
        }

        match timeout(ack_timeout, rx).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(_)) => Err(ClientError::Transport(
                "connection lost before acknowledgment".to_string(),
            )),
            Err(_) => {
                self.pending_acks.lock().await.remove(event_id);
                Err(ClientError::Timeout(format!(
                    "no acknowledgment after {ack_timeout:?}"
                )))
            }
        }
    }

    /// Delay to wait before the next reconnect attempt, advancing the
    /// backoff schedule.
    pub async fn next_reconnect_delay(&self) -> Duration {
        self.backoff.lock().await.next_delay()
    }

    /// Consecutive connection failures recorded so far.
    pub async fn retry_count(&self) -> u32 {
        self.backoff.lock().await.attempt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EndpointConfig {
        EndpointConfig::default()
    }

    #[test]
    fn test_connection_creation() {
        let conn = RelayConnection::new("wss://relay.example.com", test_config()).unwrap();
        assert_eq!(conn.url().scheme(), "wss");
        assert_eq!(conn.url().host_str(), Some("relay.example.com"));
    }

    #[test]
    fn test_invalid_url_scheme() {
        let result = RelayConnection::new("https://relay.example.com", test_config());
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let conn = RelayConnection::new("wss://relay.example.com", test_config()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert_eq!(conn.retry_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let conn = RelayConnection::new("wss://relay.example.com", test_config()).unwrap();
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };
        assert!(matches!(
            conn.send(&msg).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_delay_schedule() {
        let config = EndpointConfig {
            reconnect_base: Duration::from_secs(2),
            reconnect_cap: Duration::from_secs(1800),
            max_reconnect_attempts: 8,
            ..EndpointConfig::default()
        };
        let conn = RelayConnection::new("wss://relay.example.com", config).unwrap();

        assert_eq!(conn.next_reconnect_delay().await, Duration::from_secs(2));
        assert_eq!(conn.next_reconnect_delay().await, Duration::from_secs(4));
        assert_eq!(conn.next_reconnect_delay().await, Duration::from_secs(8));
        assert_eq!(conn.retry_count().await, 3);
    }

    #[tokio::test]
    async fn test_pending_ack_tracking() {
        let conn = RelayConnection::new("wss://relay.example.com", test_config()).unwrap();
        let (tx, _rx) = oneshot::channel();

        {
            let mut acks = conn.pending_acks.lock().await;
            acks.insert("event123".to_string(), tx);
            assert!(acks.contains_key("event123"));
        }

        {
            let mut acks = conn.pending_acks.lock().await;
            acks.remove("event123");
            assert!(acks.is_empty());
        }
    }

    #[tokio::test]
    async fn test_wait_for_disconnect_resolves_immediately_when_down() {
        let conn = RelayConnection::new("wss://relay.example.com", test_config()).unwrap();
        // Already disconnected, must not hang.
        conn.wait_for_disconnect().await;
    }
}
