//! Pool of relay endpoint connections.
//!
//! Owns one [`RelayConnection`] per configured endpoint plus a
//! supervisor task that keeps it alive with exponential backoff.
//! Status changes, decoded inbound frames, and the aggregate offline
//! transition are all published on a single broadcast stream of
//! [`PoolEvent`]s.

use crate::config::CoreConfig;
use crate::connection::{EndpointConfig, RelayConnection};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

/// Events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// An endpoint started connecting
    Connecting { url: String },
    /// An endpoint connected
    Connected { url: String },
    /// An endpoint disconnected
    Disconnected { url: String },
    /// Zero endpoints are connected; emitted once per transition
    Offline,
    /// A decoded frame arrived from an endpoint
    Message { url: String, message: RelayMessage },
}

struct EndpointTasks {
    supervisor: tokio::task::JoinHandle<()>,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Connected-endpoint bookkeeping behind the aggregate offline signal.
///
/// `Offline` fires exactly once per stay at zero connected endpoints,
/// including pools that never manage to connect at all; a successful
/// connection re-arms it.
#[derive(Default)]
struct Presence {
    connected: usize,
    offline_announced: bool,
}

impl Presence {
    fn on_connected(&mut self) {
        self.connected += 1;
        self.offline_announced = false;
    }

    /// Returns true when the offline signal should fire.
    fn on_disconnected(&mut self) -> bool {
        self.connected = self.connected.saturating_sub(1);
        self.take_offline_edge()
    }

    /// Returns true when the offline signal should fire.
    fn on_connect_failed(&mut self) -> bool {
        self.take_offline_edge()
    }

    fn take_offline_edge(&mut self) -> bool {
        if self.connected == 0 && !self.offline_announced {
            self.offline_announced = true;
            true
        } else {
            false
        }
    }
}

/// A pool of relay connections.
pub struct RelayPool {
    endpoint_config: EndpointConfig,
    default_urls: Vec<String>,
    connections: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    tasks: Mutex<HashMap<String, EndpointTasks>>,
    presence: Arc<Mutex<Presence>>,
    events_tx: broadcast::Sender<PoolEvent>,
}

impl RelayPool {
    /// Create a pool for the configured endpoints (does not connect).
    pub fn new(config: &CoreConfig) -> Self {
        let (events_tx, _) = broadcast::channel(2048);
        Self {
            endpoint_config: EndpointConfig::from_core(config),
            default_urls: config.relay_urls.clone(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            presence: Arc::new(Mutex::new(Presence::default())),
            events_tx,
        }
    }

    /// Subscribe to pool events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// All endpoint URLs currently in the pool, in stable order.
    pub async fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.connections.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Connection for one endpoint.
    pub async fn connection(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.connections.read().await.get(url).cloned()
    }

    /// Number of connected endpoints.
    pub async fn connected_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Whether no endpoint is connected.
    pub async fn is_offline(&self) -> bool {
        self.connected_count().await == 0
    }

    /// Add an endpoint and start supervising its connection.
    ///
    /// No-op if the endpoint is already present.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        {
            let conns = self.connections.read().await;
            if conns.contains_key(url) {
                return Ok(());
            }
        }

        info!(url = %url, "adding relay to pool");
        let conn = Arc::new(RelayConnection::new(url, self.endpoint_config.clone())?);

        self.connections
            .write()
            .await
            .insert(url.to_string(), Arc::clone(&conn));

        let forwarder = self.spawn_forwarder(&conn, url.to_string());
        let supervisor = self.spawn_supervisor(&conn, url.to_string());
        self.tasks.lock().await.insert(
            url.to_string(),
            EndpointTasks {
                supervisor,
                forwarder,
            },
        );

        Ok(())
    }

    /// Remove an endpoint, cancelling any pending reconnect.
    pub async fn remove_relay(&self, url: &str) {
        info!(url = %url, "removing relay from pool");

        if let Some(tasks) = self.tasks.lock().await.remove(url) {
            tasks.supervisor.abort();
            tasks.forwarder.abort();
        }

        let conn = self.connections.write().await.remove(url);
        if let Some(conn) = conn {
            // The supervisor is gone, so account for the endpoint here.
            let was_connected = conn.is_connected();
            conn.disconnect().await;
            if was_connected && self.presence.lock().await.on_disconnected() {
                let _ = self.events_tx.send(PoolEvent::Offline);
            }
        }
    }

    /// Add and supervise every configured endpoint.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let urls = self.default_urls.clone();
        let mut results = Vec::new();
        for url in urls {
            let result = self.add_relay(&url).await;
            results.push((url, result));
        }
        results
    }

    /// Disconnect every endpoint and stop supervision.
    pub async fn disconnect_all(&self) {
        let urls = self.urls().await;
        for url in urls {
            self.remove_relay(&url).await;
        }
    }

    /// Send a message to one endpoint.
    pub async fn send_to(&self, url: &str, message: &ClientMessage) -> Result<()> {
        let conn = self
            .connection(url)
            .await
            .ok_or_else(|| ClientError::Internal(format!("unknown endpoint: {url}")))?;
        conn.send(message).await
    }

    /// Send a message to every endpoint.
    ///
    /// Returns a per-endpoint result map; partial failure is reported,
    /// never raised.
    pub async fn broadcast(&self, message: &ClientMessage) -> HashMap<String, Result<()>> {
        let conns: Vec<(String, Arc<RelayConnection>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(url, conn)| (url.clone(), Arc::clone(conn)))
            .collect();

        let mut results = HashMap::new();
        for (url, conn) in conns {
            let result = if conn.is_connected() {
                conn.send(message).await
            } else {
                Err(ClientError::NotConnected)
            };
            results.insert(url, result);
        }
        results
    }

    /// Forward decoded frames from one endpoint into the pool stream.
    fn spawn_forwarder(
        &self,
        conn: &Arc<RelayConnection>,
        url: String,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = conn.subscribe_messages();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let _ = events_tx.send(PoolEvent::Message {
                            url: url.clone(),
                            message,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(url = %url, skipped, "inbound frame stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Keep one endpoint connected, reconnecting with backoff.
    fn spawn_supervisor(
        &self,
        conn: &Arc<RelayConnection>,
        url: String,
    ) -> tokio::task::JoinHandle<()> {
        let conn = Arc::clone(conn);
        let presence = Arc::clone(&self.presence);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            loop {
                let _ = events_tx.send(PoolEvent::Connecting { url: url.clone() });

                match conn.connect().await {
                    Ok(()) => {
                        presence.lock().await.on_connected();
                        let _ = events_tx.send(PoolEvent::Connected { url: url.clone() });

                        conn.wait_for_disconnect().await;
                        let _ = events_tx.send(PoolEvent::Disconnected { url: url.clone() });

                        if presence.lock().await.on_disconnected() {
                            let _ = events_tx.send(PoolEvent::Offline);
                        }
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "connection attempt failed");
                        if presence.lock().await.on_connect_failed() {
                            let _ = events_tx.send(PoolEvent::Offline);
                        }
                    }
                }

                let delay = conn.next_reconnect_delay().await;
                let attempt = conn.retry_count().await;
                debug!(url = %url, ?delay, attempt, "scheduling reconnect");
                tokio::time::sleep(delay).await;
            }
        })
    }
}
