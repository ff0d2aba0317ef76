//! The feed engine: one facade over pool, subscriptions, admission,
//! and the playback cache.
//!
//! The engine owns the ingest loop: every [`PoolEvent`] flows through
//! [`FeedEngine::process`], which gates events through deduplication,
//! routes subscription traffic, and feeds the admission bridge. The
//! embedding application talks only to this type.

use crate::auth::AuthHandler;
use crate::bridge::{Blocklist, BridgeSignal, BridgeStats, FeedBridge};
use crate::cache::{
    AdmittedItem, CacheChange, CacheSnapshot, ItemState, PlayerCache, PlayerResource,
    ResourceLoader,
};
use crate::config::CoreConfig;
use crate::connection::OkReceipt;
use crate::dedup::SeenIds;
use crate::error::Result;
use crate::message::{ClientMessage, RelayMessage};
use crate::pool::{PoolEvent, RelayPool};
use crate::subscription::{SubscriptionHandle, SubscriptionMux, SubscriptionPriority};
use futures::future::join_all;
use reel_core::auth::Signer;
use reel_core::{Event, Filter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Live feed engine over a set of relay endpoints.
pub struct FeedEngine {
    pool: Arc<RelayPool>,
    mux: Arc<SubscriptionMux>,
    auth: Arc<AuthHandler>,
    bridge: Arc<FeedBridge>,
    cache: Arc<PlayerCache>,
    seen: Arc<Mutex<SeenIds>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl FeedEngine {
    /// Assemble an engine. Nothing connects until [`Self::start`].
    pub fn new(
        config: CoreConfig,
        signer: Option<Arc<dyn Signer>>,
        blocklist: Option<Arc<dyn Blocklist>>,
        loader: Arc<dyn ResourceLoader>,
    ) -> Self {
        let pool = Arc::new(RelayPool::new(&config));
        let mux = Arc::new(SubscriptionMux::new(Arc::clone(&pool), &config));
        let cache = Arc::new(PlayerCache::new(loader, &config));
        let bridge = Arc::new(FeedBridge::new(Arc::clone(&cache), blocklist, &config));
        let seen = Arc::new(Mutex::new(SeenIds::new(config.dedup_capacity)));

        Self {
            pool,
            mux,
            auth: Arc::new(AuthHandler::new(signer)),
            bridge,
            cache,
            seen,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect to the configured relays and start the background
    /// tasks: ingest, subscription sweeper, bridge health, and the
    /// stall-recovery listener.
    pub async fn start(self: &Arc<Self>) {
        for (url, result) in self.pool.connect_all().await {
            if let Err(e) = result {
                warn!(url = %url, error = %e, "skipping unusable relay url");
            }
        }

        let mut tasks = self.tasks.lock().await;

        let engine = Arc::clone(self);
        let mut events = self.pool.subscribe_events();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => engine.process(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ingest lagged behind pool events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        tasks.push(self.mux.start_sweeper());
        tasks.push(self.bridge.start_health_task());

        let mux = Arc::clone(&self.mux);
        let mut signals = self.bridge.subscribe_signals();
        tasks.push(tokio::spawn(async move {
            while let Ok(signal) = signals.recv().await {
                match signal {
                    BridgeSignal::IngestStalled { idle } => {
                        warn!(?idle, "restarting subscriptions after ingest stall");
                        mux.restart_all().await;
                    }
                    BridgeSignal::MemoryPressure {
                        estimate_bytes,
                        high_water_bytes,
                    } => {
                        warn!(
                            estimate_bytes,
                            high_water_bytes, "cache memory above high-water mark"
                        );
                    }
                }
            }
        }));

        info!("feed engine started");
    }

    /// Handle one pool event.
    ///
    /// This is the whole ingest path; the background loop spawned by
    /// [`Self::start`] does nothing but call it.
    pub async fn process(&self, event: PoolEvent) {
        match event {
            PoolEvent::Message { url, message } => self.process_message(url, message).await,
            PoolEvent::Connected { url } => {
                // The relay lost all state; replay our REQs.
                self.mux.resubscribe_endpoint(&url).await;
            }
            PoolEvent::Disconnected { url } => {
                self.auth.reset(&url).await;
            }
            PoolEvent::Connecting { url } => {
                debug!(url = %url, "endpoint connecting");
            }
            PoolEvent::Offline => {
                warn!("all relay endpoints offline");
            }
        }
    }

    async fn process_message(&self, url: String, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if !self.seen.lock().await.admit(&event.id) {
                    return;
                }
                self.mux.route_event(&subscription_id, event.clone()).await;
                self.bridge.handle_event(&event, &url).await;
            }
            RelayMessage::Eose { subscription_id } => {
                self.mux.route_eose(&subscription_id, &url).await;
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                self.mux.route_closed(&subscription_id, &message).await;
            }
            RelayMessage::Notice { message } => {
                info!(url = %url, notice = %message, "relay notice");
            }
            RelayMessage::Auth { challenge } => {
                let Some(conn) = self.pool.connection(&url).await else {
                    return;
                };
                let auth = Arc::clone(&self.auth);
                tokio::spawn(async move {
                    auth.handle_challenge(&conn, &challenge).await;
                });
            }
            RelayMessage::Ok { event_id, .. } => {
                // Acknowledgments resolve inside the connection.
                debug!(url = %url, event_id = %event_id, "publish acknowledgment");
            }
        }
    }

    /// Open a feed subscription.
    ///
    /// `timeout` overrides the configured sweep lifetime for this
    /// subscription.
    pub async fn open_feed(
        &self,
        filters: Vec<Filter>,
        priority: SubscriptionPriority,
        timeout: Option<Duration>,
    ) -> Result<SubscriptionHandle> {
        self.mux.open(filters, priority, timeout).await
    }

    /// Release a feed subscription.
    pub async fn close_feed(&self, subscription_id: &str) {
        self.mux.close(subscription_id).await;
    }

    /// Publish an event to every connected relay, waiting for each
    /// relay's acknowledgment.
    ///
    /// Endpoints are awaited concurrently, so the slowest relay (not
    /// the sum of all of them) bounds the call.
    pub async fn publish(&self, event: Event) -> HashMap<String, Result<OkReceipt>> {
        let message = ClientMessage::Event(event.clone());
        let mut sends = Vec::new();
        for url in self.pool.urls().await {
            let Some(conn) = self.pool.connection(&url).await else {
                continue;
            };
            if !conn.is_connected() {
                continue;
            }
            let message = message.clone();
            let event_id = event.id.clone();
            sends.push(async move {
                let result = conn
                    .send_with_ack(&event_id, &message, PUBLISH_ACK_TIMEOUT)
                    .await;
                (url, result)
            });
        }
        join_all(sends).await.into_iter().collect()
    }

    /// Move the viewing cursor.
    pub async fn preload_around(&self, cursor: usize) {
        self.cache.preload_around(cursor).await;
    }

    /// Playable items in feed order.
    pub async fn visible_items(&self) -> Vec<AdmittedItem> {
        self.cache.visible_items().await
    }

    /// Lifecycle state of one cached item.
    pub async fn state_of(&self, item_id: &str) -> Option<ItemState> {
        self.cache.state_of(item_id).await
    }

    /// Resident resource for a ready item.
    pub async fn get_resource(&self, item_id: &str) -> Option<Arc<PlayerResource>> {
        self.cache.get_resource(item_id).await
    }

    /// Cache state change stream.
    pub fn subscribe_cache_changes(&self) -> broadcast::Receiver<CacheChange> {
        self.cache.subscribe_changes()
    }

    /// Admission counters.
    pub fn stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    /// Cache diagnostics.
    pub async fn snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot().await
    }

    /// Stop background tasks and disconnect from every relay.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.pool.disconnect_all().await;
        info!("feed engine stopped");
    }
}
