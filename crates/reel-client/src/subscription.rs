//! Subscription multiplexing across relay endpoints.
//!
//! Callers open subscriptions by filter set; the mux deduplicates
//! identical filter sets behind one wire subscription, reference
//! counts the openers, and fans inbound events back out per
//! subscription. A sweeper force-closes subscriptions that outlive
//! their window so relays never accumulate abandoned REQs.

use crate::config::CoreConfig;
use crate::error::{ClientError, Result};
use crate::message::ClientMessage;
use crate::pool::RelayPool;
use reel_core::{Event, Filter, FilterSignature};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Spacing between consecutive REQ sends for one subscription, so a
/// burst of opens does not hit every endpoint in the same instant.
const STAGGER_STEP: Duration = Duration::from_millis(50);
const STAGGER_MAX: Duration = Duration::from_millis(500);

/// Relative importance when the sweeper has to pick victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubscriptionPriority {
    Low,
    Normal,
    High,
}

/// Updates delivered to subscription holders.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    /// An event matched the subscription's filters
    Event(Event),
    /// Every connected endpoint finished replaying stored events
    Eose,
    /// The subscription was closed (by a relay or the sweeper)
    Closed { reason: String },
}

/// A caller's handle on one subscription.
pub struct SubscriptionHandle {
    pub id: String,
    pub updates: broadcast::Receiver<SubscriptionUpdate>,
}

struct SubEntry {
    id: String,
    filters: Vec<Filter>,
    priority: SubscriptionPriority,
    /// Lifetime after which the sweep force-closes this subscription
    timeout: Duration,
    ref_count: usize,
    updates_tx: broadcast::Sender<SubscriptionUpdate>,
    /// Endpoints that have reported end-of-stored-events
    eose_relays: HashSet<String>,
    eose_sent: bool,
    opened_at: Instant,
}

#[derive(Default)]
struct Tables {
    by_signature: HashMap<FilterSignature, SubEntry>,
    by_id: HashMap<String, FilterSignature>,
}

/// Deduplicating, reference-counted subscription table.
pub struct SubscriptionMux {
    pool: Arc<RelayPool>,
    max_subscriptions: usize,
    subscription_timeout: Duration,
    sweep_interval: Duration,
    tables: RwLock<Tables>,
}

impl SubscriptionMux {
    pub fn new(pool: Arc<RelayPool>, config: &CoreConfig) -> Self {
        Self {
            pool,
            max_subscriptions: config.max_subscriptions,
            subscription_timeout: config.subscription_timeout,
            sweep_interval: config.sweep_interval,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of live wire subscriptions (distinct filter sets).
    pub async fn active_count(&self) -> usize {
        self.tables.read().await.by_signature.len()
    }

    /// Open a subscription for `filters`.
    ///
    /// An identical filter set (order and duplicates ignored) joins
    /// the existing wire subscription instead of creating a second
    /// one. Each open must be paired with a [`Self::close`].
    ///
    /// `timeout` overrides the configured sweep lifetime for this
    /// subscription; joiners inherit the original opener's value.
    pub async fn open(
        &self,
        filters: Vec<Filter>,
        priority: SubscriptionPriority,
        timeout: Option<Duration>,
    ) -> Result<SubscriptionHandle> {
        if filters.is_empty() {
            return Err(ClientError::Internal(
                "subscription requires at least one filter".to_string(),
            ));
        }

        let filters: Vec<Filter> = filters.into_iter().map(|f| f.normalized()).collect();
        let signature = FilterSignature::of(&filters);

        let mut tables = self.tables.write().await;

        if let Some(entry) = tables.by_signature.get_mut(&signature) {
            entry.ref_count += 1;
            debug!(
                subscription_id = %entry.id,
                ref_count = entry.ref_count,
                "joined existing subscription"
            );
            return Ok(SubscriptionHandle {
                id: entry.id.clone(),
                updates: entry.updates_tx.subscribe(),
            });
        }

        let active = tables.by_signature.len();
        if active >= self.max_subscriptions {
            return Err(ClientError::SubscriptionCapacity {
                active,
                cap: self.max_subscriptions,
            });
        }

        let id = Uuid::new_v4().to_string()[..8].to_string();
        let (updates_tx, updates_rx) = broadcast::channel(256);

        tables.by_signature.insert(
            signature.clone(),
            SubEntry {
                id: id.clone(),
                filters: filters.clone(),
                priority,
                timeout: timeout.unwrap_or(self.subscription_timeout),
                ref_count: 1,
                updates_tx,
                eose_relays: HashSet::new(),
                eose_sent: false,
                opened_at: Instant::now(),
            },
        );
        tables.by_id.insert(id.clone(), signature);
        drop(tables);

        info!(subscription_id = %id, signature = %FilterSignature::of(&filters), "opened subscription");
        self.send_req_staggered(&id, &filters).await;

        Ok(SubscriptionHandle {
            id,
            updates: updates_rx,
        })
    }

    /// Release one opener's hold on a subscription.
    ///
    /// The wire subscription is closed only when the last opener
    /// releases it. Closing an unknown id is a no-op.
    pub async fn close(&self, subscription_id: &str) {
        let mut tables = self.tables.write().await;

        let Some(signature) = tables.by_id.get(subscription_id).cloned() else {
            debug!(subscription_id = %subscription_id, "close for unknown subscription");
            return;
        };
        let Some(entry) = tables.by_signature.get_mut(&signature) else {
            return;
        };

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            debug!(
                subscription_id = %subscription_id,
                ref_count = entry.ref_count,
                "subscription still referenced"
            );
            return;
        }

        tables.by_signature.remove(&signature);
        tables.by_id.remove(subscription_id);
        drop(tables);

        info!(subscription_id = %subscription_id, "closing subscription");
        let msg = ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        };
        self.pool.broadcast(&msg).await;
    }

    /// Deliver an event to its subscription's holders.
    pub async fn route_event(&self, subscription_id: &str, event: Event) {
        let tables = self.tables.read().await;
        if let Some(signature) = tables.by_id.get(subscription_id)
            && let Some(entry) = tables.by_signature.get(signature)
        {
            let _ = entry.updates_tx.send(SubscriptionUpdate::Event(event));
        }
    }

    /// Record an endpoint's end-of-stored-events marker.
    ///
    /// Holders see a single aggregated `Eose` once every connected
    /// endpoint has reported.
    pub async fn route_eose(&self, subscription_id: &str, url: &str) {
        let connected = self.pool.connected_count().await;

        let mut tables = self.tables.write().await;
        let Some(signature) = tables.by_id.get(subscription_id).cloned() else {
            return;
        };
        let Some(entry) = tables.by_signature.get_mut(&signature) else {
            return;
        };

        entry.eose_relays.insert(url.to_string());
        if !entry.eose_sent && entry.eose_relays.len() >= connected.max(1) {
            entry.eose_sent = true;
            let _ = entry.updates_tx.send(SubscriptionUpdate::Eose);
        }
    }

    /// Forward a relay-side CLOSED to the subscription's holders.
    pub async fn route_closed(&self, subscription_id: &str, message: &str) {
        warn!(subscription_id = %subscription_id, reason = %message, "relay closed subscription");
        let tables = self.tables.read().await;
        if let Some(signature) = tables.by_id.get(subscription_id)
            && let Some(entry) = tables.by_signature.get(signature)
        {
            let _ = entry.updates_tx.send(SubscriptionUpdate::Closed {
                reason: message.to_string(),
            });
        }
    }

    /// Replay every live REQ to one endpoint, e.g. after it reconnects.
    pub async fn resubscribe_endpoint(&self, url: &str) {
        let reqs: Vec<(String, Vec<Filter>)> = {
            let mut tables = self.tables.write().await;
            for entry in tables.by_signature.values_mut() {
                // The endpoint will replay stored events again.
                entry.eose_relays.remove(url);
            }
            tables
                .by_signature
                .values()
                .map(|e| (e.id.clone(), e.filters.clone()))
                .collect()
        };

        debug!(url = %url, count = reqs.len(), "resubscribing endpoint");
        for (index, (id, filters)) in reqs.into_iter().enumerate() {
            let msg = ClientMessage::Req {
                subscription_id: id,
                filters,
            };
            tokio::time::sleep(stagger_delay(index)).await;
            if let Err(e) = self.pool.send_to(url, &msg).await {
                debug!(url = %url, error = %e, "resubscribe send failed");
            }
        }
    }

    /// Re-issue every live REQ on every endpoint.
    pub async fn restart_all(&self) {
        let reqs: Vec<(String, Vec<Filter>)> = {
            let mut tables = self.tables.write().await;
            for entry in tables.by_signature.values_mut() {
                entry.eose_relays.clear();
                entry.eose_sent = false;
            }
            tables
                .by_signature
                .values()
                .map(|e| (e.id.clone(), e.filters.clone()))
                .collect()
        };

        info!(count = reqs.len(), "restarting all subscriptions");
        for (index, (id, filters)) in reqs.into_iter().enumerate() {
            self.pool
                .broadcast(&ClientMessage::Close {
                    subscription_id: id.clone(),
                })
                .await;
            let msg = ClientMessage::Req {
                subscription_id: id,
                filters,
            };
            tokio::time::sleep(stagger_delay(index)).await;
            self.pool.broadcast(&msg).await;
        }
    }

    /// Force-close subscriptions that have outlived their timeout.
    ///
    /// Expiry ignores reference counts; holders are told via a
    /// `Closed { reason: "timeout" }` update. Lower priority
    /// subscriptions go first.
    pub async fn sweep(&self) {
        let expired: Vec<(FilterSignature, String)> = {
            let tables = self.tables.read().await;
            let mut expired: Vec<(&FilterSignature, &SubEntry)> = tables
                .by_signature
                .iter()
                .filter(|(_, e)| e.opened_at.elapsed() >= e.timeout)
                .collect();
            expired.sort_by_key(|(_, e)| (e.priority, e.opened_at));
            expired
                .into_iter()
                .map(|(sig, e)| (sig.clone(), e.id.clone()))
                .collect()
        };

        for (signature, id) in expired {
            let removed = {
                let mut tables = self.tables.write().await;
                let entry = tables.by_signature.remove(&signature);
                tables.by_id.remove(&id);
                entry
            };
            let Some(entry) = removed else { continue };

            info!(
                subscription_id = %id,
                ref_count = entry.ref_count,
                "sweeping expired subscription"
            );
            let _ = entry.updates_tx.send(SubscriptionUpdate::Closed {
                reason: "timeout".to_string(),
            });
            self.pool
                .broadcast(&ClientMessage::Close {
                    subscription_id: id,
                })
                .await;
        }
    }

    /// Spawn the periodic sweep task.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mux = Arc::clone(self);
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                mux.sweep().await;
            }
        })
    }

    /// Send the opening REQ to every endpoint with a small stagger.
    async fn send_req_staggered(&self, subscription_id: &str, filters: &[Filter]) {
        let msg = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.to_vec(),
        };
        let urls = self.pool.urls().await;
        for (index, url) in urls.into_iter().enumerate() {
            tokio::time::sleep(stagger_delay(index)).await;
            if let Err(e) = self.pool.send_to(&url, &msg).await {
                debug!(url = %url, error = %e, "REQ send failed, endpoint will resubscribe");
            }
        }
    }
}

fn stagger_delay(index: usize) -> Duration {
    STAGGER_STEP.saturating_mul(index as u32).min(STAGGER_MAX)
}
