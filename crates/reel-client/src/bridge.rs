//! Admission filtering between the relay stream and the cache.
//!
//! Every deduplicated event passes through one ordered chain of
//! checks; the first failing check rejects the event and is counted.
//! Accepted events become [`AdmittedItem`]s in the cache. A periodic
//! health task watches for a stalled ingest and for resident-resource
//! memory pressure, emitting [`BridgeSignal`]s for the engine.

use crate::cache::{AdmittedItem, PlayerCache};
use crate::config::CoreConfig;
use reel_core::{Event, MEDIA_EXTENSIONS, unix_now};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Author filtering supplied by the embedding application.
pub trait Blocklist: Send + Sync {
    fn is_blocked(&self, pubkey: &str) -> bool;
}

/// Why an event was refused admission. Checks run in this order and
/// short-circuit on the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No primary resource locator
    MissingLocator,
    /// Nothing to display (no title, empty content)
    EmptyPayload,
    /// The cache already tracks this id
    AlreadyTracked,
    /// Author is blocklisted
    BlockedAuthor,
    /// Event is older than the staleness window
    Stale,
    /// Locator failed the plausibility heuristic
    InvalidLocator,
}

/// Health observations emitted by the periodic check.
#[derive(Debug, Clone)]
pub enum BridgeSignal {
    /// No event has been admitted for at least `idle`
    IngestStalled { idle: Duration },
    /// Resident resources exceed the configured high-water mark
    MemoryPressure {
        estimate_bytes: u64,
        high_water_bytes: u64,
    },
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    missing_locator: AtomicU64,
    empty_payload: AtomicU64,
    already_tracked: AtomicU64,
    blocked_author: AtomicU64,
    stale: AtomicU64,
    invalid_locator: AtomicU64,
}

/// Admission counter snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStats {
    pub accepted: u64,
    pub missing_locator: u64,
    pub empty_payload: u64,
    pub already_tracked: u64,
    pub blocked_author: u64,
    pub stale: u64,
    pub invalid_locator: u64,
}

impl BridgeStats {
    pub fn rejected(&self) -> u64 {
        self.missing_locator
            + self.empty_payload
            + self.already_tracked
            + self.blocked_author
            + self.stale
            + self.invalid_locator
    }
}

/// Filters relay events into cache admissions.
pub struct FeedBridge {
    cache: Arc<PlayerCache>,
    blocklist: Option<Arc<dyn Blocklist>>,
    stale_after: Duration,
    allowed_media_hosts: Vec<String>,
    health_interval: Duration,
    stalled_after: Duration,
    memory_high_water_bytes: u64,
    counters: Counters,
    last_admitted: Mutex<Instant>,
    signals_tx: broadcast::Sender<BridgeSignal>,
}

impl FeedBridge {
    pub fn new(
        cache: Arc<PlayerCache>,
        blocklist: Option<Arc<dyn Blocklist>>,
        config: &CoreConfig,
    ) -> Self {
        let (signals_tx, _) = broadcast::channel(16);
        Self {
            cache,
            blocklist,
            stale_after: config.stale_after,
            allowed_media_hosts: config.allowed_media_hosts.clone(),
            health_interval: config.health_interval,
            stalled_after: config.stalled_after,
            memory_high_water_bytes: config.memory_high_water_bytes,
            counters: Counters::default(),
            last_admitted: Mutex::new(Instant::now()),
            signals_tx,
        }
    }

    /// Subscribe to health signals.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<BridgeSignal> {
        self.signals_tx.subscribe()
    }

    /// Run an event through the admission chain.
    ///
    /// Returns `None` when the event was admitted to the cache, or the
    /// first failing check otherwise.
    pub async fn handle_event(&self, event: &Event, origin: &str) -> Option<RejectReason> {
        if let Some(reason) = self.evaluate(event).await {
            self.count_reject(reason);
            debug!(event_id = %event.id, ?reason, "rejected event");
            return Some(reason);
        }

        // evaluate() checked the locator; it cannot be absent here.
        let Some(media_url) = event.media_url() else {
            self.count_reject(RejectReason::MissingLocator);
            return Some(RejectReason::MissingLocator);
        };

        let item = AdmittedItem {
            id: event.id.clone(),
            media_url: media_url.to_string(),
            title: event.title().map(|t| t.to_string()),
            body: if event.content.trim().is_empty() {
                None
            } else {
                Some(event.content.clone())
            },
            origin: origin.to_string(),
            created_at: event.created_at,
        };

        if !self.cache.admit(item).await {
            // Admitted concurrently since the tracked check.
            self.count_reject(RejectReason::AlreadyTracked);
            return Some(RejectReason::AlreadyTracked);
        }

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        *self.last_admitted.lock().await = Instant::now();
        debug!(event_id = %event.id, origin = %origin, "admitted event");
        None
    }

    async fn evaluate(&self, event: &Event) -> Option<RejectReason> {
        let Some(media_url) = event.media_url() else {
            return Some(RejectReason::MissingLocator);
        };

        if event.title().is_none() && event.content.trim().is_empty() {
            return Some(RejectReason::EmptyPayload);
        }

        if self.cache.contains(&event.id).await {
            return Some(RejectReason::AlreadyTracked);
        }

        if let Some(blocklist) = &self.blocklist
            && blocklist.is_blocked(&event.pubkey)
        {
            return Some(RejectReason::BlockedAuthor);
        }

        if event.age_secs(unix_now()) > self.stale_after.as_secs() {
            return Some(RejectReason::Stale);
        }

        if !locator_is_plausible(media_url, &self.allowed_media_hosts) {
            return Some(RejectReason::InvalidLocator);
        }

        None
    }

    /// Admission counter snapshot.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            missing_locator: self.counters.missing_locator.load(Ordering::Relaxed),
            empty_payload: self.counters.empty_payload.load(Ordering::Relaxed),
            already_tracked: self.counters.already_tracked.load(Ordering::Relaxed),
            blocked_author: self.counters.blocked_author.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            invalid_locator: self.counters.invalid_locator.load(Ordering::Relaxed),
        }
    }

    /// Run one health check: stalled ingest and memory pressure.
    pub async fn health_check(&self) {
        let idle = {
            let mut last = self.last_admitted.lock().await;
            let idle = last.elapsed();
            if idle >= self.stalled_after {
                // Restart the clock so the signal fires once per stall.
                *last = Instant::now();
                Some(idle)
            } else {
                None
            }
        };
        if let Some(idle) = idle {
            warn!(?idle, "ingest stalled, signalling restart");
            let _ = self.signals_tx.send(BridgeSignal::IngestStalled { idle });
        }

        let estimate = self.cache.memory_estimate_bytes().await;
        if estimate > self.memory_high_water_bytes {
            warn!(
                estimate_bytes = estimate,
                high_water_bytes = self.memory_high_water_bytes,
                "resident resources above high-water mark"
            );
            let _ = self.signals_tx.send(BridgeSignal::MemoryPressure {
                estimate_bytes: estimate,
                high_water_bytes: self.memory_high_water_bytes,
            });
        }

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            rejected = stats.rejected(),
            "bridge health"
        );
    }

    /// Spawn the periodic health task.
    pub fn start_health_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        let mut interval = tokio::time::interval(self.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            // First tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                bridge.health_check().await;
            }
        })
    }

    fn count_reject(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::MissingLocator => &self.counters.missing_locator,
            RejectReason::EmptyPayload => &self.counters.empty_payload,
            RejectReason::AlreadyTracked => &self.counters.already_tracked,
            RejectReason::BlockedAuthor => &self.counters.blocked_author,
            RejectReason::Stale => &self.counters.stale,
            RejectReason::InvalidLocator => &self.counters.invalid_locator,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Whether a locator looks like playable media.
///
/// Accepts http(s) URLs whose path carries a recognized media
/// extension, plus anything on an explicitly allowed host (or a
/// subdomain of one).
fn locator_is_plausible(locator: &str, allowed_hosts: &[String]) -> bool {
    let Ok(url) = Url::parse(locator) else {
        return false;
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }

    let path = url.path().to_ascii_lowercase();
    if MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return true;
    }

    let Some(host) = url.host_str() else {
        return false;
    };
    allowed_hosts
        .iter()
        .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceLoader;
    use crate::cache::{ItemState, PlayerResource};
    use crate::error::Result;
    use async_trait::async_trait;

    struct NoopLoader;

    #[async_trait]
    impl ResourceLoader for NoopLoader {
        async fn load(&self, item: &AdmittedItem) -> Result<PlayerResource> {
            Ok(PlayerResource {
                item_id: item.id.clone(),
                media_url: item.media_url.clone(),
                size_bytes: 0,
            })
        }
    }

    struct BlockEve;

    impl Blocklist for BlockEve {
        fn is_blocked(&self, pubkey: &str) -> bool {
            pubkey == "eve"
        }
    }

    fn bridge(config: &CoreConfig) -> FeedBridge {
        let cache = Arc::new(PlayerCache::new(Arc::new(NoopLoader), config));
        FeedBridge::new(cache, Some(Arc::new(BlockEve)), config)
    }

    fn media_event(id: &str, pubkey: &str, url: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at: unix_now(),
            kind: 34236,
            tags: vec![vec!["url".to_string(), url.to_string()]],
            content: "a clip".to_string(),
            sig: "sig".to_string(),
        }
    }

    const ORIGIN: &str = "wss://relay.example.com/";

    #[tokio::test]
    async fn test_valid_event_is_admitted() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let event = media_event("e1", "alice", "https://cdn.example.com/a.mp4");

        assert_eq!(bridge.handle_event(&event, ORIGIN).await, None);
        assert_eq!(bridge.cache.state_of("e1").await, Some(ItemState::NotLoaded));
        assert_eq!(bridge.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_missing_locator_is_first_check() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let mut event = media_event("e1", "eve", "https://x/a.mp4");
        event.tags.clear();
        // Blocked author too, but the locator check fires first.
        assert_eq!(
            bridge.handle_event(&event, ORIGIN).await,
            Some(RejectReason::MissingLocator)
        );
        assert_eq!(bridge.stats().missing_locator, 1);
    }

    #[tokio::test]
    async fn test_empty_payload_is_rejected() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let mut event = media_event("e1", "alice", "https://cdn.example.com/a.mp4");
        event.content = "   ".to_string();

        assert_eq!(
            bridge.handle_event(&event, ORIGIN).await,
            Some(RejectReason::EmptyPayload)
        );
    }

    #[tokio::test]
    async fn test_title_satisfies_payload_check() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let mut event = media_event("e1", "alice", "https://cdn.example.com/a.mp4");
        event.content = String::new();
        event
            .tags
            .push(vec!["title".to_string(), "clip".to_string()]);

        assert_eq!(bridge.handle_event(&event, ORIGIN).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let event = media_event("e1", "alice", "https://cdn.example.com/a.mp4");

        assert_eq!(bridge.handle_event(&event, ORIGIN).await, None);
        assert_eq!(
            bridge.handle_event(&event, ORIGIN).await,
            Some(RejectReason::AlreadyTracked)
        );
    }

    #[tokio::test]
    async fn test_blocked_author_is_rejected() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let event = media_event("e1", "eve", "https://cdn.example.com/a.mp4");

        assert_eq!(
            bridge.handle_event(&event, ORIGIN).await,
            Some(RejectReason::BlockedAuthor)
        );
    }

    #[tokio::test]
    async fn test_stale_event_is_rejected() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let mut event = media_event("e1", "alice", "https://cdn.example.com/a.mp4");
        event.created_at = unix_now() - 31 * 24 * 60 * 60;

        assert_eq!(
            bridge.handle_event(&event, ORIGIN).await,
            Some(RejectReason::Stale)
        );
    }

    #[tokio::test]
    async fn test_future_dated_event_is_not_stale() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let mut event = media_event("e1", "alice", "https://cdn.example.com/a.mp4");
        event.created_at = unix_now() + 3600;

        assert_eq!(bridge.handle_event(&event, ORIGIN).await, None);
    }

    #[tokio::test]
    async fn test_implausible_locator_is_rejected() {
        let config = CoreConfig::default();
        let bridge = bridge(&config);
        let event = media_event("e1", "alice", "https://cdn.example.com/page.html");

        assert_eq!(
            bridge.handle_event(&event, ORIGIN).await,
            Some(RejectReason::InvalidLocator)
        );
        assert_eq!(bridge.stats().rejected(), 1);
    }

    #[tokio::test]
    async fn test_allowed_host_bypasses_extension_check() {
        let config = CoreConfig {
            allowed_media_hosts: vec!["stream.example.com".to_string()],
            ..CoreConfig::default()
        };
        let bridge = bridge(&config);
        let event = media_event("e1", "alice", "https://v.stream.example.com/watch/123");

        assert_eq!(bridge.handle_event(&event, ORIGIN).await, None);
    }

    #[test]
    fn test_locator_heuristic() {
        assert!(locator_is_plausible("https://x.example/a.mp4", &[]));
        assert!(locator_is_plausible("https://x.example/a/b/playlist.m3u8", &[]));
        assert!(locator_is_plausible("http://x.example/A.MP4", &[]));
        assert!(!locator_is_plausible("https://x.example/a.jpg", &[]));
        assert!(!locator_is_plausible("ftp://x.example/a.mp4", &[]));
        assert!(!locator_is_plausible("not a url", &[]));
        assert!(!locator_is_plausible("file:///tmp/a.mp4", &[]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_ingest_signal() {
        let config = CoreConfig {
            stalled_after: Duration::from_secs(600),
            ..CoreConfig::default()
        };
        let bridge = bridge(&config);
        let mut signals = bridge.subscribe_signals();

        tokio::time::advance(Duration::from_secs(601)).await;
        bridge.health_check().await;

        match signals.recv().await.unwrap() {
            BridgeSignal::IngestStalled { idle } => {
                assert!(idle >= Duration::from_secs(600));
            }
            other => panic!("expected stall signal, got {other:?}"),
        }

        // The clock restarted; an immediate second check stays quiet.
        bridge.health_check().await;
        assert!(signals.try_recv().is_err());
    }
}
