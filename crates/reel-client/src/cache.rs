//! Playback resource lifecycle under a moving cursor.
//!
//! Admitted items are lightweight descriptions; the heavyweight
//! playback resource behind each one is acquired lazily as the viewing
//! cursor approaches and released again as it moves away. Each item
//! walks a small state machine:
//!
//! ```text
//! not-loaded -> loading -> ready
//!                       -> failed -> not-loaded (retry)
//!                                 -> permanently-failed
//! any state  -> disposed (terminal)
//! ```
//!
//! Disposal is terminal. An id that has been disposed never re-enters
//! the cache, which keeps eviction decisions final under concurrent
//! preloads.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Lifecycle state of one cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// Admitted, no resource acquisition attempted
    NotLoaded,
    /// Resource acquisition in flight
    Loading,
    /// Resource resident and playable
    Ready,
    /// Last acquisition failed; eligible for retry
    Failed,
    /// Retries exhausted; never attempted again
    PermanentlyFailed,
    /// Evicted; terminal
    Disposed,
}

/// An item accepted into the feed by the admission filter.
#[derive(Debug, Clone)]
pub struct AdmittedItem {
    /// Event id this item was admitted under
    pub id: String,
    /// Primary resource locator
    pub media_url: String,
    /// Display title, if any
    pub title: Option<String>,
    /// Descriptive text, if any
    pub body: Option<String>,
    /// Endpoint the winning copy arrived from
    pub origin: String,
    /// Event timestamp
    pub created_at: u64,
}

/// A heavyweight playback resource produced by a [`ResourceLoader`].
#[derive(Debug, Clone)]
pub struct PlayerResource {
    pub item_id: String,
    pub media_url: String,
    /// Approximate resident memory cost
    pub size_bytes: u64,
}

/// Acquires playback resources. Implemented by the embedding
/// application; the cache only owns scheduling and lifecycle.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, item: &AdmittedItem) -> Result<PlayerResource>;
}

/// State change notification for one item.
#[derive(Debug, Clone)]
pub struct CacheChange {
    pub item_id: String,
    pub state: ItemState,
}

struct ManagedItem {
    item: AdmittedItem,
    state: ItemState,
    retry_count: u32,
    resource: Option<Arc<PlayerResource>>,
    inflight: Option<tokio::task::JoinHandle<()>>,
    /// Bumped on dispose so a stale preload completion cannot
    /// resurrect the item.
    epoch: u64,
}

#[derive(Default)]
struct CacheInner {
    items: HashMap<String, ManagedItem>,
    /// Admission order; an item's index is its feed position.
    order: Vec<String>,
}

/// Aggregate view for diagnostics.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub tracked: usize,
    pub not_loaded: usize,
    pub loading: usize,
    pub ready: usize,
    pub failed: usize,
    pub permanently_failed: usize,
    pub disposed: usize,
    pub memory_estimate_bytes: u64,
}

/// Memory-bounded cache of playback resources.
pub struct PlayerCache {
    inner: Arc<RwLock<CacheInner>>,
    loader: Arc<dyn ResourceLoader>,
    preload_timeout: Duration,
    max_retries: u32,
    preload_ahead: usize,
    keep_behind: usize,
    memory_keep_range: usize,
    preload_permits: Arc<Semaphore>,
    changes_tx: broadcast::Sender<CacheChange>,
}

impl PlayerCache {
    pub fn new(loader: Arc<dyn ResourceLoader>, config: &crate::config::CoreConfig) -> Self {
        let (changes_tx, _) = broadcast::channel(512);
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            loader,
            preload_timeout: config.preload_timeout,
            max_retries: config.max_retries,
            preload_ahead: config.preload_ahead,
            keep_behind: config.keep_behind,
            memory_keep_range: config.memory_keep_range,
            preload_permits: Arc::new(Semaphore::new(config.preload_concurrency.max(1))),
            changes_tx,
        }
    }

    /// Subscribe to item state changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheChange> {
        self.changes_tx.subscribe()
    }

    /// Track a newly admitted item.
    ///
    /// Returns false without touching anything if the id is already
    /// tracked, disposed ids included.
    pub async fn admit(&self, item: AdmittedItem) -> bool {
        let mut inner = self.inner.write().await;
        if inner.items.contains_key(&item.id) {
            return false;
        }

        let id = item.id.clone();
        inner.order.push(id.clone());
        inner.items.insert(
            id.clone(),
            ManagedItem {
                item,
                state: ItemState::NotLoaded,
                retry_count: 0,
                resource: None,
                inflight: None,
                epoch: 0,
            },
        );
        drop(inner);

        self.notify(&id, ItemState::NotLoaded);
        true
    }

    /// Whether an id is tracked (in any state).
    pub async fn contains(&self, item_id: &str) -> bool {
        self.inner.read().await.items.contains_key(item_id)
    }

    /// Lifecycle state of one item.
    pub async fn state_of(&self, item_id: &str) -> Option<ItemState> {
        self.inner.read().await.items.get(item_id).map(|m| m.state)
    }

    /// The resident resource for a ready item.
    pub async fn get_resource(&self, item_id: &str) -> Option<Arc<PlayerResource>> {
        let inner = self.inner.read().await;
        let managed = inner.items.get(item_id)?;
        if managed.state != ItemState::Ready {
            return None;
        }
        managed.resource.clone()
    }

    /// Items currently playable, in feed order.
    pub async fn visible_items(&self) -> Vec<AdmittedItem> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id))
            .filter(|m| m.state == ItemState::Ready)
            .map(|m| m.item.clone())
            .collect()
    }

    /// Sum of resident resource size estimates.
    pub async fn memory_estimate_bytes(&self) -> u64 {
        let inner = self.inner.read().await;
        inner
            .items
            .values()
            .filter_map(|m| m.resource.as_ref())
            .map(|r| r.size_bytes)
            .sum()
    }

    /// Begin acquiring the resource for one item.
    ///
    /// Only `NotLoaded` and `Failed` items start loading; every other
    /// state is a no-op. The acquisition runs on its own task under
    /// the concurrency limit and the per-attempt deadline.
    pub async fn preload(&self, item_id: &str) {
        let epoch = {
            let mut inner = self.inner.write().await;
            let Some(managed) = inner.items.get_mut(item_id) else {
                return;
            };
            match managed.state {
                ItemState::NotLoaded | ItemState::Failed => {}
                _ => return,
            }
            managed.state = ItemState::Loading;
            managed.epoch += 1;
            managed.epoch
        };
        self.notify(item_id, ItemState::Loading);

        let item = {
            let inner = self.inner.read().await;
            match inner.items.get(item_id) {
                Some(m) => m.item.clone(),
                None => return,
            }
        };

        let inner = Arc::clone(&self.inner);
        let loader = Arc::clone(&self.loader);
        let permits = Arc::clone(&self.preload_permits);
        let changes_tx = self.changes_tx.clone();
        let deadline = self.preload_timeout;
        let max_retries = self.max_retries;
        let id = item_id.to_string();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let result = match timeout(deadline, loader.load(&item)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(format!(
                    "preload exceeded {deadline:?}"
                ))),
            };

            let mut guard = inner.write().await;
            let Some(managed) = guard.items.get_mut(&id) else {
                return;
            };
            // A dispose (or newer preload) raced us; the outcome is stale.
            if managed.epoch != epoch || managed.state != ItemState::Loading {
                return;
            }

            let state = match result {
                Ok(resource) => {
                    managed.resource = Some(Arc::new(resource));
                    managed.retry_count = 0;
                    managed.state = ItemState::Ready;
                    debug!(item_id = %id, "resource ready");
                    ItemState::Ready
                }
                Err(e) => {
                    managed.retry_count += 1;
                    managed.state = if managed.retry_count >= max_retries {
                        warn!(item_id = %id, error = %e, retries = managed.retry_count,
                              "resource permanently failed");
                        ItemState::PermanentlyFailed
                    } else {
                        warn!(item_id = %id, error = %e, retries = managed.retry_count,
                              "resource load failed");
                        ItemState::Failed
                    };
                    managed.state
                }
            };
            managed.inflight = None;
            drop(guard);

            let _ = changes_tx.send(CacheChange { item_id: id, state });
        });

        let mut guard = self.inner.write().await;
        if let Some(managed) = guard.items.get_mut(item_id)
            && managed.state == ItemState::Loading
            && managed.epoch == epoch
        {
            managed.inflight = Some(handle);
        }
    }

    /// Move the viewing cursor: evict far Ready items, then preload
    /// the window around the cursor.
    ///
    /// Eviction always runs before any new acquisition begins.
    pub async fn preload_around(&self, cursor: usize) {
        let (to_dispose, to_preload) = {
            let inner = self.inner.read().await;
            let mut to_dispose = Vec::new();
            let mut to_preload = Vec::new();

            for (pos, id) in inner.order.iter().enumerate() {
                let Some(managed) = inner.items.get(id) else {
                    continue;
                };
                let distance = pos.abs_diff(cursor);
                let in_window = pos + self.keep_behind >= cursor
                    && pos <= cursor + self.preload_ahead;

                // The window is never evicted, so resident handles
                // stay bounded by its size.
                if managed.state == ItemState::Ready
                    && !in_window
                    && distance > self.memory_keep_range
                {
                    to_dispose.push(id.clone());
                    continue;
                }

                if in_window
                    && matches!(managed.state, ItemState::NotLoaded | ItemState::Failed)
                {
                    to_preload.push(id.clone());
                }
            }
            (to_dispose, to_preload)
        };

        for id in to_dispose {
            self.dispose(&id).await;
        }
        for id in to_preload {
            self.preload(&id).await;
        }
    }

    /// Release an item's resource and retire it permanently.
    ///
    /// Safe on unknown ids and idempotent on disposed ones. An
    /// acquisition in flight is cancelled.
    pub async fn dispose(&self, item_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(managed) = inner.items.get_mut(item_id) else {
            return;
        };
        if managed.state == ItemState::Disposed {
            return;
        }

        if let Some(handle) = managed.inflight.take() {
            handle.abort();
        }
        managed.resource = None;
        managed.state = ItemState::Disposed;
        managed.epoch += 1;
        drop(inner);

        info!(item_id = %item_id, "disposed item");
        self.notify(item_id, ItemState::Disposed);
    }

    /// Aggregate per-state counts for diagnostics.
    pub async fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.read().await;
        let mut snapshot = CacheSnapshot {
            tracked: inner.items.len(),
            not_loaded: 0,
            loading: 0,
            ready: 0,
            failed: 0,
            permanently_failed: 0,
            disposed: 0,
            memory_estimate_bytes: 0,
        };
        for managed in inner.items.values() {
            match managed.state {
                ItemState::NotLoaded => snapshot.not_loaded += 1,
                ItemState::Loading => snapshot.loading += 1,
                ItemState::Ready => snapshot.ready += 1,
                ItemState::Failed => snapshot.failed += 1,
                ItemState::PermanentlyFailed => snapshot.permanently_failed += 1,
                ItemState::Disposed => snapshot.disposed += 1,
            }
            if let Some(resource) = &managed.resource {
                snapshot.memory_estimate_bytes += resource.size_bytes;
            }
        }
        snapshot
    }

    fn notify(&self, item_id: &str, state: ItemState) {
        let _ = self.changes_tx.send(CacheChange {
            item_id: item_id.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Loader that succeeds instantly with a fixed-size resource.
    struct OkLoader {
        calls: AtomicU32,
    }

    impl OkLoader {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ResourceLoader for OkLoader {
        async fn load(&self, item: &AdmittedItem) -> Result<PlayerResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlayerResource {
                item_id: item.id.clone(),
                media_url: item.media_url.clone(),
                size_bytes: 1024,
            })
        }
    }

    struct FailLoader;

    #[async_trait]
    impl ResourceLoader for FailLoader {
        async fn load(&self, _item: &AdmittedItem) -> Result<PlayerResource> {
            Err(ClientError::ResourceAcquisition("404".to_string()))
        }
    }

    /// Loader that never completes; used to exercise the deadline.
    struct HangingLoader;

    #[async_trait]
    impl ResourceLoader for HangingLoader {
        async fn load(&self, _item: &AdmittedItem) -> Result<PlayerResource> {
            std::future::pending().await
        }
    }

    fn item(id: &str) -> AdmittedItem {
        AdmittedItem {
            id: id.to_string(),
            media_url: format!("https://cdn.example.com/{id}.mp4"),
            title: None,
            body: None,
            origin: "wss://relay.example.com/".to_string(),
            created_at: 1_700_000_000,
        }
    }

    async fn wait_for_state(cache: &PlayerCache, id: &str, want: ItemState) {
        let mut changes = cache.subscribe_changes();
        loop {
            if cache.state_of(id).await == Some(want) {
                return;
            }
            let change = changes.recv().await.unwrap();
            if change.item_id == id && change.state == want {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_admit_is_idempotent() {
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &CoreConfig::default());
        assert!(cache.admit(item("a")).await);
        assert!(!cache.admit(item("a")).await);
        assert_eq!(cache.state_of("a").await, Some(ItemState::NotLoaded));
    }

    #[tokio::test]
    async fn test_preload_reaches_ready() {
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &CoreConfig::default());
        cache.admit(item("a")).await;

        cache.preload("a").await;
        wait_for_state(&cache, "a", ItemState::Ready).await;

        let resource = cache.get_resource("a").await.unwrap();
        assert_eq!(resource.item_id, "a");
        assert_eq!(cache.memory_estimate_bytes().await, 1024);
    }

    #[tokio::test]
    async fn test_preload_skips_ready_items() {
        let loader = Arc::new(OkLoader::new());
        let cache = PlayerCache::new(Arc::clone(&loader) as Arc<dyn ResourceLoader>, &CoreConfig::default());
        cache.admit(item("a")).await;

        cache.preload("a").await;
        wait_for_state(&cache, "a", ItemState::Ready).await;
        cache.preload("a").await;

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_becomes_permanent_after_retries() {
        let config = CoreConfig {
            max_retries: 3,
            ..CoreConfig::default()
        };
        let cache = PlayerCache::new(Arc::new(FailLoader), &config);
        cache.admit(item("a")).await;

        for _ in 0..2 {
            cache.preload("a").await;
            wait_for_state(&cache, "a", ItemState::Failed).await;
        }

        cache.preload("a").await;
        wait_for_state(&cache, "a", ItemState::PermanentlyFailed).await;

        // Permanently failed items are never attempted again.
        cache.preload("a").await;
        assert_eq!(
            cache.state_of("a").await,
            Some(ItemState::PermanentlyFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_deadline_counts_as_failure() {
        let config = CoreConfig {
            preload_timeout: Duration::from_secs(10),
            ..CoreConfig::default()
        };
        let cache = PlayerCache::new(Arc::new(HangingLoader), &config);
        cache.admit(item("a")).await;

        cache.preload("a").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        wait_for_state(&cache, "a", ItemState::Failed).await;
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &CoreConfig::default());
        cache.admit(item("a")).await;

        cache.preload("a").await;
        wait_for_state(&cache, "a", ItemState::Ready).await;

        cache.dispose("a").await;
        assert_eq!(cache.state_of("a").await, Some(ItemState::Disposed));
        assert!(cache.get_resource("a").await.is_none());
        assert_eq!(cache.memory_estimate_bytes().await, 0);

        // Neither preload nor re-admission resurrects it.
        cache.preload("a").await;
        assert_eq!(cache.state_of("a").await, Some(ItemState::Disposed));
        assert!(!cache.admit(item("a")).await);
    }

    #[tokio::test]
    async fn test_dispose_unknown_is_noop() {
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &CoreConfig::default());
        cache.dispose("missing").await;
        assert!(!cache.contains("missing").await);
    }

    #[tokio::test]
    async fn test_dispose_cancels_inflight_load() {
        let cache = PlayerCache::new(Arc::new(HangingLoader), &CoreConfig::default());
        cache.admit(item("a")).await;

        cache.preload("a").await;
        assert_eq!(cache.state_of("a").await, Some(ItemState::Loading));

        cache.dispose("a").await;
        assert_eq!(cache.state_of("a").await, Some(ItemState::Disposed));
    }

    #[tokio::test]
    async fn test_preload_around_loads_window() {
        let config = CoreConfig {
            preload_ahead: 2,
            keep_behind: 1,
            memory_keep_range: 3,
            ..CoreConfig::default()
        };
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &config);
        for i in 0..6 {
            cache.admit(item(&format!("i{i}"))).await;
        }

        cache.preload_around(2).await;
        for id in ["i1", "i2", "i3", "i4"] {
            wait_for_state(&cache, id, ItemState::Ready).await;
        }
        assert_eq!(cache.state_of("i0").await, Some(ItemState::NotLoaded));
        assert_eq!(cache.state_of("i5").await, Some(ItemState::NotLoaded));
    }

    #[tokio::test]
    async fn test_preload_around_evicts_distant_ready_items() {
        let config = CoreConfig {
            preload_ahead: 1,
            keep_behind: 1,
            memory_keep_range: 2,
            ..CoreConfig::default()
        };
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &config);
        for i in 0..8 {
            cache.admit(item(&format!("i{i}"))).await;
        }

        cache.preload_around(0).await;
        wait_for_state(&cache, "i0", ItemState::Ready).await;
        wait_for_state(&cache, "i1", ItemState::Ready).await;

        // Cursor jumps far ahead; old Ready items fall out of range.
        cache.preload_around(6).await;
        assert_eq!(cache.state_of("i0").await, Some(ItemState::Disposed));
        assert_eq!(cache.state_of("i1").await, Some(ItemState::Disposed));
    }

    #[tokio::test]
    async fn test_walking_cursor_bounds_resident_handles() {
        let config = CoreConfig::default();
        let window = config.preload_ahead + config.keep_behind + 1;
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &config);
        for i in 0..14 {
            cache.admit(item(&format!("i{i}"))).await;
        }

        for cursor in 0..10 {
            cache.preload_around(cursor).await;

            let lo = cursor.saturating_sub(config.keep_behind);
            let hi = (cursor + config.preload_ahead).min(13);
            for pos in lo..=hi {
                wait_for_state(&cache, &format!("i{pos}"), ItemState::Ready).await;
            }

            let snapshot = cache.snapshot().await;
            assert!(
                snapshot.ready <= window,
                "cursor {cursor}: {} resident handles, window is {window}",
                snapshot.ready
            );
        }
    }

    #[tokio::test]
    async fn test_visible_items_preserve_feed_order() {
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &CoreConfig::default());
        for id in ["a", "b", "c"] {
            cache.admit(item(id)).await;
        }
        cache.preload("c").await;
        cache.preload("a").await;
        wait_for_state(&cache, "c", ItemState::Ready).await;
        wait_for_state(&cache, "a", ItemState::Ready).await;

        let visible: Vec<String> = cache
            .visible_items()
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(visible, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_counts_states() {
        let cache = PlayerCache::new(Arc::new(OkLoader::new()), &CoreConfig::default());
        cache.admit(item("a")).await;
        cache.admit(item("b")).await;
        cache.preload("a").await;
        wait_for_state(&cache, "a", ItemState::Ready).await;
        cache.dispose("b").await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.tracked, 2);
        assert_eq!(snapshot.ready, 1);
        assert_eq!(snapshot.disposed, 1);
        assert_eq!(snapshot.memory_estimate_bytes, 1024);
    }
}
