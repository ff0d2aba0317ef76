//! Engine configuration.
//!
//! One explicit value passed at construction time; there is no global
//! configuration source.

use std::time::Duration;

/// Configuration for the whole engine: relay set, subscription caps,
/// admission policy, and cache sizing.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Relay endpoints to maintain connections to
    pub relay_urls: Vec<String>,

    /// Maximum distinct active filter signatures
    pub max_subscriptions: usize,
    /// Lifetime after which a subscription is force-closed by the sweep
    pub subscription_timeout: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,

    /// Capacity of the seen-event-id set
    pub dedup_capacity: usize,

    /// Events older than this are rejected at admission
    pub stale_after: Duration,
    /// Hosts whose locators are accepted without a recognized extension
    pub allowed_media_hosts: Vec<String>,

    /// Items preloaded ahead of the cursor
    pub preload_ahead: usize,
    /// Items kept loaded behind the cursor
    pub keep_behind: usize,
    /// Ready items farther than this from the cursor, and outside the
    /// preload window, are disposed. Keeping this within the window
    /// arms bounds residency at `preload_ahead + keep_behind + 1`.
    pub memory_keep_range: usize,
    /// Consecutive preload failures before an item is permanently failed
    pub max_retries: u32,
    /// Deadline for a single resource acquisition
    pub preload_timeout: Duration,
    /// Concurrent preload fan-out limit
    pub preload_concurrency: usize,

    /// Deadline for establishing one connection
    pub connect_timeout: Duration,
    /// Base reconnect delay
    pub reconnect_base: Duration,
    /// Reconnect delay cap, also the extended cool-down length
    pub reconnect_cap: Duration,
    /// Consecutive failures before the extended cool-down
    pub max_reconnect_attempts: u32,

    /// How often the bridge health check runs
    pub health_interval: Duration,
    /// Idle-ingest duration that triggers a subscription restart
    pub stalled_after: Duration,
    /// Resident-resource estimate that triggers a memory warning
    pub memory_high_water_bytes: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relay_urls: Vec::new(),
            max_subscriptions: 15,
            subscription_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            dedup_capacity: 5000,
            stale_after: Duration::from_secs(30 * 24 * 60 * 60),
            allowed_media_hosts: Vec::new(),
            preload_ahead: 3,
            keep_behind: 2,
            memory_keep_range: 2,
            max_retries: 3,
            preload_timeout: Duration::from_secs(10),
            preload_concurrency: 4,
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(2),
            reconnect_cap: Duration::from_secs(30 * 60),
            max_reconnect_attempts: 8,
            health_interval: Duration::from_secs(120),
            stalled_after: Duration::from_secs(600),
            memory_high_water_bytes: 512 * 1024 * 1024,
        }
    }
}
