//! Live relay feed engine with a cursor-driven playback cache.
//!
//! This crate maintains persistent WebSocket subscriptions to a set of
//! relay endpoints and turns the resulting event stream into a
//! memory-bounded feed of playable items:
//!
//! - Connection pool with per-endpoint reconnect backoff
//! - Subscription multiplexing with filter-set deduplication
//! - Cross-endpoint event deduplication
//! - Admission filtering (blocklist, staleness, locator checks)
//! - Resource lifecycle under a moving viewing cursor
//!
//! # Example
//!
//! ```rust,no_run
//! use reel_client::{CoreConfig, FeedEngine, SubscriptionPriority};
//! use reel_client::cache::{AdmittedItem, PlayerResource, ResourceLoader};
//! use reel_core::Filter;
//! use std::sync::Arc;
//!
//! struct MyLoader;
//!
//! #[async_trait::async_trait]
//! impl ResourceLoader for MyLoader {
//!     async fn load(&self, item: &AdmittedItem) -> reel_client::Result<PlayerResource> {
//!         Ok(PlayerResource {
//!             item_id: item.id.clone(),
//!             media_url: item.media_url.clone(),
//!             size_bytes: 0,
//!         })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CoreConfig {
//!         relay_urls: vec!["wss://relay.example.com".to_string()],
//!         ..CoreConfig::default()
//!     };
//!     let engine = Arc::new(FeedEngine::new(config, None, None, Arc::new(MyLoader)));
//!     engine.start().await;
//!
//!     let filter = Filter::new().kinds(vec![34236]).limit(50);
//!     let mut feed = engine
//!         .open_feed(vec![filter], SubscriptionPriority::Normal, None)
//!         .await
//!         .unwrap();
//!
//!     while let Ok(update) = feed.updates.recv().await {
//!         println!("{update:?}");
//!         engine.preload_around(0).await;
//!     }
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod message;
pub mod pool;
pub mod subscription;

pub use auth::{AuthHandler, AuthState};
pub use bridge::{Blocklist, BridgeSignal, BridgeStats, FeedBridge, RejectReason};
pub use cache::{CacheSnapshot, ItemState, PlayerCache, ResourceLoader};
pub use config::CoreConfig;
pub use connection::{ConnectionState, EndpointConfig, OkReceipt, RelayConnection};
pub use engine::FeedEngine;
pub use error::{ClientError, Result};
pub use message::{ClientMessage, RelayMessage};
pub use pool::{PoolEvent, RelayPool};
pub use subscription::{
    SubscriptionHandle, SubscriptionMux, SubscriptionPriority, SubscriptionUpdate,
};
