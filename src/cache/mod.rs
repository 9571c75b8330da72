//! Local cache core for the blog client.
//!
//! - **Policy**: classifies each key as missing, fresh, stale or expired
//! - **Refresh**: at most one network refresh in flight per key
//! - **Eviction**: retention window, capacity bounds and clear-all
//! - **Sync**: periodic background refresh with linear backoff
//!
//! [`CacheManager`] ties these together behind the read path used by screens.
//!
//! ## Configuration
//!
//! Defaults live in [`config`]; the binary can override them from
//! `postcache.toml`:
//!
//! ```toml
//! [cache]
//! max_cached_posts = 200
//! max_cached_comments_per_post = 100
//! retention_window_seconds = 86400
//!
//! [cache.policies.categories]
//! stale_seconds = 0
//! expiry_seconds = 3600
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod keys;
pub(crate) mod lock;
pub mod manager;
pub mod metadata;
pub mod policy;
pub mod refresh;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ClassPolicies, ConfigError, FreshnessPolicy};
pub use error::{CacheError, FetchError, StoreError};
pub use events::{CacheEvent, CacheEvents, Epoch, EventKind};
pub use eviction::EvictionManager;
pub use keys::{CacheKey, KeyClass, ParseKeyError};
pub use manager::{CacheManager, CacheStats, CachedData};
pub use metadata::CacheMetadata;
pub use policy::{Freshness, ReadDecision, classify};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use sync::{
    AlwaysAvailable, DeviceConditions, SkipReason, SyncConfig, SyncCoordinator, SyncOutcome,
    SyncReport, SyncState,
};
