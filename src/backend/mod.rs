//! Counter storage backends.
//!
//! Every backend implements the same fixed-window contract: increment the
//! counter for a key (creating it with an expiry of `now + window` when
//! absent), then report the post-increment count and the window's expiry.
//! The increment and the read-back are indivisible per key, so concurrent
//! callers on one key observe the counts `1..=N` exactly once each.

mod cache;
mod memory;
mod redis_store;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;

pub use self::cache::{CacheBackend, CacheStore, MemoryCache, RedisCache};
pub use self::memory::{MemoryBackend, PURGE_INTERVAL};
pub use self::redis_store::{RedisBackend, RedisOptions};
pub use self::registry::{BackendFactory, BackendOptions, BackendRegistry, DEFAULT_BACKEND};

use crate::error::Result;
use crate::ratelimit::{CounterUpdate, Window};

/// Trait for counter storage implementations.
///
/// Implementations must be safe to call concurrently from many tasks. A
/// failure to reach the underlying store is reported as
/// [`TurnstileError::BackendUnavailable`](crate::error::TurnstileError::BackendUnavailable)
/// and never retried here.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name under which this backend is registered.
    fn name(&self) -> &'static str;

    /// Key prefix already used by the underlying store, if it has one.
    ///
    /// A limiter built on this backend adopts it so its counters share the
    /// store's namespace.
    fn key_prefix(&self) -> Option<&str> {
        None
    }

    /// Count one operation against `key` and report the window state.
    async fn update(&self, key: &str, limit: u64, window: Window) -> Result<CounterUpdate>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn key_prefix(&self) -> Option<&str> {
        (**self).key_prefix()
    }

    async fn update(&self, key: &str, limit: u64, window: Window) -> Result<CounterUpdate> {
        (**self).update(key, limit, window).await
    }
}
