//! Adapter for caches that only offer get and set-with-ttl.
//!
//! Such stores have no atomic increment, so [`CacheBackend`] serializes the
//! read-modify-write for each key behind a per-key async lock. The guarantee
//! is process-local: two processes sharing one cache can interleave and lose
//! increments. Use [`RedisBackend`](super::RedisBackend) when several
//! processes must share exact counts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, trace};

use super::redis_store::{round_trip, RedisOptions};
use super::Backend;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Clock, CounterRecord, CounterUpdate, SystemClock, Window};

/// A key-value cache able to hold counter records.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Name of the backend built on this store.
    fn name(&self) -> &'static str;

    /// Key prefix the cache applies for its own entries, if any.
    fn key_prefix(&self) -> Option<&str> {
        None
    }

    /// Fetch the record for `key`.
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>>;

    /// Store `record` under `key`, letting the cache drop it after `ttl`.
    async fn set(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<()>;
}

/// Encode a record for string-valued caches as `count:expires_at`.
pub(crate) fn encode_record(record: &CounterRecord) -> String {
    format!("{}:{}", record.count, record.expires_at)
}

/// Inverse of [`encode_record`].
pub(crate) fn decode_record(raw: &str) -> Result<CounterRecord> {
    let malformed = || TurnstileError::Backend(format!("malformed counter record: {:?}", raw));
    let (count, expires_at) = raw.split_once(':').ok_or_else(malformed)?;
    Ok(CounterRecord {
        count: count.parse().map_err(|_| malformed())?,
        expires_at: expires_at.parse().map_err(|_| malformed())?,
    })
}

/// A backend counting through any [`CacheStore`].
pub struct CacheBackend<S> {
    store: S,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl<S: CacheStore> CacheBackend<S> {
    /// Wrap `store`, using the system clock.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Wrap `store`, using `clock` for window arithmetic.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            clock,
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn locked_update(&self, key: &str, limit: u64, window: Window) -> Result<CounterUpdate> {
        let now = self.clock.now();
        let record = match self.store.get(key).await? {
            Some(mut record) => {
                record.hit(now, window);
                record
            }
            None => CounterRecord::open(now, window),
        };
        if record.count == 1 {
            debug!(key = %key, window = %window, "Opened new counter window");
        }

        let ttl = Duration::from_secs(record.ttl(now).max(1));
        self.store.set(key, record, ttl).await?;
        trace!(key = %key, count = record.count, limit, "Counter updated");

        Ok(CounterUpdate::from_record(&record, limit))
    }
}

#[async_trait]
impl<S: CacheStore> Backend for CacheBackend<S> {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    fn key_prefix(&self) -> Option<&str> {
        self.store.key_prefix()
    }

    async fn update(&self, key: &str, limit: u64, window: Window) -> Result<CounterUpdate> {
        let slot = LockSlot::acquire(&self.locks, key);
        let _guard = slot.lock().await;
        self.locked_update(key, limit, window).await
    }
}

/// A claim on one key's lock entry.
///
/// Dropping the slot removes the entry once no other caller holds it, which
/// also covers an update future cancelled while waiting.
struct LockSlot<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> LockSlot<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>, key: &'a str) -> Self {
        let lock = locks.entry(key.to_owned()).or_default().clone();
        Self { locks, key, lock }
    }

    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for LockSlot<'_> {
    fn drop(&mut self) {
        // Held by the map and by this slot only.
        self.locks.remove_if(self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// A [`CacheStore`] over a Redis connection shared with an application cache.
pub struct RedisCache {
    conn: ConnectionManager,
    key_prefix: Option<String>,
    timeout: Option<Duration>,
}

impl RedisCache {
    /// Name of the backend built on this store.
    pub const NAME: &'static str = "redis-cache";

    /// Wrap an existing cache connection whose entries use `key_prefix`.
    pub fn new(conn: ConnectionManager, key_prefix: Option<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.filter(|prefix| !prefix.is_empty()),
            timeout: None,
        }
    }

    /// Connect using `options`.
    pub async fn connect(options: &RedisOptions, key_prefix: Option<String>) -> Result<Self> {
        let conn = options.connect(Self::NAME).await?;
        Ok(Self {
            timeout: options.timeout,
            ..Self::new(conn, key_prefix)
        })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    async fn get(&self, key: &str) -> Result<Option<CounterRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = round_trip(Self::NAME, self.timeout, conn.get(key)).await?;
        raw.as_deref().map(decode_record).transpose()
    }

    async fn set(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        round_trip(
            Self::NAME,
            self.timeout,
            conn.set_ex::<_, _, ()>(key, encode_record(&record), ttl.as_secs().max(1)),
        )
        .await
    }
}

/// A process-local [`CacheStore`] with its own TTL bookkeeping.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (CounterRecord, Instant)>>,
    key_prefix: Option<String>,
}

impl MemoryCache {
    /// Name of the backend built on this store.
    pub const NAME: &'static str = "memory-cache";

    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache whose entries use `key_prefix`.
    pub fn with_prefix(key_prefix: impl Into<String>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            key_prefix: Some(key_prefix.into()),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    /// Whether the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    async fn get(&self, key: &str) -> Result<Option<CounterRecord>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(record, _)| *record);
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_owned(), (record, Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn window(seconds: u64) -> Window {
        Window::from_secs(seconds).unwrap()
    }

    /// A cache that can be switched off to simulate an outage.
    #[derive(Default)]
    struct FlakyCache {
        inner: MemoryCache,
        down: AtomicBool,
    }

    #[async_trait]
    impl CacheStore for FlakyCache {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, key: &str) -> Result<Option<CounterRecord>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TurnstileError::unavailable("flaky", "connection refused"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<()> {
            self.inner.set(key, record, ttl).await
        }
    }

    #[test]
    fn test_record_encoding() {
        let record = CounterRecord {
            count: 7,
            expires_at: 1_700_000_060,
        };
        assert_eq!(encode_record(&record), "7:1700000060");
        assert_eq!(decode_record("7:1700000060").unwrap(), record);
    }

    #[test]
    fn test_malformed_record_is_backend_error() {
        assert!(matches!(
            decode_record("seven"),
            Err(TurnstileError::Backend(_))
        ));
        assert!(matches!(
            decode_record("7:soon"),
            Err(TurnstileError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_backend_counts_through_store() {
        let clock = Arc::new(ManualClock::new(1_000));
        let backend = CacheBackend::with_clock(MemoryCache::new(), clock.clone());

        let first = backend.update("k", 2, window(60)).await.unwrap();
        let second = backend.update("k", 2, window(60)).await.unwrap();
        let third = backend.update("k", 2, window(60)).await.unwrap();

        assert_eq!((first.count, first.remaining, first.exceeded), (1, 1, false));
        assert_eq!((second.count, second.remaining, second.exceeded), (2, 0, false));
        assert_eq!((third.count, third.remaining, third.exceeded), (3, 0, true));
        assert_eq!(third.reset, 1_060);
        assert_eq!(backend.store().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_backend_reopens_stale_window() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = CacheBackend::with_clock(MemoryCache::new(), clock.clone());

        backend.update("k", 1, window(30)).await.unwrap();
        clock.advance(30);

        let fresh = backend.update("k", 1, window(30)).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.reset, 60);
    }

    #[tokio::test]
    async fn test_cache_backend_propagates_unavailable() {
        let backend = CacheBackend::new(FlakyCache::default());
        backend.store().down.store(true, Ordering::SeqCst);

        let err = backend.update("k", 1, window(30)).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(backend.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cache_backend_serializes_per_key() {
        let backend = Arc::new(CacheBackend::new(MemoryCache::new()));
        let mut handles = Vec::new();

        for _ in 0..100 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.update("shared", 10, window(600)).await.unwrap().count
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=100).collect::<Vec<_>>());
        assert!(backend.locks.is_empty());
    }

    /// A cache whose reads take longer than callers are willing to wait.
    #[derive(Default)]
    struct SlowCache {
        inner: MemoryCache,
    }

    #[async_trait]
    impl CacheStore for SlowCache {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get(&self, key: &str) -> Result<Option<CounterRecord>> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, record: CounterRecord, ttl: Duration) -> Result<()> {
            self.inner.set(key, record, ttl).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_updates_release_locks() {
        let backend = CacheBackend::new(SlowCache::default());

        for i in 0..50 {
            let key = format!("client-{}", i);
            let outcome = tokio::time::timeout(
                Duration::from_millis(5),
                backend.update(&key, 10, window(60)),
            )
            .await;
            assert!(outcome.is_err());
        }

        assert!(backend.locks.is_empty());
        assert!(backend.store().inner.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_keeps_holder_entry() {
        let backend = Arc::new(CacheBackend::new(SlowCache::default()));

        let holder = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.update("shared", 10, window(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = tokio::time::timeout(
            Duration::from_millis(5),
            backend.update("shared", 10, window(60)),
        )
        .await;
        assert!(waiter.is_err());
        assert_eq!(backend.locks.len(), 1);

        assert_eq!(holder.await.unwrap().unwrap().count, 1);
        assert!(backend.locks.is_empty());
    }

    #[test]
    fn test_memory_cache_prefix() {
        assert_eq!(MemoryCache::new().key_prefix(), None);
        assert_eq!(MemoryCache::with_prefix("app").key_prefix(), Some("app"));
        assert_eq!(MemoryCache::new().name(), "memory-cache");
    }
}
