//! In-process counter backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::Backend;
use crate::error::Result;
use crate::ratelimit::{Clock, CounterRecord, CounterUpdate, SystemClock, Window};

/// Updates between two sweeps of expired counters.
pub const PURGE_INTERVAL: u64 = 1024;

/// A backend that keeps counters in a process-local map.
///
/// Each key's read-modify-write runs under the map shard's write lock, so
/// updates to one key are linearizable. Expired counters are not reaped in
/// the background: a stale entry is treated as absent and overwritten on its
/// next update, and every [`PURGE_INTERVAL`] updates the map is swept with
/// [`MemoryBackend::purge_expired`].
pub struct MemoryBackend {
    /// Counter records indexed by serialized key
    counters: DashMap<String, CounterRecord>,
    /// Updates since creation, drives the sweep schedule
    updates: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Name under which this backend is registered.
    pub const NAME: &'static str = "memory";

    /// Create an empty backend driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty backend driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            updates: AtomicU64::new(0),
            clock,
        }
    }

    /// Current record for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<CounterRecord> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .map(|record| *record)
            .filter(|record| !record.is_expired(now))
    }

    /// Drop every counter whose window has closed. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, record| !record.is_expired(now));
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            debug!(purged, "Purged expired counters");
        }
        purged
    }

    /// Number of stored counters, including expired ones not yet overwritten.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counters are stored.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn update(&self, key: &str, limit: u64, window: Window) -> Result<CounterUpdate> {
        let now = self.clock.now();

        let record = {
            let entry = self
                .counters
                .entry(key.to_owned())
                .and_modify(|record| record.hit(now, window))
                .or_insert_with(|| CounterRecord::open(now, window));
            *entry
        };

        if record.count == 1 {
            debug!(
                key = %key,
                window = %window,
                expires_at = record.expires_at,
                "Opened new counter window"
            );
        }
        trace!(key = %key, count = record.count, limit, "Counter updated");

        // The entry guard is released above; retain takes every shard lock.
        if (self.updates.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_INTERVAL == 0 {
            self.purge_expired();
        }

        Ok(CounterUpdate::from_record(&record, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn backend_at(now: i64) -> (MemoryBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (MemoryBackend::with_clock(clock.clone()), clock)
    }

    fn window(seconds: u64) -> Window {
        Window::from_secs(seconds).unwrap()
    }

    #[tokio::test]
    async fn test_first_update_creates_counter() {
        let (backend, _) = backend_at(1_000);
        assert!(backend.is_empty());

        let update = backend.update("k", 3, window(60)).await.unwrap();
        assert_eq!(update.count, 1);
        assert!(!update.exceeded);
        assert_eq!(update.remaining, 2);
        assert_eq!(update.reset, 1_060);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_update_completes_on_first_poll() {
        let backend = MemoryBackend::new();
        let mut task = tokio_test::task::spawn(backend.update("k", 1, window(60)));
        let update = tokio_test::assert_ready_ok!(task.poll());
        assert_eq!(update.count, 1);
    }

    #[tokio::test]
    async fn test_sequential_updates_count_up() {
        let (backend, _) = backend_at(0);

        let first = backend.update("k", 10, window(60)).await.unwrap();
        let second = backend.update("k", 10, window(60)).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(backend.get("k").unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_exceeded_starts_at_limit_plus_one() {
        let (backend, _) = backend_at(0);

        for expected in 1..=3u64 {
            let update = backend.update("k", 3, window(60)).await.unwrap();
            assert_eq!(update.count, expected);
            assert!(!update.exceeded);
            assert_eq!(update.remaining, 3 - expected);
        }
        for _ in 0..3 {
            let update = backend.update("k", 3, window(60)).await.unwrap();
            assert!(update.exceeded);
            assert_eq!(update.remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_expiry_does_not_slide() {
        let (backend, clock) = backend_at(100);

        let first = backend.update("k", 5, window(10)).await.unwrap();
        clock.advance(9);
        let second = backend.update("k", 5, window(10)).await.unwrap();
        assert_eq!(first.reset, 110);
        assert_eq!(second.reset, 110);
    }

    #[tokio::test]
    async fn test_window_elapses_into_fresh_window() {
        let (backend, clock) = backend_at(100);

        backend.update("k", 1, window(10)).await.unwrap();
        let over = backend.update("k", 1, window(10)).await.unwrap();
        assert!(over.exceeded);

        clock.advance(10);
        assert!(backend.get("k").is_none());

        let fresh = backend.update("k", 1, window(10)).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert!(!fresh.exceeded);
        assert_eq!(fresh.reset, 120);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (backend, _) = backend_at(0);

        backend.update("a", 1, window(60)).await.unwrap();
        backend.update("a", 1, window(60)).await.unwrap();
        let b = backend.update("b", 1, window(60)).await.unwrap();

        assert_eq!(b.count, 1);
        assert!(!b.exceeded);
        assert_eq!(backend.get("a").unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (backend, clock) = backend_at(0);

        backend.update("short", 5, window(5)).await.unwrap();
        backend.update("long", 5, window(50)).await.unwrap();
        clock.advance(6);

        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
        assert!(backend.get("long").is_some());

        backend.clear();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_expired_keys_are_swept_during_updates() {
        let (backend, clock) = backend_at(0);
        let keys_per_round = PURGE_INTERVAL as usize;

        for round in 0..10 {
            for i in 0..keys_per_round {
                let key = format!("{}-{}", round, i);
                backend.update(&key, 5, window(10)).await.unwrap();
            }
            clock.advance(11);
        }

        // Each sweep sees only the round before it as expired.
        assert!(backend.len() <= 2 * keys_per_round);
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_counters() {
        let (backend, clock) = backend_at(0);

        backend.update("long", 5, window(3600)).await.unwrap();
        for i in 1..PURGE_INTERVAL {
            backend.update(&format!("short-{}", i), 5, window(1)).await.unwrap();
            if i == 1 {
                clock.advance(2);
            }
        }

        assert_eq!(backend.get("long").unwrap().count, 1);
        assert_eq!(backend.len(), PURGE_INTERVAL as usize - 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_observe_distinct_counts() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();

        for _ in 0..200 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.update("hot", 50, window(3600)).await.unwrap()
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }

        let mut observed: Vec<u64> = counts.iter().map(|u| u.count).collect();
        observed.sort_unstable();
        assert_eq!(observed, (1..=200).collect::<Vec<_>>());

        let exceeded = counts.iter().filter(|u| u.exceeded).count();
        assert_eq!(exceeded, 150);
        assert!(counts.iter().all(|u| u.exceeded == (u.count > 50)));
    }
}
