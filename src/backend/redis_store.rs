//! Redis counter backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use tracing::{info, trace};

use super::{Backend, BackendOptions};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Clock, CounterUpdate, SystemClock, Window};

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Increment-with-expiry, executed atomically by the server.
///
/// The counter lives in a hash next to its absolute expiry (Unix seconds),
/// so every call in a window reports the same reset. `ARGV[1]` is the window
/// length and `ARGV[2]` the caller's clock, consulted only when a window
/// opens. A key that lost its TTL gets its stored expiry back.
///
/// Returns `{count, expires_at}`.
const UPDATE_SCRIPT: &str = r#"
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
local expires_at = tonumber(redis.call('HGET', KEYS[1], 'expires_at'))

if count == 1 or not expires_at then
    expires_at = tonumber(ARGV[2]) + tonumber(ARGV[1])
    redis.call('HSET', KEYS[1], 'expires_at', expires_at)
    redis.call('EXPIREAT', KEYS[1], expires_at)
    return {count, expires_at}
end

if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIREAT', KEYS[1], expires_at)
end

return {count, expires_at}
"#;

/// Connection settings for [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Upper bound on establishing the initial connection
    pub connect_timeout: Duration,
    /// Upper bound on each update round-trip; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: None,
        }
    }
}

impl RedisOptions {
    /// Read `url`, `connect_timeout_ms` and `timeout_ms` from backend options.
    pub fn from_options(options: &BackendOptions) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            url: options
                .get("url")
                .map(str::to_owned)
                .unwrap_or(defaults.url),
            connect_timeout: options
                .parse::<u64>("connect_timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            timeout: options
                .parse::<u64>("timeout_ms")?
                .map(Duration::from_millis),
        })
    }

    /// Open a connection manager to the configured server.
    pub(crate) async fn connect(&self, backend: &'static str) -> Result<ConnectionManager> {
        let client = Client::open(self.url.as_str())
            .map_err(|e| TurnstileError::Config(format!("invalid redis url: {}", e)))?;

        let conn = tokio::time::timeout(self.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| TurnstileError::unavailable(backend, "connection timed out"))?
            .map_err(|e| TurnstileError::from_redis(backend, e))?;

        info!(backend, url = %self.url, "Connected to Redis");
        Ok(conn)
    }
}

/// Run `fut`, bounding it by `timeout` and classifying its error.
pub(crate) async fn round_trip<T, F>(
    backend: &'static str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = RedisResult<T>>,
{
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TurnstileError::unavailable(backend, "operation timed out"))?,
        None => fut.await,
    };
    result.map_err(|e| TurnstileError::from_redis(backend, e))
}

/// A backend that keeps counters in Redis.
///
/// Updates run as a single Lua script, so they are linearizable per key
/// across every process sharing the server. The window opens on the clock
/// of whichever process sends the first hit.
pub struct RedisBackend {
    conn: ConnectionManager,
    script: Script,
    timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl RedisBackend {
    /// Name under which this backend is registered.
    pub const NAME: &'static str = "redis";

    /// Connect using `options`.
    pub async fn connect(options: RedisOptions) -> Result<Self> {
        let conn = options.connect(Self::NAME).await?;
        Ok(Self::from_connection(conn, options.timeout))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, timeout: Option<Duration>) -> Self {
        Self {
            conn,
            script: Script::new(UPDATE_SCRIPT),
            timeout,
            clock: Arc::new(SystemClock),
        }
    }

    /// Open windows on `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn update(&self, key: &str, limit: u64, window: Window) -> Result<CounterUpdate> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(window.as_secs()).arg(self.clock.now());

        let (count, reset): (u64, i64) = round_trip(
            Self::NAME,
            self.timeout,
            invocation.invoke_async(&mut conn),
        )
        .await?;

        trace!(key = %key, count, reset, limit, "Counter updated");

        Ok(CounterUpdate::new(count, limit, reset))
    }
}
