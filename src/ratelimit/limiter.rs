//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, trace};

use super::counter::Window;
use super::key::RateKey;
use crate::backend::{Backend, BackendRegistry};
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Computes a quota from `(identity, scope)`.
pub type QuotaFn = Arc<dyn Fn(&str, &str) -> u64 + Send + Sync>;

/// How many operations a caller is allowed per window.
#[derive(Clone)]
pub enum Quota {
    /// The same quota for everyone
    Fixed(u64),
    /// A quota chosen per call, e.g. higher for authenticated callers
    Dynamic(QuotaFn),
}

impl Quota {
    /// The effective quota for this call.
    ///
    /// A dynamic quota of zero rejects every call.
    pub fn resolve(&self, identity: &str, scope: &str) -> u64 {
        match self {
            Quota::Fixed(limit) => *limit,
            Quota::Dynamic(quota) => quota(identity, scope),
        }
    }
}

impl fmt::Debug for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Fixed(limit) => f.debug_tuple("Fixed").field(limit).finish(),
            Quota::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A validated rate limit rule.
#[derive(Debug, Clone)]
pub struct RateLimit {
    quota: Quota,
    window: Window,
    emit_headers: bool,
}

impl RateLimit {
    /// At most `limit` operations per `window_secs` seconds.
    pub fn new(limit: u64, window_secs: u64) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "limit must be at least one operation".to_string(),
            ));
        }
        Ok(Self {
            quota: Quota::Fixed(limit),
            window: Window::from_secs(window_secs)?,
            emit_headers: true,
        })
    }

    /// A quota computed per call from `(identity, scope)`.
    pub fn dynamic<F>(quota: F, window_secs: u64) -> Result<Self>
    where
        F: Fn(&str, &str) -> u64 + Send + Sync + 'static,
    {
        Ok(Self {
            quota: Quota::Dynamic(Arc::new(quota)),
            window: Window::from_secs(window_secs)?,
            emit_headers: true,
        })
    }

    /// Whether decisions under this rule should produce response headers.
    pub fn with_headers(mut self, emit_headers: bool) -> Self {
        self.emit_headers = emit_headers;
        self
    }

    /// The quota.
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// The counting window.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Whether decisions should produce response headers.
    pub fn emit_headers(&self) -> bool {
        self.emit_headers
    }
}

/// The outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Quota applied to this call
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Whether the caller is over the quota
    pub exceeded: bool,
    /// Operations left in the window, never negative
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the window resets
    pub reset: i64,
    /// Whether response headers should be emitted for this decision
    pub emit_headers: bool,
}

impl RateLimitInfo {
    /// The reset time as a UTC datetime.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.reset, 0)
    }
}

/// The rate limiter that turns an identity and scope into a decision.
///
/// This struct is thread-safe and can be shared across multiple tasks. It
/// holds one backend for its whole lifetime.
pub struct Limiter {
    backend: Arc<dyn Backend>,
    key_prefix: String,
}

impl Limiter {
    /// Create a limiter over `backend`.
    ///
    /// If the backend reports a key prefix of its own, that prefix is used
    /// instead of `key_prefix`.
    pub fn new(backend: Arc<dyn Backend>, key_prefix: impl Into<String>) -> Self {
        let key_prefix = match backend.key_prefix() {
            Some(adopted) => {
                info!(prefix = %adopted, "Adopting key prefix of shared cache");
                adopted.to_owned()
            }
            None => key_prefix.into(),
        };

        Self {
            backend,
            key_prefix,
        }
    }

    /// Build the configured backend through `registry` and wrap it.
    pub async fn from_config(config: &TurnstileConfig, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry
            .build(&config.backend, config.effective_backend_options())
            .await?;
        Ok(Self::new(backend, config.key_prefix.clone()))
    }

    /// The backend in use.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The namespace prepended to every key.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Count one operation by `identity` on `scope` and decide.
    ///
    /// Backend failures are returned as-is and never retried.
    pub async fn decide(
        &self,
        identity: &str,
        scope: &str,
        rate_limit: &RateLimit,
    ) -> Result<RateLimitInfo> {
        let limit = rate_limit.quota.resolve(identity, scope);
        let key = RateKey::new(&self.key_prefix, identity, scope).to_string_key();

        trace!(key = %key, limit, window = %rate_limit.window, "Checking rate limit");

        let update = self.backend.update(&key, limit, rate_limit.window).await?;

        if update.exceeded {
            debug!(key = %key, limit, count = update.count, "Rate limit exceeded");
        }

        Ok(RateLimitInfo {
            limit,
            window_seconds: rate_limit.window.as_secs(),
            exceeded: update.exceeded,
            remaining: update.remaining,
            reset: update.reset,
            emit_headers: rate_limit.emit_headers,
        })
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("backend", &self.backend.name())
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}
