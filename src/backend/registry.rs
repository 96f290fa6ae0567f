//! Named backend factories, resolved once at startup.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::cache::{CacheBackend, RedisCache};
use super::memory::MemoryBackend;
use super::redis_store::{RedisBackend, RedisOptions};
use super::Backend;
use crate::error::{Result, TurnstileError};

/// Backend used when the configured name is not registered.
pub const DEFAULT_BACKEND: &str = MemoryBackend::NAME;

/// Backend-specific settings, as option name to raw value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendOptions(BTreeMap<String, String>);

impl BackendOptions {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Raw value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Value of `name` parsed as `T`, failing on an unparseable value.
    pub fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse().map_err(|e| {
                    TurnstileError::Config(format!(
                        "invalid value {:?} for backend option {}: {}",
                        raw, name, e
                    ))
                })
            })
            .transpose()
    }
}

impl From<HashMap<String, String>> for BackendOptions {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl FromIterator<(String, String)> for BackendOptions {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Builds a backend from its options.
pub type BackendFactory =
    Arc<dyn Fn(BackendOptions) -> BoxFuture<'static, Result<Arc<dyn Backend>>> + Send + Sync>;

/// Registry mapping backend names to factories.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in `memory`, `redis` and `redis-cache` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register(MemoryBackend::NAME, |_options| {
            async {
                let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
                Ok::<_, TurnstileError>(backend)
            }
            .boxed()
        });

        registry.register(RedisBackend::NAME, |options| {
            async move {
                let redis = RedisOptions::from_options(&options)?;
                let backend = RedisBackend::connect(redis).await?;
                Ok::<_, TurnstileError>(Arc::new(backend) as Arc<dyn Backend>)
            }
            .boxed()
        });

        registry.register(RedisCache::NAME, |options| {
            async move {
                let redis = RedisOptions::from_options(&options)?;
                let prefix = options.get("cache_prefix").map(str::to_owned);
                let store = RedisCache::connect(&redis, prefix).await?;
                Ok::<_, TurnstileError>(Arc::new(CacheBackend::new(store)) as Arc<dyn Backend>)
            }
            .boxed()
        });

        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(BackendOptions) -> BoxFuture<'static, Result<Arc<dyn Backend>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The name that `requested` resolves to.
    ///
    /// Unknown names fall back to [`DEFAULT_BACKEND`] with a warning.
    pub fn resolve<'a>(&self, requested: &'a str) -> Result<&'a str> {
        if self.contains(requested) {
            return Ok(requested);
        }
        if !self.contains(DEFAULT_BACKEND) {
            return Err(TurnstileError::Config(format!(
                "unknown backend {:?} and no {:?} fallback registered",
                requested, DEFAULT_BACKEND
            )));
        }
        warn!(
            requested = %requested,
            fallback = DEFAULT_BACKEND,
            known = ?self.names(),
            "Unknown rate limit backend, falling back to default"
        );
        Ok(DEFAULT_BACKEND)
    }

    /// Build the backend registered under `name`.
    pub async fn build(&self, name: &str, options: BackendOptions) -> Result<Arc<dyn Backend>> {
        let resolved = self.resolve(name)?;
        let factory = self.factories.get(resolved).cloned().ok_or_else(|| {
            TurnstileError::Config(format!("backend {:?} is not registered", resolved))
        })?;

        let backend = factory(options).await?;
        info!(backend = backend.name(), "Rate limit backend initialized");
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
