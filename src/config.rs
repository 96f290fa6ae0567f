//! Configuration management for Turnstile.

use std::fs;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{BackendOptions, DEFAULT_BACKEND};
use crate::error::{Result, TurnstileError};

/// Prefix for environment overrides, e.g. `TURNSTILE_BACKEND=redis`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Name of the counter backend
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Backend-specific options (e.g. `url`, `timeout_ms`)
    #[serde(default)]
    pub backend_options: BackendOptions,

    /// Namespace prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Key prefix of a shared application cache; adopted by cache-adapter backends
    #[serde(default)]
    pub cache_key_prefix: Option<String>,

    /// Whether `X-RateLimit-*` headers are added to responses
    #[serde(default = "default_inject_headers")]
    pub inject_headers: bool,

    /// What to do when the backend cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            backend_options: BackendOptions::default(),
            key_prefix: default_key_prefix(),
            cache_key_prefix: None,
            inject_headers: default_inject_headers(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn file_format(path: &Path) -> Result<FileFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
        Some("toml") => Ok(FileFormat::Toml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(TurnstileError::Config(format!(
            "unsupported configuration file: {}",
            path.display()
        ))),
    }
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_inject_headers() -> bool {
    true
}

/// Handling of requests whose counter could not be updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Surface the backend error; the request is not let through
    #[default]
    Closed,
    /// Log the failure and let the request through unlimited
    Open,
}

impl TurnstileConfig {
    /// Load configuration from an optional file, overridden by `TURNSTILE_*`
    /// environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            let format = file_format(path)?;
            let contents = fs::read_to_string(path)?;
            builder = builder.add_source(File::from_str(&contents, format));
        }
        let config: TurnstileConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.log_summary();
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?)
    }

    /// Options handed to the backend factory.
    ///
    /// `cache_key_prefix` is forwarded as the `cache_prefix` option unless
    /// the backend options already name one.
    pub fn effective_backend_options(&self) -> BackendOptions {
        let mut options = self.backend_options.clone();
        if let Some(prefix) = self.cache_key_prefix.as_deref().filter(|p| !p.is_empty()) {
            if options.get("cache_prefix").is_none() {
                options.insert("cache_prefix", prefix);
            }
        }
        options
    }

    fn log_summary(&self) {
        info!(
            backend = %self.backend,
            key_prefix = %self.key_prefix,
            inject_headers = self.inject_headers,
            failure_policy = ?self.failure_policy,
            "Configuration loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.backend, "memory");
        assert_eq!(config.key_prefix, "rate_limit");
        assert!(config.inject_headers);
        assert_eq!(config.failure_policy, FailurePolicy::Closed);
        assert!(config.backend_options.get("url").is_none());
    }

    #[test]
    fn test_empty_yaml_yields_defaults() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config, TurnstileConfig::default());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
backend: redis
backend_options:
  url: "redis://cache:6379/1"
  timeout_ms: "250"
key_prefix: api
inject_headers: false
failure_policy: open
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backend, "redis");
        assert_eq!(config.backend_options.get("url"), Some("redis://cache:6379/1"));
        assert_eq!(
            config.backend_options.parse::<u64>("timeout_ms").unwrap(),
            Some(250)
        );
        assert_eq!(config.key_prefix, "api");
        assert!(!config.inject_headers);
        assert_eq!(config.failure_policy, FailurePolicy::Open);
    }

    #[test]
    fn test_unknown_failure_policy_rejected() {
        let yaml = "failure_policy: sometimes\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = TurnstileConfig::from_file("turnstile.conf").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.toml", std::process::id()));
        fs::write(&path, "key_prefix = \"edge\"\nfailure_policy = \"open\"\n").unwrap();

        let config = TurnstileConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.key_prefix, "edge");
        assert_eq!(config.failure_policy, FailurePolicy::Open);
    }

    #[test]
    fn test_cache_key_prefix_forwarded() {
        let config = TurnstileConfig {
            backend: "redis-cache".to_string(),
            cache_key_prefix: Some("flask_cache_prefix".to_string()),
            ..TurnstileConfig::default()
        };
        let options = config.effective_backend_options();
        assert_eq!(options.get("cache_prefix"), Some("flask_cache_prefix"));
    }

    #[test]
    fn test_explicit_cache_prefix_option_wins() {
        let mut backend_options = BackendOptions::new();
        backend_options.insert("cache_prefix", "explicit");
        let config = TurnstileConfig {
            backend_options,
            cache_key_prefix: Some("ignored".to_string()),
            ..TurnstileConfig::default()
        };
        assert_eq!(
            config.effective_backend_options().get("cache_prefix"),
            Some("explicit")
        );
    }
}
