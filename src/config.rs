//! Configuration management with environment variable support.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HLS_CONFORMANCE_CONCURRENCY` | Maximum pairs running at once during a full run | `4` |
//! | `HLS_CONFORMANCE_TIMEOUT_MS` | Deadline for one pair (ms) | `15000` |
//! | `HLS_CONFORMANCE_GRACE_MS` | Time a pair keeps playing before it passes (ms) | `500` |
//! | `HLS_CONFORMANCE_BASE_URL` | Base URL for relative manifest URIs | `http://127.0.0.1:8000/` |
//! | `HLS_CONFORMANCE_BACKENDS` | Enabled backends, comma-separated | `native,hls.js,shaka-player` |
//! | `HLS_CONFORMANCE_SESSION_DIR` | Base directory for run sessions | `/tmp/hls-conformance` |
//!
//! # Example
//!
//! ```bash
//! # Serve manifests from a local CDN and only test hls.js
//! export HLS_CONFORMANCE_BASE_URL="http://localhost:9000/"
//! export HLS_CONFORMANCE_BACKENDS="hls.js"
//! ```

use reqwest::Url;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::player::Backend;

// ============================================================================
// Default Values
// ============================================================================

/// Default concurrency limit for full runs
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default per-pair deadline (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Default grace delay between a successful play() and PASS (milliseconds)
pub const DEFAULT_GRACE_MS: u64 = 500;

/// Default base URL for relative manifests
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/";

/// Default enabled backends
pub const DEFAULT_BACKENDS: &str = "native,hls.js,shaka-player";

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/hls-conformance";

/// Path suffix identifying HLS playlists
pub const MANIFEST_EXTENSION: &str = ".m3u8";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_CONCURRENCY: &str = "HLS_CONFORMANCE_CONCURRENCY";
pub const ENV_TIMEOUT_MS: &str = "HLS_CONFORMANCE_TIMEOUT_MS";
pub const ENV_GRACE_MS: &str = "HLS_CONFORMANCE_GRACE_MS";
pub const ENV_BASE_URL: &str = "HLS_CONFORMANCE_BASE_URL";
pub const ENV_BACKENDS: &str = "HLS_CONFORMANCE_BACKENDS";
pub const ENV_SESSION_DIR: &str = "HLS_CONFORMANCE_SESSION_DIR";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error types for configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("unknown backend '{0}' (expected native, hls.js or shaka-player)")]
    UnknownBackend(String),

    #[error("no backends enabled")]
    NoBackends,
}

/// Centralized configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub runner: RunnerSettings,
    pub session: SessionSettings,
}

/// Raw runner settings as read from the environment
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub grace_ms: u64,
    pub base_url: String,
    pub backends: String,
}

/// Session-related settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            runner: RunnerSettings::from_env(),
            session: SessionSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            runner: RunnerSettings::defaults(),
            session: SessionSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl RunnerSettings {
    pub fn from_env() -> Self {
        Self {
            concurrency: env_parse(ENV_CONCURRENCY, DEFAULT_CONCURRENCY),
            timeout_ms: env_parse(ENV_TIMEOUT_MS, DEFAULT_TIMEOUT_MS),
            grace_ms: env_parse(ENV_GRACE_MS, DEFAULT_GRACE_MS),
            base_url: env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            backends: env::var(ENV_BACKENDS).unwrap_or_else(|_| DEFAULT_BACKENDS.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            grace_ms: DEFAULT_GRACE_MS,
            base_url: DEFAULT_BASE_URL.to_string(),
            backends: DEFAULT_BACKENDS.to_string(),
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_SESSION_DIR).unwrap_or_else(|_| DEFAULT_SESSION_DIR.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

/// Validated settings the orchestrator runs with
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum queued pairs running at once (at least 1)
    pub concurrency: usize,
    /// Deadline for one pair
    pub timeout: Duration,
    /// Playback time required after play() before a pair passes
    pub grace: Duration,
    /// Base for relative manifest URIs
    pub base_url: Url,
    /// Enabled backends, in dispatch order
    pub backends: Vec<Backend>,
}

impl RunnerConfig {
    /// Validate raw settings
    pub fn from_settings(settings: &RunnerSettings) -> ConfigResult<Self> {
        Ok(Self {
            concurrency: settings.concurrency.max(1),
            timeout: Duration::from_millis(settings.timeout_ms),
            grace: Duration::from_millis(settings.grace_ms),
            base_url: parse_base_url(&settings.base_url)?,
            backends: parse_backends(&settings.backends)?,
        })
    }

    /// Built-in defaults, ignoring the environment
    pub fn defaults() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL should parse"),
            backends: Backend::ALL.to_vec(),
        }
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Backend>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse a base URL, making sure relative joins land inside it
pub fn parse_base_url(raw: &str) -> ConfigResult<Url> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a comma-separated backend list, dropping duplicates and keeping order
pub fn parse_backends(raw: &str) -> ConfigResult<Vec<Backend>> {
    let mut backends = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let backend: Backend = part
            .parse()
            .map_err(|_| ConfigError::UnknownBackend(part.to_string()))?;
        if !backends.contains(&backend) {
            backends.push(backend);
        }
    }
    if backends.is_empty() {
        return Err(ConfigError::NoBackends);
    }
    Ok(backends)
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> String {
    get().session.base_dir.clone()
}
