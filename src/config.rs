//! Configuration for the coalescing cache
//!
//! `CacheConfig` is the validated configuration a cache is built from.
//! `Args` is the CLI surface (clap, with environment variable fallbacks)
//! that produces one.

use clap::{Parser, Subcommand, ValueEnum};

use crate::types::{CacheError, Result};

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default connect timeout for the backend
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Cache Configuration
// ============================================================================

/// Options passed through to the backend client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Redis connection URL
    pub redis_url: String,
    /// Connect timeout in milliseconds
    pub connection_timeout_ms: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

/// Configuration for a coalescing cache instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Expiry attached to every stored envelope (seconds). `None` = no expiry.
    pub ttl_seconds: Option<u64>,
    /// Also reset the expiry of keys that are read (requires `ttl_seconds`)
    pub refresh_ttl_on_read: bool,
    /// Namespace prepended to every backend key as `"{prefix}:{key}"`
    pub key_prefix: Option<String>,
    /// Backend connection options
    pub backend: BackendOptions,
}

impl CacheConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CACHE_TTL_SECONDS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.ttl_seconds = Some(secs);
            }
        }

        if let Ok(val) = std::env::var("CACHE_REFRESH_TTL_ON_READ") {
            config.refresh_ttl_on_read = matches!(val.as_str(), "1" | "true" | "yes");
        }

        if let Ok(val) = std::env::var("CACHE_KEY_PREFIX") {
            if !val.is_empty() {
                config.key_prefix = Some(val);
            }
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.backend.redis_url = val;
        }

        config
    }

    /// Set the expiry attached to stored envelopes
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// Set the backend key namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ttl_seconds == Some(0) {
            return Err(CacheError::Config(
                "ttl_seconds must be a positive integer".to_string(),
            ));
        }

        if self.refresh_ttl_on_read && self.ttl_seconds.is_none() {
            return Err(CacheError::Config(
                "refresh_ttl_on_read requires ttl_seconds".to_string(),
            ));
        }

        if let Some(prefix) = &self.key_prefix {
            if prefix.is_empty() {
                return Err(CacheError::Config("key_prefix must not be empty".to_string()));
            }
        }

        if self.backend.connection_timeout_ms == 0 {
            return Err(CacheError::Config(
                "connection_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Map a caller key to the key stored in the backend
    pub fn backend_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }
}

// ============================================================================
// CLI
// ============================================================================

/// Which backend the CLI talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Redis server at REDIS_URL
    Redis,
    /// In-process map (nothing persists between runs)
    Memory,
}

/// Coalescing cache - merge same-tick requests into one backend round trip
#[derive(Parser, Debug, Clone)]
#[command(name = "coalescing-cache")]
#[command(about = "Write-coalescing cache facade over a key-value backend")]
pub struct Args {
    /// Backend to use
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value = "redis")]
    pub backend: BackendKind,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Backend connect timeout in milliseconds
    #[arg(long, env = "REDIS_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECTION_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Expiry attached to every stored envelope, in seconds
    #[arg(long, env = "CACHE_TTL_SECONDS")]
    pub ttl_seconds: Option<u64>,

    /// Reset the expiry of keys on read
    #[arg(long, env = "CACHE_REFRESH_TTL_ON_READ", default_value = "false")]
    pub refresh_ttl_on_read: bool,

    /// Namespace prepended to every backend key
    #[arg(long, env = "CACHE_KEY_PREFIX")]
    pub key_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI operations
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Read a record
    Get { key: String },
    /// Write a record; VALUE is parsed as JSON
    Set {
        key: String,
        version: i64,
        value: String,
    },
    /// Delete a record
    Delete { key: String },
    /// Delete several records in one round trip
    DeleteBulk {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Issue COUNT mixed operations in one tick and report how they batched
    Burst {
        #[arg(default_value_t = 100)]
        count: usize,
    },
}

impl Args {
    /// Build the cache configuration these arguments describe
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_seconds: self.ttl_seconds,
            refresh_ttl_on_read: self.refresh_ttl_on_read,
            key_prefix: self.key_prefix.clone(),
            backend: BackendOptions {
                redis_url: self.redis_url.clone(),
                connection_timeout_ms: self.connect_timeout_ms,
            },
        }
    }
}
