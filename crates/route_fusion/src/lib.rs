//! Dependency-aware route execution over DataFusion.
//!
//! A route is a parameterized SQL body with typed parameters, an optional
//! cache policy and named dependencies on other routes. The executor binds
//! request parameters, resolves dependencies into table aliases, consults
//! the paged cache in `route_store`, runs the query on a miss, persists
//! the ordered result, and returns the requested row window.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use route_store::StoreConfig;

pub mod binder;
pub mod canonical;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod provider;
pub mod query;
pub mod registry;
mod resolver;
pub mod route;
pub mod value;

pub use binder::{redact_raw, CanonicalParameters, RawParams};
pub use canonical::{cache_key, invariant_tokens, CacheKey};
pub use engine::{DataFusionEngine, QueryEngine, QueryOutput, QuerySession};
pub use error::{ErrorKind, RouteError, Stage};
pub use executor::{CallRecord, ExecutionResult, RouteExecutor};
pub use metrics::{ExecutorMetrics, ExecutorMetricsSnapshot};
pub use provider::CachedPageTable;
pub use registry::RouteRegistry;
pub use resolver::CallStack;
pub use route::{
    ArgMapping, ArgSource, CachePolicy, Dependency, DependencyMode, InvariantFilter, ParamSpec,
    ParamType, RouteDefinition,
};
pub use value::Value;

/// Runtime configuration for one executor.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Root directory of the paged cache.
    pub cache_dir: PathBuf,
    /// TTL applied when a cache policy omits one.
    pub default_ttl: Duration,
    /// Rows per page applied when a cache policy omits one.
    pub default_rows_per_page: usize,
    /// Timeout for one request including its dependencies (`0` disables timeout).
    pub request_timeout: Duration,
    /// Maximum wait for an entry's manifest lock.
    pub lock_timeout: Duration,
    /// Age after which a manifest lock is considered abandoned.
    pub stale_lock_after: Duration,
    /// DataFusion target partitions per query session.
    pub target_partitions: usize,
}

impl ExecutorConfig {
    /// Defaults rooted at `cache_dir`.
    pub fn for_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            default_ttl: Duration::from_secs(3600),
            default_rows_per_page: 1024,
            request_timeout: Duration::ZERO,
            lock_timeout: Duration::from_millis(2000),
            stale_lock_after: Duration::from_secs(30),
            target_partitions: default_target_partitions(),
        }
    }

    /// Loads configuration from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let cache_dir = std::env::var("ROUTE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".route_cache"));
        let default_ttl_secs =
            parse_u64(std::env::var("ROUTE_CACHE_DEFAULT_TTL_SECS").ok(), 3600)?;
        let default_rows_per_page = parse_usize(
            std::env::var("ROUTE_CACHE_DEFAULT_ROWS_PER_PAGE").ok(),
            1024,
        )?
        .max(1);
        let request_timeout_ms = parse_u64(std::env::var("ROUTE_REQUEST_TIMEOUT_MS").ok(), 0)?;
        let lock_timeout_ms =
            parse_u64(std::env::var("ROUTE_CACHE_LOCK_TIMEOUT_MS").ok(), 2000)?;
        let stale_lock_secs = parse_u64(std::env::var("ROUTE_CACHE_STALE_LOCK_SECS").ok(), 30)?;
        let target_partitions = parse_usize(
            std::env::var("ROUTE_SQL_TARGET_PARTITIONS").ok(),
            default_target_partitions(),
        )?
        .max(1);

        Ok(Self {
            cache_dir,
            default_ttl: Duration::from_secs(default_ttl_secs),
            default_rows_per_page,
            request_timeout: Duration::from_millis(request_timeout_ms),
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            stale_lock_after: Duration::from_secs(stale_lock_secs),
            target_partitions,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Store settings derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(self.cache_dir.clone());
        config.lock_timeout = self.lock_timeout;
        config.stale_lock_after = self.stale_lock_after;
        config
    }
}

fn default_target_partitions() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1)
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
