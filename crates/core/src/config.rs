//! Storage engine configuration
//!
//! All tunables live in one struct with builder-style setters. The
//! environment constructor maps the deployment knobs (`CONFIG_*`
//! variables) onto the same fields; unset or unparsable variables keep
//! their defaults.

use std::path::PathBuf;

/// Upper bound for the replication redundancy factor.
pub const MAX_REDUNDANCY: usize = 8;

const MIB: u64 = 1024 * 1024;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the storage description file.
    pub storage_path: PathBuf,
    /// Chunk cache budget in bytes.
    pub cache_size: u64,
    /// Number of extra replicas per chunk (0..=8, must be < #instances).
    pub redundancy: usize,
    /// When false, a primary write waits for all replica acks.
    pub async_replication: bool,
    /// Capacity of each outbound replication queue.
    pub replication_send_queue_size: usize,
    /// Capacity of each inbound replication queue.
    pub replication_receive_queue_size: usize,
    /// When true, cache overruns block instead of exceeding the budget.
    pub strict_cache_limit: bool,
    /// Log I/O operations slower than this many milliseconds; `None`
    /// disables the slow-I/O log.
    pub io_log_threshold_ms: Option<u64>,
    /// Per-attribute prefetch capacity in the scatter-gather receive path.
    pub sg_receive_queue_size: usize,
    /// Liveness aging in seconds.
    pub liveness_timeout_s: u64,
    /// When false, duplicate chunk addresses found at open are tolerated
    /// (first entry wins) instead of failing the open.
    pub enforce_data_integrity: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            storage_path: PathBuf::from("storage.cfg"),
            cache_size: 256 * MIB,
            redundancy: 0,
            async_replication: false,
            replication_send_queue_size: 16,
            replication_receive_queue_size: 16,
            strict_cache_limit: false,
            io_log_threshold_ms: None,
            sg_receive_queue_size: 8,
            liveness_timeout_s: 120,
            enforce_data_integrity: true,
        }
    }
}

impl StorageConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from `CONFIG_*` environment variables, starting
    /// from defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(path) = env_var("CONFIG_STORAGE") {
            cfg.storage_path = PathBuf::from(path);
        }
        if let Some(mb) = env_parse::<u64>("CONFIG_SMGR_CACHE_SIZE") {
            cfg.cache_size = mb * MIB;
        }
        if let Some(r) = env_parse::<usize>("CONFIG_REDUNDANCY") {
            cfg.redundancy = r.min(MAX_REDUNDANCY);
        }
        if let Some(b) = env_parse::<bool>("CONFIG_ASYNC_REPLICATION") {
            cfg.async_replication = b;
        }
        if let Some(n) = env_parse::<usize>("CONFIG_REPLICATION_SEND_QUEUE_SIZE") {
            cfg.replication_send_queue_size = n;
        }
        if let Some(n) = env_parse::<usize>("CONFIG_REPLICATION_RECEIVE_QUEUE_SIZE") {
            cfg.replication_receive_queue_size = n;
        }
        if let Some(b) = env_parse::<bool>("CONFIG_STRICT_CACHE_LIMIT") {
            cfg.strict_cache_limit = b;
        }
        if let Some(ms) = env_parse::<i64>("CONFIG_IO_LOG_THRESHOLD") {
            cfg.io_log_threshold_ms = (ms >= 0).then_some(ms as u64);
        }
        if let Some(n) = env_parse::<usize>("CONFIG_SG_RECEIVE_QUEUE_SIZE") {
            cfg.sg_receive_queue_size = n;
        }
        if let Some(s) = env_parse::<u64>("CONFIG_LIVENESS_TIMEOUT") {
            cfg.liveness_timeout_s = s;
        }
        cfg
    }

    /// Set the storage description file path.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Set the cache budget in bytes.
    pub fn with_cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Set the redundancy factor, clamped to [`MAX_REDUNDANCY`].
    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        self.redundancy = redundancy.min(MAX_REDUNDANCY);
        self
    }

    /// Enable or disable waiting for replica acks on the primary.
    pub fn with_async_replication(mut self, asynchronous: bool) -> Self {
        self.async_replication = asynchronous;
        self
    }

    /// Set the outbound replication queue capacity.
    pub fn with_replication_send_queue_size(mut self, size: usize) -> Self {
        self.replication_send_queue_size = size;
        self
    }

    /// Enable or disable the strict cache limit.
    pub fn with_strict_cache_limit(mut self, strict: bool) -> Self {
        self.strict_cache_limit = strict;
        self
    }

    /// Set the slow-I/O logging threshold.
    pub fn with_io_log_threshold_ms(mut self, threshold: Option<u64>) -> Self {
        self.io_log_threshold_ms = threshold;
        self
    }

    /// Set duplicate-address tolerance at open.
    pub fn with_enforce_data_integrity(mut self, enforce: bool) -> Self {
        self.enforce_data_integrity = enforce;
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name)?.parse().ok()
}
