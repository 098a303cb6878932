//! Engine-wide tunables (§6). This is a plain struct with documented
//! defaults, not a config-file loader — reading a TOML/env file and
//! building an `EngineConfig` from it is the embedder's job.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// I/O retry count for writes and reads.
    pub max_retries: u32,
    /// Initial retry delay; backoff is linear (`retry_delay * attempt`).
    pub retry_delay: Duration,
    /// Writer concurrency cap (`writer_semaphore` permits).
    pub max_concurrent_operations: usize,
    /// Dead weak-ref sweep period for the decoded-block cache.
    pub cache_cleanup_interval: Duration,
    /// Soft cap on decoded-block cache entries before LRU eviction kicks in.
    pub max_cache_size: usize,
    /// Maintain the in-memory block-type -> offsets map built during scan.
    pub enable_block_type_indexing: bool,
    /// Run scheduled compaction in the background.
    pub enable_background_maintenance: bool,
    /// Background maintenance cycle period.
    pub maintenance_interval: Duration,
    /// Minimum file size before auto-compaction is considered.
    pub compaction_threshold_bytes: u64,
    /// Safety margin: a superseded block must be this old before deletion.
    pub min_age_hours_for_deletion: u32,
    /// Retained KeyManager block snapshots.
    pub key_manager_versions_to_keep: usize,
    /// Retained compaction backup files.
    pub backups_to_keep: usize,
    /// Overrides the adaptive batch-size sizer when set.
    pub block_size_threshold: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_concurrent_operations: 5,
            cache_cleanup_interval: Duration::from_secs(5 * 60),
            max_cache_size: 10_000,
            enable_block_type_indexing: true,
            enable_background_maintenance: true,
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            compaction_threshold_bytes: 1024 * 1024 * 1024,
            min_age_hours_for_deletion: 24,
            key_manager_versions_to_keep: 5,
            backups_to_keep: 3,
            block_size_threshold: None,
        }
    }
}

/// Adaptive `EmailBatch` target size, keyed by current database size (§4.6).
/// Bypassed when `EngineConfig::block_size_threshold` is set.
pub fn adaptive_batch_target(database_size_bytes: u64) -> u64 {
    const GB: u64 = 1024 * 1024 * 1024;
    if database_size_bytes < 5 * GB {
        50 * 1024 * 1024
    } else if database_size_bytes < 25 * GB {
        100 * 1024 * 1024
    } else if database_size_bytes < 100 * GB {
        250 * 1024 * 1024
    } else if database_size_bytes < 500 * GB {
        500 * 1024 * 1024
    } else {
        1024 * 1024 * 1024
    }
}
