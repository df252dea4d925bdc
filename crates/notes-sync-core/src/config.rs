//! Layered engine configuration: documented defaults, overridable by
//! environment variables, constructible directly for tests.

use std::time::Duration;

/// Environment variable overriding the default storage directory (tests only).
pub const ENV_TEST_STORAGE_DIR: &str = "TEST_STORAGE_DIR";
/// Environment variable overriding the auto-minted instance id (tests only).
pub const ENV_INSTANCE_ID: &str = "INSTANCE_ID";
/// Environment variable enabling verbose comment-observer logging.
pub const ENV_DEBUG_COMMENT_SYNC: &str = "DEBUG_COMMENT_SYNC";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the packing scheduler runs per SD.
    pub packing_interval: Duration,
    /// How often the GC scheduler runs per SD.
    pub gc_interval: Duration,
    /// How often the CRDT Manager re-checks snapshot thresholds on idle notes.
    pub snapshot_check_interval: Duration,
    /// Window after opening an SD during which watcher events are buffered.
    pub startup_grace_period: Duration,
    /// Maximum retry attempts for `IoTransient` failures.
    pub io_retry_attempts: u32,
    /// Maximum retry attempts before a sequence gap becomes a stale-sync entry.
    pub stale_sync_retry_attempts: u32,
    /// Minimum contiguous eligible records before a pack is built.
    pub min_pack_run_len: usize,
    /// Minimum age of a record before it is eligible for packing.
    pub pack_eligibility_age: Duration,
    /// Number of most-recent unpacked records that packing always leaves behind.
    pub pack_tail_reserve: usize,
    /// How many most-recent snapshots GC always retains.
    pub gc_retained_snapshots: usize,
    /// Debounce window for coalescing duplicate watcher events.
    pub watch_debounce: Duration,
    /// Debounce window for comment-observer event emission.
    pub comment_debounce: Duration,
    /// Size threshold that rotates a `.crdtlog` file.
    pub update_log_rotate_bytes: u64,
    /// Whether comment-sync debug logging is enabled.
    pub debug_comment_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            packing_interval: Duration::from_secs(5 * 60),
            gc_interval: Duration::from_secs(30 * 60),
            snapshot_check_interval: Duration::from_secs(10 * 60),
            startup_grace_period: Duration::from_secs(20),
            io_retry_attempts: 3,
            stale_sync_retry_attempts: 5,
            min_pack_run_len: 10,
            pack_eligibility_age: Duration::from_secs(5 * 60),
            pack_tail_reserve: 50,
            gc_retained_snapshots: 2,
            watch_debounce: Duration::from_millis(50),
            comment_debounce: Duration::from_millis(100),
            update_log_rotate_bytes: 4 * 1024 * 1024,
            debug_comment_sync: false,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overridden by recognised environment
    /// variables. `TEST_STORAGE_DIR`/`INSTANCE_ID` are read by callers that
    /// construct the SD Router, not by this struct; only flags that tune
    /// engine behavior live here.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if std::env::var(ENV_DEBUG_COMMENT_SYNC).as_deref() == Ok("1") {
            cfg.debug_comment_sync = true;
        }
        cfg
    }

    /// Fast-cycling config for tests: short intervals so scheduler logic can
    /// be exercised without waiting on real-world durations.
    pub fn for_tests() -> Self {
        Self {
            packing_interval: Duration::from_millis(50),
            gc_interval: Duration::from_millis(100),
            snapshot_check_interval: Duration::from_millis(20),
            startup_grace_period: Duration::from_millis(0),
            stale_sync_retry_attempts: 3,
            watch_debounce: Duration::from_millis(1),
            comment_debounce: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals_follow_documented_guidance() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.packing_interval, Duration::from_secs(300));
        assert_eq!(cfg.gc_interval, Duration::from_secs(1800));
        assert_eq!(cfg.min_pack_run_len, 10);
    }

    #[test]
    fn test_config_has_tighter_timings() {
        let cfg = EngineConfig::for_tests();
        assert!(cfg.packing_interval < EngineConfig::default().packing_interval);
    }
}
