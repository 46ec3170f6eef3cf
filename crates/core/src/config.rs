use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the engine. Defaults match mainnet-style operation;
/// tests shrink the gas intervals to force frequent checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Upper bound on inbox entries staged into the machine per round.
    pub message_process_count: usize,
    /// Gas between durable checkpoints.
    pub min_gas_checkpoint_frequency: u64,
    /// Gas between entries of the basic machine cache.
    pub basic_machine_cache_interval: u64,
    pub basic_machine_cache_size: usize,
    pub lru_machine_cache_size: usize,
    pub timed_cache_expiration_seconds: u64,
    /// Replay-gas handicap applied to checkpoints loaded from disk when
    /// choosing a starting point.
    pub checkpoint_load_gas_cost: u64,
    /// Refuse execution-cursor requests that would replay more than this
    /// much gas. Zero disables the bound.
    pub checkpoint_max_execution_gas: u64,
    /// Rebuild the timed cache from recent checkpoints on startup.
    pub seed_cache_on_startup: bool,
    /// Skip warming the value cache when loading the core machine.
    pub lazy_load_core_machine: bool,
    /// Skip warming the value cache for archive (cursor) loads.
    pub lazy_load_archive_queries: bool,
    /// Seconds between whole-store disk snapshots; zero disables them.
    pub save_rocksdb_interval: u64,
    pub save_rocksdb_path: PathBuf,
    /// Number of independent log cursors (at most 255).
    pub logs_cursor_count: usize,
    /// Driver sleep when there is no work.
    pub idle_sleep_milliseconds: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            message_process_count: 10,
            min_gas_checkpoint_frequency: 1_000_000,
            basic_machine_cache_interval: 1_000_000,
            basic_machine_cache_size: 100,
            lru_machine_cache_size: 20,
            timed_cache_expiration_seconds: 20 * 60,
            checkpoint_load_gas_cost: 1_000_000,
            checkpoint_max_execution_gas: 250_000_000,
            seed_cache_on_startup: false,
            lazy_load_core_machine: false,
            lazy_load_archive_queries: true,
            save_rocksdb_interval: 0,
            save_rocksdb_path: PathBuf::from("db_checkpoints"),
            logs_cursor_count: 1,
            idle_sleep_milliseconds: 5,
        }
    }
}
