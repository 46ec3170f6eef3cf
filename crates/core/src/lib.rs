//! # arbrex core
//!
//! The checkpointed execution engine: ingests sequencer batch items and
//! delayed messages, replays them through the deterministic machine,
//! persists gas-indexed checkpoints, and serves historical queries with
//! reorg-safe semantics.
//!
//! ## Structure
//!
//! - [`ArbCore`]: the engine. One driver thread advances the machine; all
//!   readers work against storage snapshots.
//! - `inbox`: accumulator-chained message log with forced-reorg detection.
//! - `checkpoint`: gas-indexed machine persistence and reorg rollback.
//! - `cache`: basic / LRU / timed machine snapshot tiers.
//! - `logs_cursor`: subscribers notified of both inserted and deleted logs.
//! - `execution`: resumable historical replay handles.
//!
//! ## Threading
//!
//! Exactly one driver thread (spawned by [`ArbCore::start_thread`]) owns
//! machine progress and every write. Producers hand message batches through
//! a single-slot handoff; consumers read under snapshot transactions and
//! never block the driver.

mod cache;
mod checkpoint;
mod config;
mod db;
mod driver;
mod emissions;
mod error;
mod execution;
mod inbox;
mod logs_cursor;
mod values;

pub use config::CoreConfig;
pub use driver::MessageStatus;
pub use error::CoreError;
pub use execution::ExecutionCursor;
pub use logs_cursor::{LogsCursorLogs, LogsCursorStatus};
pub use values::ValueCache;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

use ethereum_types::U256;
use tracing::{error, info};

use arbrex_common::types::MachineOutput;
use arbrex_common::wire::u256_bytes;
use arbrex_storage::Store;
use arbrex_storage::api::tables::CHECKPOINT;
use arbrex_storage::api::{ReadView, WriteTransaction};
use arbrex_vm::{CoreCode, Executable, Machine};

use crate::cache::CombinedMachineCache;
use crate::driver::MessageData;
use crate::logs_cursor::LogsCursor;

/// The rollup execution and persistence engine.
///
/// Constructed over a [`Store`], initialized from an [`Executable`], then
/// driven by a single background thread. All public operations are safe to
/// call from any thread.
pub struct ArbCore {
    config: CoreConfig,
    store: Store,
    code: Arc<CoreCode>,

    /// The machine the driver advances. Only the driver (and pre-thread
    /// initialization) locks this for long stretches.
    core_machine: Mutex<Option<Machine>>,
    /// Snapshot of the machine at its last pause, for cheap reads.
    last_machine: RwLock<Option<Machine>>,
    machine_cache: Mutex<CombinedMachineCache>,
    logs_cursors: Vec<LogsCursor>,

    message_slot: Mutex<Option<MessageData>>,
    message_status: AtomicU8,
    message_error: Mutex<String>,

    machine_idle: AtomicBool,
    abort_flag: AtomicBool,
    machine_error: AtomicBool,
    machine_error_string: Mutex<String>,

    save_checkpoint_flag: AtomicBool,
    save_checkpoint_error: Mutex<Option<String>>,

    /// Serializes slow-path checkpoint loads done by execution cursors
    /// against reorg deletions.
    core_reorg_mutex: Mutex<()>,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ArbCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbCore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ArbCore {
    pub fn new(store: Store, config: CoreConfig) -> Result<Self, CoreError> {
        if config.logs_cursor_count > 255 {
            return Err(CoreError::UserLogic(
                "too many logs cursors (max 255)".into(),
            ));
        }
        let next_segment_id = {
            let view = store.begin_read()?;
            values::next_segment_id(view.as_ref())?
        };
        let machine_cache = CombinedMachineCache::new(
            config.basic_machine_cache_size,
            config.lru_machine_cache_size,
            config.timed_cache_expiration_seconds,
            config.checkpoint_load_gas_cost,
            config.checkpoint_max_execution_gas,
        );
        let logs_cursors = (0..config.logs_cursor_count.max(1))
            .map(|_| LogsCursor::new())
            .collect();
        Ok(Self {
            config,
            store,
            code: Arc::new(CoreCode::new(next_segment_id)),
            core_machine: Mutex::new(None),
            last_machine: RwLock::new(None),
            machine_cache: Mutex::new(machine_cache),
            logs_cursors,
            message_slot: Mutex::new(None),
            message_status: AtomicU8::new(MessageStatus::Empty as u8),
            message_error: Mutex::new(String::new()),
            machine_idle: AtomicBool::new(false),
            abort_flag: AtomicBool::new(false),
            machine_error: AtomicBool::new(false),
            machine_error_string: Mutex::new(String::new()),
            save_checkpoint_flag: AtomicBool::new(false),
            save_checkpoint_error: Mutex::new(None),
            core_reorg_mutex: Mutex::new(()),
            thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn code(&self) -> &Arc<CoreCode> {
        &self.code
    }

    pub(crate) fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Brings the engine to a runnable state: verifies the schema, reloads
    /// the newest usable checkpoint (seeding caches when configured), or
    /// boots a fresh database from the executable.
    pub fn initialize(&self, executable: Executable) -> Result<(), CoreError> {
        {
            let view = self.store.begin_read()?;
            match db::state_get_u256(view.as_ref(), &db::SCHEMA_VERSION_KEY)? {
                Some(version) => {
                    if version != U256::from(db::SCHEMA_VERSION) {
                        error!(
                            "Database version {version} does not match expected version {}, \
                             delete database and try again",
                            db::SCHEMA_VERSION
                        );
                        return Err(CoreError::Corruption(format!(
                            "schema version {version} != {}, delete database and try again",
                            db::SCHEMA_VERSION
                        )));
                    }
                }
                None => {
                    if db::state_get_u256(view.as_ref(), &db::LOG_INSERTED_KEY)?.is_some() {
                        // Populated database predating schema versions.
                        error!("Database has no schema version, delete database and try again");
                        return Err(CoreError::Corruption(
                            "missing schema version, delete database and try again".into(),
                        ));
                    }
                }
            }
        }

        let mut cache = ValueCache::new(1);
        let reloaded = if self.config.seed_cache_on_startup {
            let expired = self.lock(&self.machine_cache).expired_timestamp();
            self.reorg_to_timestamp_or_before(expired, true, &mut cache)?
        } else {
            self.reorg_to_last_message(&mut cache)?
        };
        if reloaded {
            return Ok(());
        }

        // Fresh database: boot the genesis machine and persist it.
        info!("Initializing database from scratch");
        let segment = self.code.add_segment(executable.instructions);
        let machine = Machine::new(
            Arc::clone(&self.code),
            segment.segment_id,
            executable.static_val,
        );

        let mut tx = self.store.begin_write()?;
        db::state_put_u256(
            tx.as_mut(),
            &db::SCHEMA_VERSION_KEY,
            U256::from(db::SCHEMA_VERSION),
        )?;
        self.save_checkpoint_tx(tx.as_mut(), &machine)?;
        db::state_put_u256(tx.as_mut(), &db::LOG_INSERTED_KEY, U256::zero())?;
        db::state_put_u256(tx.as_mut(), &db::SEND_INSERTED_KEY, U256::zero())?;
        for cursor_index in 0..self.logs_cursors.len() {
            db::state_put_u256(
                tx.as_mut(),
                &db::logs_cursor_current_key(cursor_index),
                U256::zero(),
            )?;
        }
        tx.commit()?;

        self.lock(&self.machine_cache).basic_add(machine.clone());
        *self
            .last_machine
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(machine.clone());
        *self.lock(&self.core_machine) = Some(machine);
        Ok(())
    }

    /// Whether the database holds the genesis checkpoint.
    pub fn initialized(&self) -> Result<bool, CoreError> {
        let view = self.store.begin_read()?;
        Ok(view.get(CHECKPOINT, &u256_bytes(U256::zero()))?.is_some())
    }

    pub fn machine_idle(&self) -> bool {
        self.machine_idle.load(Ordering::Acquire)
    }

    /// Copy of the machine at its last pause.
    pub fn get_last_machine(&self) -> Option<Machine> {
        self.last_machine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get_last_machine_output(&self) -> Option<MachineOutput> {
        self.last_machine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|machine| machine.output().clone())
    }

    /// How many inbox entries the machine has fully processed.
    pub fn machine_messages_read(&self) -> U256 {
        self.get_last_machine_output()
            .map(|output| output.fully_processed_inbox.count)
            .unwrap_or_default()
    }

    /// Takes the latched driver failure, if any.
    pub fn machine_clear_error(&self) -> Option<String> {
        if !self.machine_error.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut message = self.lock(&self.machine_error_string);
        Some(std::mem::take(&mut *message))
    }

    pub(crate) fn latch_machine_error(&self, message: String) {
        error!("{message}");
        *self.lock(&self.machine_error_string) = message;
        self.machine_error.store(true, Ordering::Release);
    }

    pub(crate) fn update_last_machine(&self, machine: &Machine) {
        *self
            .last_machine
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(machine.clone());
    }

    pub fn log_inserted_count(&self) -> Result<U256, CoreError> {
        let view = self.store.begin_read()?;
        db::state_require_u256(view.as_ref(), &db::LOG_INSERTED_KEY)
    }

    pub fn send_inserted_count(&self) -> Result<U256, CoreError> {
        let view = self.store.begin_read()?;
        db::state_require_u256(view.as_ref(), &db::SEND_INSERTED_KEY)
    }

    pub fn log_processed_count(&self) -> Result<U256, CoreError> {
        let view = self.store.begin_read()?;
        Ok(db::state_get_u256(view.as_ref(), &db::LOG_PROCESSED_KEY)?.unwrap_or_default())
    }

    pub fn update_log_processed_count(&self, count: U256) -> Result<(), CoreError> {
        let mut tx = self.store.begin_write()?;
        db::state_put_u256(tx.as_mut(), &db::LOG_PROCESSED_KEY, count)?;
        tx.commit()?;
        Ok(())
    }

    pub fn send_processed_count(&self) -> Result<U256, CoreError> {
        let view = self.store.begin_read()?;
        Ok(db::state_get_u256(view.as_ref(), &db::SEND_PROCESSED_KEY)?.unwrap_or_default())
    }

    pub fn update_send_processed_count(&self, count: U256) -> Result<(), CoreError> {
        let mut tx = self.store.begin_write()?;
        db::state_put_u256(tx.as_mut(), &db::SEND_PROCESSED_KEY, count)?;
        tx.commit()?;
        Ok(())
    }
}
