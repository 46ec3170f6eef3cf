//! The driver: one long-running thread that ingests delivered messages,
//! advances the machine, persists assertions, and checkpoints.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethereum_types::{H256, U256};
use tracing::{error, info, warn};

use arbrex_storage::api::WriteTransaction;
use arbrex_vm::{Machine, MachineExecutionConfig, MachineRunStatus};

use crate::ArbCore;
use crate::error::CoreError;
use crate::values::ValueCache;

/// State of the single-slot producer→driver handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    Empty = 0,
    Ready = 1,
    Success = 2,
    Error = 3,
}

impl MessageStatus {
    fn from_u8(byte: u8) -> Self {
        match byte {
            1 => Self::Ready,
            2 => Self::Success,
            3 => Self::Error,
            _ => Self::Empty,
        }
    }
}

/// One delivered batch, exactly as handed to `deliver_messages`.
#[derive(Debug, Default)]
pub(crate) struct MessageData {
    pub previous_message_count: U256,
    pub previous_batch_acc: H256,
    pub sequencer_batch_items: Vec<Vec<u8>>,
    pub delayed_messages: Vec<Vec<u8>>,
    pub reorg_batch_items: Option<U256>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ArbCore {
    /// Hands a batch to the driver. Accepted only when the slot is empty;
    /// a `false` return means the previous delivery is still in flight.
    pub fn deliver_messages(
        &self,
        previous_message_count: U256,
        previous_batch_acc: H256,
        sequencer_batch_items: Vec<Vec<u8>>,
        delayed_messages: Vec<Vec<u8>>,
        reorg_batch_items: Option<U256>,
    ) -> bool {
        let mut slot = self.lock(&self.message_slot);
        if self.message_status.load(Ordering::Acquire) != MessageStatus::Empty as u8 {
            return false;
        }
        *slot = Some(MessageData {
            previous_message_count,
            previous_batch_acc,
            sequencer_batch_items,
            delayed_messages,
            reorg_batch_items,
        });
        self.message_status.store(MessageStatus::Ready as u8, Ordering::Release);
        true
    }

    /// Current slot state. Reading a `Success` consumes it.
    pub fn messages_status(&self) -> MessageStatus {
        let current = MessageStatus::from_u8(self.message_status.load(Ordering::Acquire));
        if current != MessageStatus::Error && current != MessageStatus::Ready {
            self.message_status
                .store(MessageStatus::Empty as u8, Ordering::Release);
        }
        current
    }

    /// Takes the delivery error, resetting the slot.
    pub fn messages_clear_error(&self) -> String {
        if self.message_status.load(Ordering::Acquire) != MessageStatus::Error as u8 {
            return String::new();
        }
        self.message_status
            .store(MessageStatus::Empty as u8, Ordering::Release);
        std::mem::take(&mut self.lock(&self.message_error))
    }

    /// Spawns the driver thread. Returns `false` if it is already running.
    pub fn start_thread(self: &Arc<Self>) -> bool {
        let mut thread_slot = self.lock(&self.thread);
        if thread_slot.is_some() {
            return false;
        }
        self.abort_flag.store(false, Ordering::Release);
        let core = Arc::clone(self);
        match thread::Builder::new()
            .name("arbcore".into())
            .spawn(move || core.run_core_loop())
        {
            Ok(handle) => {
                *thread_slot = Some(handle);
                true
            }
            Err(err) => {
                error!("Failed to spawn core thread: {err}");
                false
            }
        }
    }

    /// Requests cooperative termination and joins the driver thread.
    pub fn abort_thread(&self) {
        warn!("Aborting main ArbCore thread");
        let handle = self.lock(&self.thread).take();
        if let Some(handle) = handle {
            self.abort_flag.store(true, Ordering::Release);
            let _ = handle.join();
        }
        self.abort_flag.store(false, Ordering::Release);
    }

    /// Blocks until the driver saves a checkpoint. Unit-test hook; polls a
    /// flag because the documented contract is "blocks until saved".
    pub fn trigger_save_checkpoint(&self) -> Result<(), CoreError> {
        info!("Triggering checkpoint save");
        self.save_checkpoint_flag.store(true, Ordering::Release);
        while self.save_checkpoint_flag.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(10));
        }
        info!("Checkpoint saved");
        match self.lock(&self.save_checkpoint_error).take() {
            None => Ok(()),
            Some(message) => Err(CoreError::Machine(message)),
        }
    }

    /// Diagnostic hook. Without a cross-thread signal mechanism the best we
    /// can report is the driver's presence.
    pub fn print_core_thread_backtrace(&self) {
        if self.lock(&self.thread).is_some() {
            warn!("Core thread is running; backtrace capture not supported");
        } else {
            warn!("Core thread backtrace not available");
        }
    }

    /// Stages up to `max_messages` inbox entries into the machine and runs
    /// it. Returns `false` (and flags idle) when the machine is caught up.
    pub(crate) fn run_machine_with_messages(
        &self,
        machine: &mut Machine,
        mut config: MachineExecutionConfig,
        max_messages: usize,
    ) -> Result<bool, CoreError> {
        let inbox = machine.output().fully_processed_inbox;
        let messages = {
            let view = self.store().begin_read()?;
            self.read_next_messages(view.as_ref(), &inbox, max_messages)?
                .ok_or_else(|| {
                    CoreError::Corruption("inbox diverged beneath the running machine".into())
                })?
        };
        if messages.is_empty() {
            self.machine_idle.store(true, Ordering::Release);
            return Ok(false);
        }
        config.inbox_messages = messages;
        machine.run_machine(config);
        Ok(true)
    }

    fn run_core_loop(&self) {
        let mut cache = ValueCache::new(5);
        let checkpoint_frequency = U256::from(self.config().min_gas_checkpoint_frequency);
        let basic_cache_interval = U256::from(self.config().basic_machine_cache_interval);

        let mut next_rocksdb_save_timestamp = 0u64;
        if self.config().save_rocksdb_interval > 0 {
            next_rocksdb_save_timestamp = unix_now() + self.config().save_rocksdb_interval;
            if let Err(err) = std::fs::create_dir_all(&self.config().save_rocksdb_path) {
                error!("Unable to create rocksdb save directory: {err}");
            }
        }

        let (mut next_checkpoint_gas, mut next_basic_cache_gas) = match self.max_checkpoint_gas()
        {
            Ok(gas) => (gas + checkpoint_frequency, gas + basic_cache_interval),
            Err(err) => {
                self.latch_machine_error(format!("failed reading checkpoint gas: {err}"));
                return;
            }
        };

        while !self.abort_flag.load(Ordering::Acquire) {
            let tick = self.core_loop_tick(
                &mut cache,
                &mut next_checkpoint_gas,
                &mut next_basic_cache_gas,
                &mut next_rocksdb_save_timestamp,
            );
            match tick {
                Ok(()) => {}
                Err(err) => {
                    self.latch_machine_error(format!("core thread failed: {err}"));
                    break;
                }
            }
        }

        info!("Exiting main ArbCore thread");
        if let Some(machine) = self.lock(&self.core_machine).as_mut() {
            machine.abort();
        }
        self.abort_logs_cursors();
    }

    pub(crate) fn core_loop_tick(
        &self,
        cache: &mut ValueCache,
        next_checkpoint_gas: &mut U256,
        next_basic_cache_gas: &mut U256,
        next_rocksdb_save_timestamp: &mut u64,
    ) -> Result<(), CoreError> {
        let checkpoint_frequency = U256::from(self.config().min_gas_checkpoint_frequency);

        // The machine must still agree with the message log; a divergence
        // here means messages were torn out from under it.
        let machine_valid = {
            let machine_slot = self.lock(&self.core_machine);
            let Some(machine) = machine_slot.as_ref() else {
                return Err(CoreError::Corruption(
                    "core thread started before initialization".into(),
                ));
            };
            let view = self.store().begin_read()?;
            self.is_valid(view.as_ref(), &machine.output().fully_processed_inbox)?
        };
        if !machine_valid {
            error!("Core thread operating on invalid machine. Rolling back.");
            self.reorg_to_message_count_or_before(U256::zero(), false, cache)?;
            *next_checkpoint_gas = checkpoint_frequency;
        }

        if self.message_status.load(Ordering::Acquire) == MessageStatus::Ready as u8 {
            let data = self.lock(&self.message_slot).take();
            if let Some(data) = data {
                match self.add_messages(&data, cache) {
                    Ok(reorged_gas) => {
                        self.machine_idle.store(false, Ordering::Release);
                        self.message_status
                            .store(MessageStatus::Success as u8, Ordering::Release);
                        if let Some(gas) = reorged_gas {
                            *next_checkpoint_gas = gas + checkpoint_frequency;
                        }
                    }
                    Err(err) => {
                        error!("ArbCore addMessages error: {err}");
                        *self.lock(&self.message_error) = err.to_string();
                        self.message_status
                            .store(MessageStatus::Error as u8, Ordering::Release);
                    }
                }
            }
        }

        let status = self
            .lock(&self.core_machine)
            .as_ref()
            .map(|machine| machine.status())
            .unwrap_or(MachineRunStatus::None);
        match status {
            MachineRunStatus::Error => {
                let message = self
                    .lock(&self.core_machine)
                    .as_ref()
                    .map(|machine| machine.error_string().to_string())
                    .unwrap_or_default();
                return Err(CoreError::Machine(message));
            }
            MachineRunStatus::Success => {
                self.handle_machine_success(
                    cache,
                    next_checkpoint_gas,
                    next_basic_cache_gas,
                    next_rocksdb_save_timestamp,
                )?;
            }
            MachineRunStatus::Aborted => {
                if let Some(machine) = self.lock(&self.core_machine).as_mut() {
                    machine.clear_error();
                }
            }
            MachineRunStatus::None | MachineRunStatus::Running => {}
        }

        let status = self
            .lock(&self.core_machine)
            .as_ref()
            .map(|machine| machine.status())
            .unwrap_or(MachineRunStatus::None);
        if status == MachineRunStatus::None {
            let mut machine_slot = self.lock(&self.core_machine);
            if let Some(machine) = machine_slot.as_mut() {
                let config = MachineExecutionConfig {
                    stop_on_sideload: true,
                    ..Default::default()
                };
                self.run_machine_with_messages(
                    machine,
                    config,
                    self.config().message_process_count,
                )?;
            }
        }

        for cursor_index in 0..self.logs_cursors.len() {
            if self.logs_cursor_is_requested(cursor_index) {
                self.handle_logs_cursor_requested(cursor_index, cache)?;
            }
        }

        if self.save_checkpoint_flag.load(Ordering::Acquire) {
            let result = (|| -> Result<(), CoreError> {
                let machine_slot = self.lock(&self.core_machine);
                let Some(machine) = machine_slot.as_ref() else {
                    return Err(CoreError::Corruption("no machine to checkpoint".into()));
                };
                let mut tx = self.store().begin_write()?;
                self.save_checkpoint_tx(tx.as_mut(), machine)?;
                tx.commit()?;
                Ok(())
            })();
            *self.lock(&self.save_checkpoint_error) = result.err().map(|err| err.to_string());
            self.save_checkpoint_flag.store(false, Ordering::Release);
        }

        if self.machine_idle()
            && self.message_status.load(Ordering::Acquire) != MessageStatus::Ready as u8
        {
            thread::sleep(Duration::from_millis(self.config().idle_sleep_milliseconds));
        }
        Ok(())
    }

    /// Collects the machine's assertion, persists it, and checkpoints when
    /// enough gas has passed since the last durable snapshot.
    fn handle_machine_success(
        &self,
        cache: &mut ValueCache,
        next_checkpoint_gas: &mut U256,
        next_basic_cache_gas: &mut U256,
        next_rocksdb_save_timestamp: &mut u64,
    ) -> Result<(), CoreError> {
        let checkpoint_frequency = U256::from(self.config().min_gas_checkpoint_frequency);
        let basic_cache_interval = U256::from(self.config().basic_machine_cache_interval);

        let mut machine_slot = self.lock(&self.core_machine);
        let Some(machine) = machine_slot.as_mut() else {
            return Err(CoreError::Corruption("machine disappeared mid-run".into()));
        };

        let mut tx = self.store().begin_write()?;
        let assertion = machine.next_assertion();
        self.update_last_machine(machine);

        let gas = machine.output().arb_gas_used;
        if gas > *next_basic_cache_gas {
            self.lock(&self.machine_cache).basic_add(machine.clone());
            *next_basic_cache_gas = gas + basic_cache_interval;
        }

        self.save_assertion(tx.as_mut(), &assertion, gas)?;

        if let Some(sideload_block) = assertion.sideload_block_number {
            self.lock(&self.machine_cache).timed_add(machine.clone());

            if gas >= *next_checkpoint_gas {
                self.save_checkpoint_tx(tx.as_mut(), machine)?;
                *next_checkpoint_gas = gas + checkpoint_frequency;
                info!(
                    "Last checkpoint gas used: {gas}, L1 block: {}, L2 block: {sideload_block}",
                    machine.output().l1_block_number
                );
                cache.next_cache();

                if *next_rocksdb_save_timestamp != 0 {
                    let current_seconds = unix_now();
                    if current_seconds >= *next_rocksdb_save_timestamp {
                        let checkpoint_dir = self
                            .config()
                            .save_rocksdb_path
                            .join(current_seconds.to_string());
                        match self.store().checkpoint_to(&checkpoint_dir) {
                            Ok(()) => {
                                let elapsed = unix_now() - current_seconds;
                                info!(
                                    "Saved store snapshot into {} in {elapsed}s",
                                    checkpoint_dir.display()
                                );
                            }
                            Err(err) => {
                                error!(
                                    "Unable to save store snapshot into {}: {err}",
                                    checkpoint_dir.display()
                                );
                            }
                        }
                        *next_rocksdb_save_timestamp =
                            current_seconds + self.config().save_rocksdb_interval;
                    }
                }
            }

            // The machine paused to surface the sideload; pick the run back
            // up where it stopped.
            machine.continue_running_machine();
        }

        tx.commit()?;
        Ok(())
    }
}
