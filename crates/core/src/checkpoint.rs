//! Gas-indexed checkpoint store and reorg rollback.
//!
//! Checkpoints bind `arb_gas_used` to machine state keys whose components
//! live in the value store. Reorgs walk the checkpoint column newest to
//! oldest, delete what no longer matches the inbox, and replay the machine
//! forward to the surviving position.

use ethereum_types::{H256, U256};
use tracing::{error, info};

use arbrex_common::types::{CheckpointVariant, MachineOutput, MachineStateKeys};
use arbrex_common::wire::u256_bytes;
use arbrex_storage::api::tables::CHECKPOINT;
use arbrex_storage::api::{ReadView, WriteTransaction};
use arbrex_vm::{Machine, MachineExecutionConfig, MachineRunStatus, MachineState, Value};

use crate::ArbCore;
use crate::cache::CacheLookup;
use crate::db;
use crate::error::CoreError;
use crate::values::{self, ValueCache};

impl ArbCore {
    /// Persists the machine under its gas position: every referenced value
    /// and code segment goes to the value store (bumping refcounts), then
    /// the state keys are written as a full checkpoint.
    pub(crate) fn save_checkpoint_tx(
        &self,
        tx: &mut dyn WriteTransaction,
        machine: &Machine,
    ) -> Result<(), CoreError> {
        let output = machine.output();
        if !self.is_valid(tx, &output.fully_processed_inbox)? {
            error!(
                "Attempted to save invalid checkpoint at gas {}",
                output.arb_gas_used
            );
            return Err(CoreError::Corruption(
                "checkpoint inbox state does not match the message log".into(),
            ));
        }

        let state = &machine.state;
        values::save_value(tx, &state.static_val)?;
        values::save_value(tx, &state.register)?;
        values::save_value(tx, &state.datastack_value())?;
        values::save_value(tx, &state.auxstack_value())?;
        for segment_id in referenced_segments(state) {
            let segment = self.code().segment(segment_id).ok_or_else(|| {
                CoreError::Corruption(format!("machine references unknown segment {segment_id}"))
            })?;
            values::commit_code_segment(tx, &segment)?;
        }

        let keys = state.state_keys();
        tx.put(
            CHECKPOINT,
            &u256_bytes(output.arb_gas_used),
            &CheckpointVariant::Full(keys).encode_to_vec(),
        )?;
        Ok(())
    }

    /// Gas of the newest stored checkpoint, zero when none exist.
    pub fn max_checkpoint_gas(&self) -> Result<U256, CoreError> {
        let view = self.store().begin_read()?;
        match view.last(CHECKPOINT)? {
            Some((key, _)) => Ok(U256::from_big_endian(&key)),
            None => Ok(U256::zero()),
        }
    }

    /// Newest machine-bearing checkpoint at or before `total_gas`. Light
    /// checkpoints are skipped on the way back.
    pub(crate) fn checkpoint_at_or_before_gas<V: ReadView + ?Sized>(
        &self,
        view: &V,
        total_gas: U256,
    ) -> Result<Option<MachineStateKeys>, CoreError> {
        for entry in view.iter_rev_from(CHECKPOINT, &u256_bytes(total_gas))? {
            let (_, value) = entry?;
            if let CheckpointVariant::Full(keys) = CheckpointVariant::decode(&value)? {
                return Ok(Some(keys));
            }
        }
        Ok(None)
    }

    /// Rebuilds a full machine from state keys by loading every component
    /// from the value store.
    pub(crate) fn machine_from_state_keys<V: ReadView + ?Sized>(
        &self,
        view: &V,
        keys: &MachineStateKeys,
        cache: &mut ValueCache,
        lazy_load: bool,
    ) -> Result<Machine, CoreError> {
        let static_val = values::get_value(view, keys.static_hash, cache, false)?;
        let register = values::get_value(view, keys.register_hash, cache, lazy_load)?;
        let Value::Tuple(datastack) =
            values::get_value(view, keys.datastack_hash, cache, false)?
        else {
            return Err(CoreError::Corruption("failed to load machine stack".into()));
        };
        let Value::Tuple(auxstack) = values::get_value(view, keys.auxstack_hash, cache, false)?
        else {
            return Err(CoreError::Corruption(
                "failed to load machine auxstack".into(),
            ));
        };

        for segment_id in [keys.pc.segment, keys.err_pc.segment] {
            if self.code().segment(segment_id).is_none() {
                let segment = values::load_code_segment(view, segment_id)?;
                self.code().restore_segment(segment);
            }
        }

        let state = MachineState {
            static_val,
            register,
            datastack,
            auxstack,
            pc: keys.pc,
            err_pc: keys.err_pc,
            arb_gas_remaining: keys.arb_gas_remaining,
            cpu_state: keys.cpu_state,
            output: keys.output.clone(),
        };
        Ok(Machine::from_state(state, std::sync::Arc::clone(self.code())))
    }

    /// Releases everything a deleted checkpoint referenced.
    pub(crate) fn delete_machine_state(
        &self,
        tx: &mut dyn WriteTransaction,
        keys: &MachineStateKeys,
    ) -> Result<(), CoreError> {
        values::release_value(tx, keys.static_hash)?;
        values::release_value(tx, keys.register_hash)?;
        values::release_value(tx, keys.datastack_hash)?;
        values::release_value(tx, keys.auxstack_hash)?;
        values::release_code_segment(tx, keys.pc.segment)?;
        if keys.err_pc.segment != keys.pc.segment {
            values::release_code_segment(tx, keys.err_pc.segment)?;
        }
        Ok(())
    }

    /// Resolves a machine by hash over the stored checkpoints.
    pub fn get_machine(&self, machine_hash: H256) -> Result<Option<Machine>, CoreError> {
        let view = self.store().begin_read()?;
        for entry in view.iter_rev_from(CHECKPOINT, &u256_bytes(U256::MAX))? {
            let (_, value) = entry?;
            if let CheckpointVariant::Full(keys) = CheckpointVariant::decode(&value)?
                && keys.machine_hash() == machine_hash
            {
                let mut cache = ValueCache::new(1);
                let machine = self.machine_from_state_keys(
                    view.as_ref(),
                    &keys,
                    &mut cache,
                    self.config().lazy_load_archive_queries,
                )?;
                return Ok(Some(machine));
            }
        }
        Ok(None)
    }

    pub(crate) fn reorg_to_last_message(&self, cache: &mut ValueCache) -> Result<bool, CoreError> {
        info!("Reloading chain to the last message saved");
        self.reorg_checkpoints(|_| true, true, cache)
    }

    pub(crate) fn reorg_to_message_count_or_before(
        &self,
        message_count: U256,
        initial_start: bool,
        cache: &mut ValueCache,
    ) -> Result<bool, CoreError> {
        if initial_start {
            info!("Reloading chain starting with message {message_count}");
        } else {
            info!("Reorg'ing chain to message {message_count}");
        }
        self.reorg_checkpoints(
            |output| message_count >= output.fully_processed_inbox.count,
            initial_start,
            cache,
        )
    }

    pub(crate) fn reorg_to_timestamp_or_before(
        &self,
        timestamp: U256,
        initial_start: bool,
        cache: &mut ValueCache,
    ) -> Result<bool, CoreError> {
        if initial_start {
            info!("Reloading chain starting with timestamp {timestamp}");
        } else {
            info!("Reorg'ing chain to timestamp {timestamp}");
        }
        self.reorg_checkpoints(
            |output| timestamp >= output.last_inbox_timestamp,
            initial_start,
            cache,
        )
    }

    /// Walks checkpoints newest to oldest until one satisfies `check_output`
    /// and still matches the inbox, deleting the rest (unless
    /// `initial_start`, which only seeds caches). The machine is then
    /// replayed forward to the selected output and the database truncated
    /// to its counts. Returns `false` when no checkpoint exists at all.
    pub(crate) fn reorg_checkpoints(
        &self,
        check_output: impl Fn(&MachineOutput) -> bool,
        initial_start: bool,
        cache: &mut ValueCache,
    ) -> Result<bool, CoreError> {
        if initial_start {
            info!("Reloading cache");
        } else {
            info!("Reorganizing");
        }

        // The first output satisfying the predicate; the machine must end
        // up exactly here even if it loads from an earlier checkpoint.
        let mut selected_machine_output: Option<MachineOutput> = None;
        let mut machine: Option<Machine> = None;

        {
            let _reorg_guard = self.lock(&self.core_reorg_mutex);
            let mut tx = self.store().begin_write()?;

            let mut seen_any = false;
            let mut stale: Vec<(Vec<u8>, Option<MachineStateKeys>)> = Vec::new();
            for entry in tx.iter_rev_from(CHECKPOINT, &u256_bytes(U256::MAX))? {
                let (key, value) = entry?;
                seen_any = true;
                let variant = CheckpointVariant::decode(&value)?;
                let output = variant.output().clone();

                if initial_start && selected_machine_output.is_none() {
                    // Startup seeds the cache through the newest entry.
                    selected_machine_output = Some(output.clone());
                }

                let mut finished = false;
                if output.arb_gas_used.is_zero() || check_output(&output) {
                    if self.is_valid(tx.as_ref(), &output.fully_processed_inbox)? {
                        finished = true;
                    } else {
                        error!(
                            "Unexpectedly invalid checkpoint inbox at message count {}",
                            output.fully_processed_inbox.count
                        );
                    }
                }

                match variant {
                    CheckpointVariant::Light(_) => {
                        if finished {
                            if selected_machine_output.is_none() {
                                selected_machine_output = Some(output.clone());
                                if let CacheLookup::Machine(cached) = self
                                    .lock(&self.machine_cache)
                                    .at_or_before_gas(output.arb_gas_used, None, None, false)
                                {
                                    machine = Some(*cached);
                                    break;
                                }
                            }
                            // Walk back to the nearest machine-bearing
                            // checkpoint.
                            continue;
                        }
                        if !initial_start {
                            stale.push((key, None));
                        }
                    }
                    CheckpointVariant::Full(keys) => {
                        if finished {
                            if let CacheLookup::Machine(cached) = self
                                .lock(&self.machine_cache)
                                .at_or_before_gas(output.arb_gas_used, None, None, false)
                            {
                                machine = Some(*cached);
                                break;
                            }
                            let loaded = self.machine_from_state_keys(
                                tx.as_ref(),
                                &keys,
                                cache,
                                self.config().lazy_load_core_machine,
                            )?;
                            machine = Some(loaded);
                            break;
                        }
                        if !initial_start {
                            stale.push((key, Some(keys)));
                        }
                    }
                }
            }

            if !seen_any {
                return Ok(false);
            }
            if machine.is_none() {
                return Err(CoreError::Corruption(
                    "no loadable checkpoint found during reorg".into(),
                ));
            }

            for (key, keys) in &stale {
                if let Some(keys) = keys {
                    self.delete_machine_state(tx.as_mut(), keys)?;
                }
                tx.delete(CHECKPOINT, key)?;
            }
            tx.commit()?;
        }

        let Some(mut machine) = machine else {
            return Err(CoreError::Corruption(
                "no loadable checkpoint found during reorg".into(),
            ));
        };

        // Invalidate cached machines past the surviving position.
        let cache_reorg_gas = selected_machine_output
            .as_ref()
            .map(|output| output.arb_gas_used)
            .unwrap_or(machine.output().arb_gas_used)
            + U256::one();
        self.lock(&self.machine_cache).reorg(cache_reorg_gas);

        if let Some(selected) = selected_machine_output.clone() {
            if initial_start && machine.output().arb_gas_used < selected.arb_gas_used {
                info!(
                    "Seeding cache between L2 blocks: {} - {}",
                    machine.output().l2_block_number,
                    selected.l2_block_number
                );
            }
            while machine.output().arb_gas_used < selected.arb_gas_used {
                let config = MachineExecutionConfig {
                    stop_on_sideload: initial_start,
                    max_gas: selected.arb_gas_used,
                    go_over_gas: false,
                    ..Default::default()
                };
                let staged = self.run_machine_with_messages(
                    &mut machine,
                    config,
                    self.config().message_process_count,
                )?;
                if !staged {
                    return Err(CoreError::Corruption(
                        "ran out of messages while catching up to checkpoint".into(),
                    ));
                }
                if machine.status() == MachineRunStatus::Error {
                    return Err(CoreError::Machine(machine.error_string().to_string()));
                }
                loop {
                    let assertion = machine.next_assertion();
                    if assertion.sideload_block_number.is_none() {
                        break;
                    }
                    self.lock(&self.machine_cache).timed_add(machine.clone());
                    if machine.output().arb_gas_used >= selected.arb_gas_used {
                        break;
                    }
                    machine.continue_running_machine();
                }
            }
            if machine.output().arb_gas_used != selected.arb_gas_used {
                error!("Error catching up: machine in unexpected state");
                return Err(CoreError::Corruption(
                    "machine gas does not match selected checkpoint after reorg".into(),
                ));
            }
        }

        let output = machine.output().clone();

        // Cursors must learn about deleted logs before the logs go away.
        let log_inserted = self.log_inserted_count()?;
        if output.log_count < log_inserted {
            for cursor_index in 0..self.logs_cursors.len() {
                self.handle_logs_cursor_reorg(cursor_index, output.log_count, cache)?;
            }
        }

        let mut tx = self.store().begin_write()?;
        let next_sideload_block = output
            .last_sideload
            .map(|block| block + U256::one())
            .unwrap_or_default();
        self.delete_sideloads_starting_at(tx.as_mut(), next_sideload_block)?;
        self.delete_logs_starting_at(tx.as_mut(), output.log_count)?;
        self.delete_sends_starting_at(tx.as_mut(), output.send_count)?;
        db::state_put_u256(tx.as_mut(), &db::LOG_INSERTED_KEY, output.log_count)?;
        db::state_put_u256(tx.as_mut(), &db::SEND_INSERTED_KEY, output.send_count)?;
        tx.commit()?;

        self.update_last_machine(&machine);
        *self.lock(&self.core_machine) = Some(machine);
        Ok(true)
    }
}

fn referenced_segments(state: &MachineState) -> impl Iterator<Item = u64> {
    let first = state.pc.segment;
    let second = state.err_pc.segment;
    std::iter::once(first).chain((second != first).then_some(second))
}
