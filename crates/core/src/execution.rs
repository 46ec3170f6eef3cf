//! Execution cursors: resumable replay handles over the machine.
//!
//! A cursor is either a live machine or parked state keys; parking releases
//! the memory and the next use rematerializes from the value store. Replay
//! always starts from the closest predecessor the cache or checkpoint
//! column offers.

use std::thread;
use std::time::Duration;

use ethereum_types::{H256, U256};
use tracing::warn;

use arbrex_common::types::{MachineOutput, MachineStateKeys};
use arbrex_storage::api::ReadView;
use arbrex_vm::{Machine, MachineExecutionConfig};

use crate::ArbCore;
use crate::cache::CacheLookup;
use crate::error::CoreError;
use crate::values::ValueCache;

const MAX_REORG_ATTEMPTS: u32 = 16;
const REORG_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum CursorMachine {
    Loaded(Box<Machine>),
    Keys(MachineStateKeys),
}

/// A resumable replay position.
#[derive(Debug)]
pub struct ExecutionCursor {
    machine: CursorMachine,
}

impl ExecutionCursor {
    fn from_machine(machine: Box<Machine>) -> Self {
        Self {
            machine: CursorMachine::Loaded(machine),
        }
    }

    fn from_keys(keys: MachineStateKeys) -> Self {
        Self {
            machine: CursorMachine::Keys(keys),
        }
    }

    pub fn output(&self) -> &MachineOutput {
        match &self.machine {
            CursorMachine::Loaded(machine) => machine.output(),
            CursorMachine::Keys(keys) => &keys.output,
        }
    }

    pub fn machine_hash(&self) -> H256 {
        match &self.machine {
            CursorMachine::Loaded(machine) => machine.state.machine_hash(),
            CursorMachine::Keys(keys) => keys.machine_hash(),
        }
    }

    fn loaded_mut(&mut self) -> Option<&mut Machine> {
        match &mut self.machine {
            CursorMachine::Loaded(machine) => Some(machine),
            CursorMachine::Keys(_) => None,
        }
    }
}

impl ArbCore {
    /// Cursor positioned at `total_gas_used` (stopping short of crossing
    /// it). `None` when no usable starting point exists or the inbox keeps
    /// reorging beneath the replay.
    pub fn get_execution_cursor(
        &self,
        total_gas_used: U256,
        allow_slow_lookup: bool,
    ) -> Result<Option<ExecutionCursor>, CoreError> {
        let mut cursor = {
            let view = self.store().begin_read()?;
            match self.closest_execution_cursor(view.as_ref(), total_gas_used, allow_slow_lookup)? {
                Some(cursor) => cursor,
                None => {
                    warn!("No execution machine available");
                    return Ok(None);
                }
            }
        };
        if !self.advance_execution_cursor_impl(
            &mut cursor,
            total_gas_used,
            false,
            allow_slow_lookup,
        )? {
            warn!("Couldn't advance execution machine");
            return Ok(None);
        }
        Ok(Some(cursor))
    }

    /// Advances an existing cursor to the absolute gas target, possibly
    /// swapping in a closer starting point first. Returns `false` when no
    /// starting point within the execution bound exists.
    pub fn advance_execution_cursor(
        &self,
        execution_cursor: &mut ExecutionCursor,
        total_gas_used: U256,
        go_over_gas: bool,
        allow_slow_lookup: bool,
    ) -> Result<bool, CoreError> {
        let current_gas = execution_cursor.output().arb_gas_used;
        if current_gas < total_gas_used {
            let view = self.store().begin_read()?;
            let mut database_keys = None;
            if allow_slow_lookup {
                let _guard = self.lock(&self.core_reorg_mutex);
                let Some(keys) = self.checkpoint_at_or_before_gas(view.as_ref(), total_gas_used)?
                else {
                    return Ok(false);
                };
                database_keys = Some(keys);
            }
            let database_gas = database_keys.as_ref().map(|keys| keys.output.arb_gas_used);
            match self.lock(&self.machine_cache).at_or_before_gas(
                total_gas_used,
                Some(current_gas),
                database_gas,
                false,
            ) {
                CacheLookup::Machine(machine) => {
                    *execution_cursor = ExecutionCursor::from_machine(machine);
                }
                CacheLookup::UseDatabase => {
                    let Some(keys) = database_keys else {
                        return Ok(false);
                    };
                    *execution_cursor = ExecutionCursor::from_keys(keys);
                }
                CacheLookup::TooMuchExecution => return Ok(false),
                CacheLookup::Nothing => {}
            }
        }
        self.advance_execution_cursor_impl(
            execution_cursor,
            total_gas_used,
            go_over_gas,
            allow_slow_lookup,
        )
    }

    /// Takes the cursor's machine, parking the cursor back to state keys.
    pub fn take_execution_cursor_machine(
        &self,
        execution_cursor: &mut ExecutionCursor,
    ) -> Result<Machine, CoreError> {
        let view = self.store().begin_read()?;
        self.resolve_execution_cursor_machine(view.as_ref(), execution_cursor)?;
        let keys = match &execution_cursor.machine {
            CursorMachine::Loaded(machine) => machine.state.state_keys(),
            CursorMachine::Keys(keys) => keys.clone(),
        };
        match std::mem::replace(&mut execution_cursor.machine, CursorMachine::Keys(keys)) {
            CursorMachine::Loaded(machine) => Ok(*machine),
            CursorMachine::Keys(_) => Err(CoreError::Corruption(
                "execution cursor failed to materialize".into(),
            )),
        }
    }

    /// Cursor at the sideload position of an L2 block.
    pub fn get_execution_cursor_at_block(
        &self,
        block_number: U256,
        allow_slow_lookup: bool,
    ) -> Result<Option<ExecutionCursor>, CoreError> {
        let (gas_target, mut cursor) = {
            let view = self.store().begin_read()?;
            let Some(gas_target) = self.get_sideload_position_view(view.as_ref(), block_number)?
            else {
                return Ok(None);
            };
            let Some(cursor) =
                self.closest_execution_cursor(view.as_ref(), gas_target, allow_slow_lookup)?
            else {
                return Ok(None);
            };
            (gas_target, cursor)
        };
        if !self.advance_execution_cursor_impl(&mut cursor, gas_target, false, allow_slow_lookup)? {
            return Ok(None);
        }
        Ok(Some(cursor))
    }

    /// Machine reconstructed at an L2 block boundary.
    pub fn get_machine_at_block(
        &self,
        block_number: U256,
        allow_slow_lookup: bool,
    ) -> Result<Option<Machine>, CoreError> {
        let Some(mut cursor) = self.get_execution_cursor_at_block(block_number, allow_slow_lookup)?
        else {
            return Ok(None);
        };
        Ok(Some(self.take_execution_cursor_machine(&mut cursor)?))
    }

    fn closest_execution_cursor<V: ReadView + ?Sized>(
        &self,
        view: &V,
        total_gas_used: U256,
        allow_slow_lookup: bool,
    ) -> Result<Option<ExecutionCursor>, CoreError> {
        let mut database_keys = None;
        if allow_slow_lookup {
            match self.checkpoint_at_or_before_gas(view, total_gas_used)? {
                Some(keys) => database_keys = Some(keys),
                None => return Ok(None),
            }
        }
        let database_gas = database_keys.as_ref().map(|keys| keys.output.arb_gas_used);
        match self.lock(&self.machine_cache).at_or_before_gas(
            total_gas_used,
            None,
            database_gas,
            false,
        ) {
            CacheLookup::Machine(machine) => Ok(Some(ExecutionCursor::from_machine(machine))),
            CacheLookup::UseDatabase => {
                // Hold off concurrent reorg deletion while this checkpoint
                // is being adopted.
                let _guard = self.lock(&self.core_reorg_mutex);
                match database_keys {
                    Some(keys) => Ok(Some(ExecutionCursor::from_keys(keys))),
                    None => Ok(None),
                }
            }
            CacheLookup::TooMuchExecution | CacheLookup::Nothing => Ok(None),
        }
    }

    fn resolve_execution_cursor_machine<V: ReadView + ?Sized>(
        &self,
        view: &V,
        execution_cursor: &mut ExecutionCursor,
    ) -> Result<(), CoreError> {
        if let CursorMachine::Keys(keys) = &execution_cursor.machine {
            let mut cache = ValueCache::new(1);
            let machine = self.machine_from_state_keys(
                view,
                keys,
                &mut cache,
                self.config().lazy_load_archive_queries,
            )?;
            execution_cursor.machine = CursorMachine::Loaded(Box::new(machine));
        }
        Ok(())
    }

    fn advance_execution_cursor_impl(
        &self,
        execution_cursor: &mut ExecutionCursor,
        total_gas_used: U256,
        go_over_gas: bool,
        allow_slow_lookup: bool,
    ) -> Result<bool, CoreError> {
        let max_execution_gas = U256::from(self.config().checkpoint_max_execution_gas);
        let mut handle_reorg = true;
        let mut reorg_attempts = 0u32;
        while handle_reorg {
            handle_reorg = false;
            if reorg_attempts > 0 {
                if reorg_attempts % 4 == 0 {
                    warn!(
                        "Execution cursor has attempted to handle {reorg_attempts} reorgs. \
                         Checkpoints may be inconsistent with messages."
                    );
                }
                thread::sleep(REORG_RETRY_DELAY);
                if reorg_attempts >= MAX_REORG_ATTEMPTS {
                    return Err(CoreError::Busy);
                }
            }
            reorg_attempts += 1;

            loop {
                let messages = {
                    let view = self.store().begin_read()?;
                    self.resolve_execution_cursor_machine(view.as_ref(), execution_cursor)?;

                    let output = execution_cursor.output();
                    let gas_used = output.arb_gas_used;
                    if gas_used >= total_gas_used {
                        break;
                    }
                    if !max_execution_gas.is_zero()
                        && total_gas_used - gas_used > max_execution_gas
                    {
                        // Execution would take too long from here.
                        return Ok(false);
                    }

                    match self.read_next_messages(
                        view.as_ref(),
                        &output.fully_processed_inbox,
                        self.config().message_process_count,
                    )? {
                        None => {
                            // Inbox reorged beneath the replay; restart from
                            // a fresh starting point.
                            handle_reorg = true;
                            break;
                        }
                        Some(messages) => messages,
                    }
                };

                let Some(machine) = execution_cursor.loaded_mut() else {
                    return Err(CoreError::Corruption(
                        "execution cursor lost its machine mid-advance".into(),
                    ));
                };
                let assertion = machine.run(MachineExecutionConfig {
                    inbox_messages: messages,
                    stop_on_sideload: false,
                    max_gas: total_gas_used,
                    go_over_gas,
                });
                if assertion.gas_count.is_zero() {
                    break;
                }
            }

            if handle_reorg {
                let view = self.store().begin_read()?;
                match self.closest_execution_cursor(
                    view.as_ref(),
                    total_gas_used,
                    allow_slow_lookup,
                )? {
                    Some(fresh) => *execution_cursor = fresh,
                    None => {
                        warn!("No execution machine available");
                        return Ok(false);
                    }
                }
            }
        }

        if let CursorMachine::Loaded(machine) = &execution_cursor.machine {
            self.lock(&self.machine_cache).lru_add((**machine).clone());
        }
        Ok(true)
    }
}
