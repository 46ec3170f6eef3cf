//! Log cursors: independent subscribers that receive windows of newly
//! inserted logs and, across reorgs, the logs that were invalidated.
//!
//! The persisted position (`current_total_count`) only advances at the
//! atomic acknowledgement point (`logs_cursor_confirm_received`), so a
//! crash or reorg can never skip a log a consumer has not confirmed.

use std::sync::Mutex;

use ethereum_types::U256;
use tracing::error;

use arbrex_storage::api::{ReadView, WriteTransaction};
use arbrex_vm::{MachineEmission, Value};

use crate::ArbCore;
use crate::db;
use crate::error::CoreError;
use crate::values::ValueCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogsCursorStatus {
    #[default]
    Empty,
    Requested,
    Ready,
    Delivered,
    Error,
}

/// One delivery: logs starting at `first_log_index`, plus any logs deleted
/// by reorgs since the last delivery, newest first.
#[derive(Debug, Default)]
pub struct LogsCursorLogs {
    pub first_log_index: U256,
    pub logs: Vec<MachineEmission<Value>>,
    pub deleted_logs: Vec<MachineEmission<Value>>,
}

#[derive(Debug, Default)]
struct LogsCursorState {
    status: LogsCursorStatus,
    number_requested: U256,
    /// Highest log index handed out but not yet confirmed.
    pending_total_count: U256,
    data: Vec<MachineEmission<Value>>,
    deleted_data: Vec<MachineEmission<Value>>,
    error_string: String,
}

/// Per-cursor state behind its own mutex; both the driver (refill, reorg)
/// and the consumer (get, confirm, clear) take it.
#[derive(Debug, Default)]
pub(crate) struct LogsCursor {
    state: Mutex<LogsCursorState>,
}

impl LogsCursor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn abort(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.error_string = "arbcore thread aborted".into();
        state.status = LogsCursorStatus::Error;
    }
}

impl ArbCore {
    fn cursor(&self, cursor_index: usize) -> Result<&LogsCursor, CoreError> {
        self.logs_cursors.get(cursor_index).ok_or_else(|| {
            error!("Invalid logs cursor index: {cursor_index}");
            CoreError::UserLogic(format!("invalid logs cursor index {cursor_index}"))
        })
    }

    fn cursor_current_total_count_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
        cursor_index: usize,
    ) -> Result<U256, CoreError> {
        db::state_require_u256(view, &db::logs_cursor_current_key(cursor_index))
    }

    /// Consumer: asks the driver to stage up to `count` new logs.
    pub fn logs_cursor_request(&self, cursor_index: usize, count: U256) -> Result<bool, CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let mut state = self.lock(&cursor.state);
        if state.status != LogsCursorStatus::Empty {
            return Ok(false);
        }
        state.number_requested = count;
        state.status = LogsCursorStatus::Requested;
        Ok(true)
    }

    /// Driver: fills a requested cursor from the log column. Failures are
    /// latched into the cursor rather than propagated.
    pub(crate) fn handle_logs_cursor_requested(
        &self,
        cursor_index: usize,
        cache: &mut ValueCache,
    ) -> Result<(), CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let view = self.store().begin_read()?;
        let mut state = self.lock(&cursor.state);
        state.data.clear();

        let log_inserted = match db::state_require_u256(view.as_ref(), &db::LOG_INSERTED_KEY) {
            Ok(count) => count,
            Err(err) => {
                error!("logs cursor {cursor_index} error getting inserted count: {err}");
                state.error_string = err.to_string();
                state.status = LogsCursorStatus::Error;
                return Ok(());
            }
        };
        let current = match self.cursor_current_total_count_view(view.as_ref(), cursor_index) {
            Ok(count) => count,
            Err(err) => {
                error!("logs cursor {cursor_index} error getting current total count: {err}");
                state.error_string = err.to_string();
                state.status = LogsCursorStatus::Error;
                return Ok(());
            }
        };

        if current == log_inserted {
            // No new logs, but queued deletions still need delivering.
            if !state.deleted_data.is_empty() {
                state.status = LogsCursorStatus::Ready;
            }
            return Ok(());
        }
        if current > log_inserted {
            error!(
                "logs cursor {cursor_index} current count {current} > inserted count {log_inserted}"
            );
            state.error_string =
                "cursor current total count greater than log inserted count".into();
            state.status = LogsCursorStatus::Error;
            return Ok(());
        }
        if current + state.number_requested > log_inserted {
            state.number_requested = log_inserted - current;
        }
        if state.number_requested.is_zero() {
            state.status = LogsCursorStatus::Ready;
            return Ok(());
        }
        match self.get_logs_view(view.as_ref(), current, state.number_requested, cache, false) {
            Ok(logs) => {
                state.data = logs;
                state.status = LogsCursorStatus::Ready;
            }
            Err(err) => {
                error!("logs cursor {cursor_index} error getting logs: {err}");
                state.error_string = err.to_string();
                state.status = LogsCursorStatus::Error;
            }
        }
        Ok(())
    }

    /// Driver: tears a cursor back to `log_count` ahead of log deletion.
    /// Deleted logs are queued newest-first; the persisted position drops
    /// when it pointed past the cut.
    pub(crate) fn handle_logs_cursor_reorg(
        &self,
        cursor_index: usize,
        log_count: U256,
        cache: &mut ValueCache,
    ) -> Result<(), CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let mut tx = self.store().begin_write()?;
        let mut state = self.lock(&cursor.state);

        let current = self.cursor_current_total_count_view(tx.as_ref(), cursor_index)?;
        if current > state.pending_total_count {
            state.pending_total_count = current;
        }

        if log_count < state.pending_total_count {
            let invalidated = self.get_logs_view(
                tx.as_ref(),
                log_count,
                state.pending_total_count - log_count,
                cache,
                false,
            )?;
            state.deleted_data.extend(invalidated.into_iter().rev());
            state.pending_total_count = log_count;
            if current > log_count {
                db::state_put_u256(
                    tx.as_mut(),
                    &db::logs_cursor_current_key(cursor_index),
                    log_count,
                )?;
            }
        }

        if !state.data.is_empty() {
            if current >= log_count {
                state.data.clear();
            } else if current + U256::from(state.data.len()) > log_count {
                let keep = (log_count - current).low_u64() as usize;
                state.data.truncate(keep);
            }
        }

        if state.status == LogsCursorStatus::Ready
            && state.data.is_empty()
            && state.deleted_data.is_empty()
        {
            state.status = LogsCursorStatus::Requested;
        }

        tx.commit()?;
        Ok(())
    }

    /// Consumer: takes the staged window. `None` means the driver has not
    /// filled the request yet; poll again.
    pub fn logs_cursor_get_logs(
        &self,
        cursor_index: usize,
    ) -> Result<Option<LogsCursorLogs>, CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let view = self.store().begin_read()?;
        let mut state = self.lock(&cursor.state);
        match state.status {
            LogsCursorStatus::Requested => return Ok(None),
            LogsCursorStatus::Ready => {}
            // A reorg queued deletions after delivery; hand them out again.
            LogsCursorStatus::Delivered if !state.deleted_data.is_empty() => {}
            _ => {
                return Err(CoreError::UserLogic(
                    "unexpected logs cursor status".into(),
                ));
            }
        }

        let current = self.cursor_current_total_count_view(view.as_ref(), cursor_index)?;
        state.pending_total_count = current + U256::from(state.data.len());
        let logs = LogsCursorLogs {
            first_log_index: current,
            logs: std::mem::take(&mut state.data),
            deleted_logs: std::mem::take(&mut state.deleted_data),
        };
        state.status = LogsCursorStatus::Delivered;
        Ok(Some(logs))
    }

    /// Consumer: the atomic acknowledgement. Only here does the persisted
    /// position advance. Returns `false` when deletions arrived since the
    /// delivery, in which case the window must be fetched again.
    pub fn logs_cursor_confirm_received(&self, cursor_index: usize) -> Result<bool, CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let mut state = self.lock(&cursor.state);
        if state.status != LogsCursorStatus::Delivered {
            error!("logsCursorConfirmReceived called at wrong state: {:?}", state.status);
            state.error_string = "logsCursorConfirmReceived called at wrong state".into();
            state.status = LogsCursorStatus::Error;
            return Ok(false);
        }
        if !state.deleted_data.is_empty() {
            state.status = LogsCursorStatus::Ready;
            return Ok(false);
        }

        let mut tx = self.store().begin_write()?;
        db::state_put_u256(
            tx.as_mut(),
            &db::logs_cursor_current_key(cursor_index),
            state.pending_total_count,
        )?;
        tx.commit()?;
        state.status = LogsCursorStatus::Empty;
        Ok(true)
    }

    pub fn logs_cursor_check_error(&self, cursor_index: usize) -> Result<bool, CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let state = self.lock(&cursor.state);
        Ok(state.status == LogsCursorStatus::Error)
    }

    /// Confirmed position of the cursor.
    pub fn logs_cursor_position(&self, cursor_index: usize) -> Result<U256, CoreError> {
        self.cursor(cursor_index)?;
        let view = self.store().begin_read()?;
        self.cursor_current_total_count_view(view.as_ref(), cursor_index)
    }

    /// Takes the latched error, resetting the cursor to `Empty`.
    pub fn logs_cursor_clear_error(&self, cursor_index: usize) -> Result<String, CoreError> {
        let cursor = self.cursor(cursor_index)?;
        let mut state = self.lock(&cursor.state);
        if state.status != LogsCursorStatus::Error {
            error!("logsCursorClearError called when status not ERROR");
            return Err(CoreError::UserLogic(
                "logsCursorClearError called when status not ERROR".into(),
            ));
        }
        let message = std::mem::take(&mut state.error_string);
        state.data.clear();
        state.deleted_data.clear();
        state.status = LogsCursorStatus::Empty;
        Ok(message)
    }

    pub(crate) fn logs_cursor_is_requested(&self, cursor_index: usize) -> bool {
        self.logs_cursors
            .get(cursor_index)
            .map(|cursor| {
                self.lock(&cursor.state).status == LogsCursorStatus::Requested
            })
            .unwrap_or(false)
    }

    pub(crate) fn abort_logs_cursors(&self) {
        for cursor in &self.logs_cursors {
            cursor.abort();
        }
    }
}
