//! Persistence and retrieval of what the machine emits: logs (through the
//! value store), sends, and sideload positions.

use bytes::Bytes;
use ethereum_types::{H256, U256};

use arbrex_common::types::{LogRecord, SendRecord};
use arbrex_common::wire::u256_bytes;
use arbrex_storage::api::tables::{LOG, SEND, SIDELOAD};
use arbrex_storage::api::{ReadView, WriteTransaction};
use arbrex_vm::{Assertion, MachineEmission, Value};

use crate::ArbCore;
use crate::db;
use crate::error::CoreError;
use crate::values::{self, ValueCache};

impl ArbCore {
    /// Persists everything one assertion produced: logs, sends, and the
    /// sideload position when the machine paused at a block boundary.
    pub(crate) fn save_assertion(
        &self,
        tx: &mut dyn WriteTransaction,
        assertion: &Assertion,
        arb_gas_used: U256,
    ) -> Result<(), CoreError> {
        self.save_logs(tx, &assertion.logs)?;
        self.save_sends(tx, &assertion.sends)?;
        if let Some(block_number) = assertion.sideload_block_number {
            self.save_sideload_position(tx, block_number, arb_gas_used)?;
        }
        Ok(())
    }

    pub(crate) fn save_logs(
        &self,
        tx: &mut dyn WriteTransaction,
        logs: &[MachineEmission<Value>],
    ) -> Result<(), CoreError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut log_index = db::state_require_u256(tx, &db::LOG_INSERTED_KEY)?;
        for log in logs {
            let value_hash = values::save_value(tx, &log.val)?;
            let record = LogRecord {
                value_hash,
                inbox: log.inbox,
            };
            tx.put(LOG, &u256_bytes(log_index), &record.encode_value())?;
            log_index += U256::one();
        }
        db::state_put_u256(tx, &db::LOG_INSERTED_KEY, log_index)
    }

    pub(crate) fn save_sends(
        &self,
        tx: &mut dyn WriteTransaction,
        sends: &[MachineEmission<Bytes>],
    ) -> Result<(), CoreError> {
        if sends.is_empty() {
            return Ok(());
        }
        let mut send_index = db::state_require_u256(tx, &db::SEND_INSERTED_KEY)?;
        for send in sends {
            let record = SendRecord {
                inbox: send.inbox,
                body: send.val.clone(),
            };
            tx.put(SEND, &u256_bytes(send_index), &record.encode_value())?;
            send_index += U256::one();
        }
        db::state_put_u256(tx, &db::SEND_INSERTED_KEY, send_index)
    }

    /// Log entries `[index, index + count)`, clamped to what exists.
    pub fn get_logs(
        &self,
        index: U256,
        count: U256,
    ) -> Result<Vec<MachineEmission<Value>>, CoreError> {
        let view = self.store().begin_read()?;
        let mut cache = ValueCache::new(1);
        self.get_logs_view(
            view.as_ref(),
            index,
            count,
            &mut cache,
            self.config().lazy_load_archive_queries,
        )
    }

    pub(crate) fn get_logs_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
        index: U256,
        count: U256,
        cache: &mut ValueCache,
        lazy_load: bool,
    ) -> Result<Vec<MachineEmission<Value>>, CoreError> {
        if count.is_zero() {
            return Ok(Vec::new());
        }
        let max_log_count = db::state_require_u256(view, &db::LOG_INSERTED_KEY)?;
        if index >= max_log_count {
            return Ok(Vec::new());
        }
        let count = count.min(max_log_count - index);
        let end = index + count;

        let mut logs = Vec::new();
        for entry in view.iter_from(LOG, &u256_bytes(index))? {
            let (key, value) = entry?;
            if U256::from_big_endian(&key) >= end {
                break;
            }
            let record = LogRecord::decode_value(&value)?;
            let val = values::get_value(view, record.value_hash, cache, lazy_load)?;
            logs.push(MachineEmission {
                val,
                inbox: record.inbox,
            });
        }
        Ok(logs)
    }

    /// Send bodies `[index, index + count)`; `None` when `index` is past the
    /// live sends.
    pub fn get_sends(&self, index: U256, count: U256) -> Result<Option<Vec<Bytes>>, CoreError> {
        let view = self.store().begin_read()?;
        if count.is_zero() {
            return Ok(Some(Vec::new()));
        }
        let max_send_count = db::state_require_u256(view.as_ref(), &db::SEND_INSERTED_KEY)?;
        if index >= max_send_count {
            return Ok(None);
        }
        let count = count.min(max_send_count - index);
        let end = index + count;

        let mut sends = Vec::new();
        for entry in view.iter_from(SEND, &u256_bytes(index))? {
            let (key, value) = entry?;
            if U256::from_big_endian(&key) >= end {
                break;
            }
            sends.push(SendRecord::decode_value(&value)?.body);
        }
        Ok(Some(sends))
    }

    pub(crate) fn save_sideload_position(
        &self,
        tx: &mut dyn WriteTransaction,
        block_number: U256,
        arb_gas_used: U256,
    ) -> Result<(), CoreError> {
        tx.put(
            SIDELOAD,
            &u256_bytes(block_number),
            &u256_bytes(arb_gas_used),
        )?;
        Ok(())
    }

    /// Gas position at (or before) the given L2 block.
    pub(crate) fn get_sideload_position_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
        block_number: U256,
    ) -> Result<Option<U256>, CoreError> {
        match view
            .iter_rev_from(SIDELOAD, &u256_bytes(block_number))?
            .next()
            .transpose()?
        {
            Some((_, value)) => Ok(Some(U256::from_big_endian(&value))),
            None => Ok(None),
        }
    }

    pub(crate) fn delete_sideloads_starting_at(
        &self,
        tx: &mut dyn WriteTransaction,
        block_number: U256,
    ) -> Result<(), CoreError> {
        let mut stale = Vec::new();
        for entry in tx.iter_from(SIDELOAD, &u256_bytes(block_number))? {
            stale.push(entry?.0);
        }
        for key in &stale {
            tx.delete(SIDELOAD, key)?;
        }
        Ok(())
    }

    pub(crate) fn delete_sends_starting_at(
        &self,
        tx: &mut dyn WriteTransaction,
        send_index: U256,
    ) -> Result<(), CoreError> {
        let mut stale = Vec::new();
        for entry in tx.iter_from(SEND, &u256_bytes(send_index))? {
            stale.push(entry?.0);
        }
        for key in &stale {
            tx.delete(SEND, key)?;
        }
        Ok(())
    }

    /// Deletes the given log and every newer one, releasing their values.
    pub(crate) fn delete_logs_starting_at(
        &self,
        tx: &mut dyn WriteTransaction,
        log_index: U256,
    ) -> Result<(), CoreError> {
        let mut stale: Vec<(Vec<u8>, H256)> = Vec::new();
        for entry in tx.iter_from(LOG, &u256_bytes(log_index))? {
            let (key, value) = entry?;
            let record = LogRecord::decode_value(&value)?;
            stale.push((key, record.value_hash));
        }
        for (key, value_hash) in &stale {
            values::release_value(tx, *value_hash)?;
            tx.delete(LOG, key)?;
        }
        Ok(())
    }
}
