//! Inbox store: accumulator-chained sequencer batch items and delayed
//! messages, with forced-reorg detection and the reader surface.

use bytes::Bytes;
use ethereum_types::{H256, U256};
use tracing::{error, warn};

use arbrex_common::types::{
    DelayedMessage, InboxMessage, InboxState, RawMessageInfo, SequencerBatchItem,
    delayed_sequence_number,
};
use arbrex_common::utils::keccak;
use arbrex_common::wire::{append_u256, u256_bytes};
use arbrex_storage::api::tables::{DELAYED_MESSAGE, SEQUENCER_BATCH_ITEM};
use arbrex_storage::api::{ReadView, WriteTransaction};
use arbrex_vm::MachineMessage;

use crate::ArbCore;
use crate::driver::MessageData;
use crate::error::CoreError;
use crate::values::ValueCache;

fn decode_stored_item(key: &[u8], value: &[u8]) -> Result<SequencerBatchItem, CoreError> {
    let last_sequence_number = U256::from_big_endian(key);
    Ok(SequencerBatchItem::decode_value(last_sequence_number, value)?)
}

fn stored_accumulator(value: &[u8]) -> Result<H256, CoreError> {
    if value.len() < 32 {
        return Err(CoreError::Corruption("batch item row shorter than accumulator".into()));
    }
    Ok(H256::from_slice(&value[..32]))
}

impl ArbCore {
    /// Ingests one delivered batch under the lockstep/divergence protocol.
    ///
    /// Returns the checkpoint gas watermark when a reorg was performed, so
    /// the driver can reschedule its next checkpoint.
    pub(crate) fn add_messages(
        &self,
        data: &MessageData,
        cache: &mut ValueCache,
    ) -> Result<Option<U256>, CoreError> {
        let mut seq_batch_items = data
            .sequencer_batch_items
            .iter()
            .map(|bytes| SequencerBatchItem::from_delivery_bytes(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let delayed_messages = data
            .delayed_messages
            .iter()
            .map(|bytes| DelayedMessage::from_delivery_bytes(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let mut reorging_to_count: Option<U256> = None;
        {
            let mut tx = self.store().begin_write()?;

            if let Some(reorg_target) = data.reorg_batch_items {
                let mut stale = Vec::new();
                for entry in tx.iter_from(SEQUENCER_BATCH_ITEM, &u256_bytes(reorg_target))? {
                    stale.push(entry?.0);
                }
                if !stale.is_empty() {
                    reorging_to_count = Some(reorg_target);
                }
                for key in &stale {
                    tx.delete(SEQUENCER_BATCH_ITEM, key)?;
                }
            }

            let mut prev_item = SequencerBatchItem::default();
            let mut duplicate_count = 0usize;

            if !seq_batch_items.is_empty() {
                let start = data.previous_message_count;

                if start > U256::zero() {
                    let prev_key = u256_bytes(start - U256::one());
                    let found = tx
                        .iter_from(SEQUENCER_BATCH_ITEM, &prev_key)?
                        .next()
                        .transpose()?;
                    let Some((key, value)) = found else {
                        error!("addMessages: previous batch item not found");
                        return Err(CoreError::UserLogic(
                            "previous batch item not found".into(),
                        ));
                    };
                    let db_item = decode_stored_item(&key, &value)?;
                    if db_item.last_sequence_number != start - U256::one() {
                        return Err(CoreError::UserLogic(
                            "previous_message_count didn't fall on batch item boundary".into(),
                        ));
                    }
                    if db_item.accumulator != data.previous_batch_acc {
                        return Err(CoreError::UserLogic("prev_batch_acc didn't match".into()));
                    }
                    prev_item = db_item;
                }

                // Walk the stored tail in lockstep with the incoming items;
                // matching accumulators are duplicates, the first mismatch
                // truncates the stored suffix.
                let mut stale = Vec::new();
                {
                    let mut stored = tx.iter_from(SEQUENCER_BATCH_ITEM, &u256_bytes(start))?;
                    let mut incoming = seq_batch_items.iter();
                    let mut diverged = false;
                    for entry in stored.by_ref() {
                        let (key, value) = entry?;
                        if diverged {
                            stale.push(key);
                            continue;
                        }
                        let Some(item) = incoming.next() else {
                            break;
                        };
                        if stored_accumulator(&value)? == item.accumulator {
                            prev_item = item.clone();
                            duplicate_count += 1;
                        } else {
                            warn!(
                                "INBOX FORCED REORG at sequence number {}",
                                item.last_sequence_number
                            );
                            reorging_to_count = Some(if item.last_sequence_number.is_zero() {
                                U256::zero()
                            } else {
                                prev_item.last_sequence_number + U256::one()
                            });
                            stale.push(key);
                            diverged = true;
                        }
                    }
                }
                for key in &stale {
                    tx.delete(SEQUENCER_BATCH_ITEM, key)?;
                }
            }

            if !delayed_messages.is_empty() {
                self.add_delayed_messages(tx.as_mut(), &delayed_messages)?;
            }

            for item in seq_batch_items.iter_mut().skip(duplicate_count) {
                let mut expected_last_seq = if prev_item.accumulator.is_zero() {
                    U256::zero()
                } else {
                    prev_item.last_sequence_number + U256::one()
                };
                let mut delayed_acc = H256::zero();
                if item.total_delayed_count > prev_item.total_delayed_count {
                    expected_last_seq +=
                        item.total_delayed_count - prev_item.total_delayed_count - U256::one();
                    if item.sequencer_message.is_some() {
                        return Err(CoreError::UserLogic(
                            "batch item has both sequencer message and delayed messages".into(),
                        ));
                    }
                    delayed_acc = self
                        .delayed_inbox_acc_view(
                            tx.as_ref(),
                            item.total_delayed_count - U256::one(),
                        )?
                        .ok_or_else(|| {
                            error!("failed to lookup delayed message accumulator");
                            CoreError::UserLogic(
                                "batch item references delayed messages not yet delivered".into(),
                            )
                        })?;
                } else if item.total_delayed_count < prev_item.total_delayed_count {
                    return Err(CoreError::UserLogic(
                        "batch item decreases total delayed messages read".into(),
                    ));
                } else if item.sequencer_message.is_none() {
                    return Err(CoreError::UserLogic(
                        "batch item advances neither messages nor delayed count".into(),
                    ));
                }
                if item.last_sequence_number != expected_last_seq {
                    return Err(CoreError::UserLogic(
                        "batch item has unexpected sequence number".into(),
                    ));
                }
                let expected_acc = item.compute_accumulator(
                    prev_item.accumulator,
                    prev_item.total_delayed_count,
                    delayed_acc,
                );
                if item.accumulator.is_zero() {
                    item.accumulator = expected_acc;
                } else if item.accumulator != expected_acc {
                    return Err(CoreError::UserLogic(
                        "batch item accumulator didn't match recomputed value".into(),
                    ));
                }
                prev_item = item.clone();
                tx.put(SEQUENCER_BATCH_ITEM, &item.key(), &item.encode_value())?;
            }

            tx.commit()?;
        }

        if let Some(count) = reorging_to_count {
            self.reorg_to_message_count_or_before(count, false, cache)?;
            return Ok(Some(self.max_checkpoint_gas()?));
        }
        Ok(None)
    }

    /// Lockstep ingestion of delayed messages. Reorging past an already
    /// sequenced delayed message is fatal: a sequencer item has consumed it.
    fn add_delayed_messages(
        &self,
        tx: &mut dyn WriteTransaction,
        delayed_messages: &[DelayedMessage],
    ) -> Result<(), CoreError> {
        let total_sequenced = self.total_delayed_messages_sequenced_view(tx)?;
        let start = delayed_messages[0].delayed_sequence_number;
        let checking_prev = start > U256::zero();

        let window_from = if checking_prev {
            start - U256::one()
        } else {
            start
        };
        let mut window = Vec::with_capacity(delayed_messages.len() + 1);
        for entry in tx
            .iter_from(DELAYED_MESSAGE, &u256_bytes(window_from))?
            .take(delayed_messages.len() + 1)
        {
            let (key, value) = entry?;
            window.push((U256::from_big_endian(&key), stored_accumulator(&value)?));
        }

        let mut window_idx = 0usize;
        let mut prev_acc = H256::zero();
        if checking_prev {
            match window.first() {
                Some((seq, acc)) if *seq == start - U256::one() => {
                    prev_acc = *acc;
                    window_idx = 1;
                }
                _ => {
                    return Err(CoreError::UserLogic(
                        "previous delayed message not found".into(),
                    ));
                }
            }
        }

        let mut inserting = false;
        let mut divergence_from: Option<U256> = None;
        let mut to_insert: Vec<&DelayedMessage> = Vec::new();
        for (offset, message) in delayed_messages.iter().enumerate() {
            if message.delayed_sequence_number != start + U256::from(offset) {
                return Err(CoreError::UserLogic(
                    "delayed messages are not contiguous".into(),
                ));
            }
            if !inserting {
                match window.get(window_idx) {
                    None => inserting = true,
                    Some((_, db_acc)) => {
                        if *db_acc == message.delayed_accumulator {
                            prev_acc = *db_acc;
                            window_idx += 1;
                            continue;
                        }
                        if message.delayed_sequence_number < total_sequenced {
                            return Err(CoreError::Corruption(
                                "attempted to reorg already sequenced delayed messages".into(),
                            ));
                        }
                        divergence_from = Some(message.delayed_sequence_number);
                        inserting = true;
                    }
                }
            }
            let expected_acc = DelayedMessage::chain_accumulator(prev_acc, &message.message);
            if expected_acc != message.delayed_accumulator {
                return Err(CoreError::UserLogic("unexpected delayed accumulator".into()));
            }
            prev_acc = expected_acc;
            to_insert.push(message);
        }

        if let Some(from) = divergence_from {
            let mut stale = Vec::new();
            for entry in tx.iter_from(DELAYED_MESSAGE, &u256_bytes(from))? {
                stale.push(entry?.0);
            }
            for key in &stale {
                tx.delete(DELAYED_MESSAGE, key)?;
            }
        }
        for message in to_insert {
            tx.put(DELAYED_MESSAGE, &message.key(), &message.encode_value())?;
        }
        Ok(())
    }

    /// Serialized message bodies for `count` entries starting at `index`.
    /// `None` means the requested range is not (or no longer) present.
    pub fn get_messages(&self, index: U256, count: U256) -> Result<Option<Vec<Bytes>>, CoreError> {
        let view = self.store().begin_read()?;
        let Some(raw) = self.get_messages_impl(view.as_ref(), index, count, None)? else {
            return Ok(None);
        };
        Ok(Some(raw.into_iter().map(|info| info.message).collect()))
    }

    /// Walks batch items from `index`, expanding delayed spans through a
    /// second iterator. With `start_acc` set, the predecessor's accumulator
    /// is validated first; mismatch reports the range as missing.
    pub(crate) fn get_messages_impl<V: ReadView + ?Sized>(
        &self,
        view: &V,
        index: U256,
        count: U256,
        start_acc: Option<H256>,
    ) -> Result<Option<Vec<RawMessageInfo>>, CoreError> {
        let mut messages: Vec<RawMessageInfo> = Vec::new();
        let mut start = index;
        let mut needs_consistency_check = false;
        if start > U256::zero() {
            start -= U256::one();
            needs_consistency_check = true;
        }

        let mut prev_delayed_count = U256::zero();
        let mut delayed_iter = None;
        for entry in view.iter_from(SEQUENCER_BATCH_ITEM, &u256_bytes(start))? {
            let (key, value) = entry?;
            let item = decode_stored_item(&key, &value)?;

            if needs_consistency_check {
                if let Some(acc) = start_acc
                    && item.accumulator != acc
                {
                    return Ok(None);
                }
                needs_consistency_check = false;
                if count.is_zero() {
                    break;
                }
                prev_delayed_count = item.total_delayed_count;
                if item.last_sequence_number >= index {
                    // Resuming inside a delayed span.
                    if item.sequencer_message.is_some() {
                        return Err(CoreError::Corruption(
                            "batch item covering multiple entries carries a message".into(),
                        ));
                    }
                    prev_delayed_count -= item.last_sequence_number + U256::one() - index;
                } else {
                    // The walk starts just after this item.
                    continue;
                }
            }

            if let Some(message) = &item.sequencer_message {
                messages.push(RawMessageInfo {
                    message: message.clone(),
                    sequence_number: item.last_sequence_number,
                    accumulator: item.accumulator,
                });
                if prev_delayed_count != item.total_delayed_count {
                    return Err(CoreError::Corruption(
                        "batch item included both sequencer message and delayed messages".into(),
                    ));
                }
            } else if item.total_delayed_count > prev_delayed_count {
                if delayed_iter.is_none() {
                    delayed_iter =
                        Some(view.iter_from(DELAYED_MESSAGE, &u256_bytes(prev_delayed_count))?);
                }
                if let Some(iter) = delayed_iter.as_mut() {
                    while prev_delayed_count < item.total_delayed_count
                        && U256::from(messages.len()) < count
                    {
                        let Some(delayed_entry) = iter.next() else {
                            break;
                        };
                        let (delayed_key, delayed_value) = delayed_entry?;
                        let delayed_seq = U256::from_big_endian(&delayed_key);
                        if delayed_seq != prev_delayed_count {
                            return Err(CoreError::Corruption(
                                "got wrong delayed message from database".into(),
                            ));
                        }
                        let delayed = DelayedMessage::decode_value(delayed_seq, &delayed_value)?;
                        messages.push(RawMessageInfo {
                            message: delayed.message,
                            sequence_number: delayed_sequence_number(prev_delayed_count),
                            accumulator: item.accumulator,
                        });
                        prev_delayed_count += U256::one();
                    }
                }
                if U256::from(messages.len()) < count
                    && prev_delayed_count != item.total_delayed_count
                {
                    return Err(CoreError::Corruption(
                        "batch item referenced nonexistent delayed messages".into(),
                    ));
                }
            } else {
                return Err(CoreError::Corruption(
                    "batch item advances neither messages nor delayed count".into(),
                ));
            }

            if U256::from(messages.len()) >= count {
                break;
            }
        }

        if needs_consistency_check {
            return Ok(None);
        }
        Ok(Some(messages))
    }

    /// Messages staged for the machine at its current inbox position.
    /// `None` signals that the inbox diverged from `fully_processed_inbox`.
    pub(crate) fn read_next_messages<V: ReadView + ?Sized>(
        &self,
        view: &V,
        fully_processed_inbox: &InboxState,
        count: usize,
    ) -> Result<Option<Vec<MachineMessage>>, CoreError> {
        let raw = self.get_messages_impl(
            view,
            fully_processed_inbox.count,
            U256::from(count),
            Some(fully_processed_inbox.accumulator),
        )?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut messages = Vec::with_capacity(raw.len());
        for info in raw {
            let mut message = InboxMessage::decode(&info.message)?;
            message.inbox_sequence_number = info.sequence_number;
            messages.push(MachineMessage {
                message,
                accumulator: info.accumulator,
            });
        }
        Ok(Some(messages))
    }

    /// Accumulator of the first batch item at or after `sequence_number`.
    pub(crate) fn next_batch_item_accumulator_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
        sequence_number: U256,
    ) -> Result<Option<H256>, CoreError> {
        match view
            .iter_from(SEQUENCER_BATCH_ITEM, &u256_bytes(sequence_number))?
            .next()
            .transpose()?
        {
            Some((_, value)) => Ok(Some(stored_accumulator(&value)?)),
            None => Ok(None),
        }
    }

    /// Whether a machine's fully processed inbox still matches the store.
    pub(crate) fn is_valid<V: ReadView + ?Sized>(
        &self,
        view: &V,
        fully_processed_inbox: &InboxState,
    ) -> Result<bool, CoreError> {
        if fully_processed_inbox.count.is_zero() {
            return Ok(true);
        }
        Ok(self
            .next_batch_item_accumulator_view(view, fully_processed_inbox.count - U256::one())?
            == Some(fully_processed_inbox.accumulator))
    }

    pub fn get_inbox_acc(&self, index: U256) -> Result<Option<H256>, CoreError> {
        let view = self.store().begin_read()?;
        self.next_batch_item_accumulator_view(view.as_ref(), index)
    }

    pub fn get_inbox_acc_pair(
        &self,
        index1: U256,
        index2: U256,
    ) -> Result<Option<(H256, H256)>, CoreError> {
        let view = self.store().begin_read()?;
        let first = self.next_batch_item_accumulator_view(view.as_ref(), index1)?;
        let second = self.next_batch_item_accumulator_view(view.as_ref(), index2)?;
        Ok(first.zip(second))
    }

    pub fn get_delayed_inbox_acc(&self, index: U256) -> Result<Option<H256>, CoreError> {
        let view = self.store().begin_read()?;
        self.delayed_inbox_acc_view(view.as_ref(), index)
    }

    pub(crate) fn delayed_inbox_acc_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
        index: U256,
    ) -> Result<Option<H256>, CoreError> {
        match view.get(DELAYED_MESSAGE, &u256_bytes(index))? {
            Some(value) => Ok(Some(stored_accumulator(&value)?)),
            None => Ok(None),
        }
    }

    /// Raw `key ‖ value` concatenations of every batch item from `index` on.
    pub fn get_sequencer_batch_items(&self, index: U256) -> Result<Vec<Vec<u8>>, CoreError> {
        let view = self.store().begin_read()?;
        let mut items = Vec::new();
        for entry in view.iter_from(SEQUENCER_BATCH_ITEM, &u256_bytes(index))? {
            let (key, value) = entry?;
            let mut bytes = key;
            bytes.extend_from_slice(&value);
            items.push(bytes);
        }
        Ok(items)
    }

    /// L1 block number of the first sequencer message at or after
    /// `sequence_number`.
    pub fn get_sequencer_block_number_at(
        &self,
        sequence_number: U256,
    ) -> Result<Option<U256>, CoreError> {
        let view = self.store().begin_read()?;
        for entry in view.iter_from(SEQUENCER_BATCH_ITEM, &u256_bytes(sequence_number))? {
            let (key, value) = entry?;
            let item = decode_stored_item(&key, &value)?;
            if let Some(message) = &item.sequencer_message {
                return Ok(Some(InboxMessage::extract_block_number(message)?));
            }
        }
        Ok(None)
    }

    /// How many of the given `(sequence_number, accumulator)` pairs match
    /// the stored chain, stopping at the first mismatch. Input must be
    /// sorted by sequence number.
    pub fn count_matching_batch_accs(
        &self,
        seq_nums_and_accs: Vec<(U256, H256)>,
    ) -> Result<usize, CoreError> {
        let Some(first) = seq_nums_and_accs.first() else {
            return Ok(0);
        };
        let first_seq = first.0;
        let view = self.store().begin_read()?;
        let mut matching = 0;
        for (sequence_number, accumulator) in &seq_nums_and_accs {
            if *sequence_number < first_seq {
                return Err(CoreError::UserLogic(
                    "countMatchingBatchAccs received unsorted parameters".into(),
                ));
            }
            match self.next_batch_item_accumulator_view(view.as_ref(), *sequence_number)? {
                Some(have) if have == *accumulator => matching += 1,
                _ => break,
            }
        }
        Ok(matching)
    }

    /// Number of delayed messages eligible for sequencing: every message up
    /// to (and none past) `max_block_number`, found by binary search.
    pub fn get_delayed_messages_to_sequence(
        &self,
        max_block_number: U256,
    ) -> Result<U256, CoreError> {
        let view = self.store().begin_read()?;
        let mut low = self.total_delayed_messages_sequenced_view(view.as_ref())?;
        let mut high = self.delayed_message_entry_inserted_count_view(view.as_ref())?;
        while low != high {
            let mid = (low + high) / U256::from(2u64);
            let row = view
                .get(DELAYED_MESSAGE, &u256_bytes(mid))?
                .ok_or_else(|| CoreError::Corruption("delayed message gap".into()))?;
            let message = DelayedMessage::decode_value(mid, &row)?;
            if message.block_number > max_block_number {
                high = mid;
            } else {
                low = mid + U256::one();
            }
        }
        Ok(low)
    }

    pub fn message_entry_inserted_count(&self) -> Result<U256, CoreError> {
        let view = self.store().begin_read()?;
        self.message_entry_inserted_count_view(view.as_ref())
    }

    pub(crate) fn message_entry_inserted_count_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
    ) -> Result<U256, CoreError> {
        match view.last(SEQUENCER_BATCH_ITEM)? {
            Some((key, _)) => Ok(U256::from_big_endian(&key) + U256::one()),
            None => Ok(U256::zero()),
        }
    }

    pub fn delayed_message_entry_inserted_count(&self) -> Result<U256, CoreError> {
        let view = self.store().begin_read()?;
        self.delayed_message_entry_inserted_count_view(view.as_ref())
    }

    pub(crate) fn delayed_message_entry_inserted_count_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
    ) -> Result<U256, CoreError> {
        match view.last(DELAYED_MESSAGE)? {
            Some((key, _)) => Ok(U256::from_big_endian(&key) + U256::one()),
            None => Ok(U256::zero()),
        }
    }

    pub fn total_delayed_messages_sequenced(&self) -> Result<U256, CoreError> {
        let view = self.store().begin_read()?;
        self.total_delayed_messages_sequenced_view(view.as_ref())
    }

    pub(crate) fn total_delayed_messages_sequenced_view<V: ReadView + ?Sized>(
        &self,
        view: &V,
    ) -> Result<U256, CoreError> {
        match view.last(SEQUENCER_BATCH_ITEM)? {
            Some((key, value)) => Ok(decode_stored_item(&key, &value)?.total_delayed_count),
            None => Ok(U256::zero()),
        }
    }

    /// Minimal witness for a single sequence number within a batch:
    /// the message itself, the preceding item's accumulator, and type-tagged
    /// entries (`0` sequencer, `1` delayed block, `2` end) through
    /// `batch_end_count`. `None` when the store disagrees about the batch
    /// boundary, which usually means a reorg landed in between.
    pub fn gen_inbox_proof(
        &self,
        seq_num: U256,
        batch_index: U256,
        batch_end_count: U256,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let view = self.store().begin_read()?;
        let Some(message_info) =
            self.get_messages_impl(view.as_ref(), seq_num, U256::one(), None)?
        else {
            return Ok(None);
        };
        let Some(target) = message_info.first() else {
            return Ok(None);
        };
        let mut proof = target.message.to_vec();
        append_u256(&mut proof, batch_index);

        let mut start = seq_num;
        let mut recording_prev = false;
        if start > U256::zero() {
            start -= U256::one();
            recording_prev = true;
        }

        // Position a forward walk on the item covering `start`.
        let Some(first_entry) = view
            .iter_rev_from(SEQUENCER_BATCH_ITEM, &u256_bytes(start))?
            .next()
            .transpose()?
        else {
            return Ok(None);
        };

        let mut prev_item = SequencerBatchItem::default();
        let mut first_item = true;
        for entry in view.iter_from(SEQUENCER_BATCH_ITEM, &first_entry.0)? {
            let (key, value) = entry?;
            let item = decode_stored_item(&key, &value)?;

            if item.last_sequence_number >= batch_end_count {
                // We disagree about where the batch ends; probably a reorg.
                return Ok(None);
            }

            if recording_prev {
                prev_item = item;
                recording_prev = false;
                continue;
            }

            if first_item {
                first_item = false;
                let is_delayed = item.sequencer_message.is_none();
                proof.push(is_delayed as u8);
                proof.extend_from_slice(prev_item.accumulator.as_bytes());
                if is_delayed {
                    if prev_item.accumulator.is_zero() {
                        append_u256(&mut proof, U256::zero());
                    } else {
                        append_u256(&mut proof, prev_item.last_sequence_number + U256::one());
                    }
                    append_u256(&mut proof, prev_item.total_delayed_count);
                    append_u256(&mut proof, item.total_delayed_count);
                }
            } else if let Some(message) = &item.sequencer_message {
                proof.push(0);
                let decoded = InboxMessage::decode(message)?;
                let mut prefix = Vec::with_capacity(64);
                append_u256(&mut prefix, decoded.block_number);
                append_u256(&mut prefix, decoded.timestamp);
                proof.extend_from_slice(keccak(&prefix).as_bytes());
                proof.extend_from_slice(keccak(&decoded.payload).as_bytes());
            } else {
                proof.push(1);
                append_u256(&mut proof, prev_item.total_delayed_count);
                append_u256(&mut proof, item.total_delayed_count);
            }

            if item.last_sequence_number + U256::one() == batch_end_count {
                proof.push(2);
                return Ok(Some(proof));
            }
            prev_item = item;
        }

        // The end of the batch was never reached.
        Ok(None)
    }
}
