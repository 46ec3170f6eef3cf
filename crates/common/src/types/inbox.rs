use bytes::Bytes;
use ethereum_types::{H256, U256};

use crate::utils::{keccak, keccak_concat};
use crate::wire::{WireError, WireReader, append_h256, append_u256, u256_bytes};

/// Position in the sequencer inbox: how many entries have been consumed and
/// the running accumulator over all of them.
///
/// Two states with equal `count` but different `accumulator` denote divergent
/// histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InboxState {
    pub count: U256,
    pub accumulator: H256,
}

impl InboxState {
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        append_u256(out, self.count);
        append_h256(out, self.accumulator);
    }

    pub fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            count: reader.read_u256()?,
            accumulator: reader.read_h256()?,
        })
    }
}

/// Tags a delayed message's position with the marker bit callers use to tell
/// delayed entries apart from sequencer entries. The representation is
/// load-bearing for downstream consumers; do not change it.
pub fn delayed_sequence_number(delayed_position: U256) -> U256 {
    delayed_position | (U256::one() << 255)
}

/// One atomic unit of the sequencer inbox.
///
/// An item either carries a single sequencer message or advances
/// `total_delayed_count` past a span of delayed messages, never both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequencerBatchItem {
    pub last_sequence_number: U256,
    pub accumulator: H256,
    pub total_delayed_count: U256,
    pub sequencer_message: Option<Bytes>,
}

impl SequencerBatchItem {
    /// Storage key: the big-endian last sequence number.
    pub fn key(&self) -> [u8; 32] {
        u256_bytes(self.last_sequence_number)
    }

    /// Storage row: `accumulator ‖ total_delayed_count ‖ [sequencer_message]`.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            64 + self.sequencer_message.as_ref().map_or(0, |m| m.len()),
        );
        append_h256(&mut out, self.accumulator);
        append_u256(&mut out, self.total_delayed_count);
        if let Some(message) = &self.sequencer_message {
            out.extend_from_slice(message);
        }
        out
    }

    pub fn decode_value(last_sequence_number: U256, value: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(value);
        let accumulator = reader.read_h256()?;
        let total_delayed_count = reader.read_u256()?;
        let sequencer_message = if reader.is_empty() {
            None
        } else {
            Some(reader.read_tail())
        };
        Ok(Self {
            last_sequence_number,
            accumulator,
            total_delayed_count,
            sequencer_message,
        })
    }

    /// Key-prefixed form used on the delivery path and by the raw item dump.
    pub fn to_delivery_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.key());
        out.extend_from_slice(&self.encode_value());
        out
    }

    pub fn from_delivery_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let last_sequence_number = reader.read_u256()?;
        Self::decode_value(last_sequence_number, &bytes[32..])
    }

    /// Recomputes the chained accumulator for this item.
    ///
    /// `delayed_acc` is the delayed-inbox accumulator at
    /// `total_delayed_count - 1` and is only read for delayed-span items.
    /// The caller has already validated that the item carries a message or
    /// strictly advances the delayed count.
    pub fn compute_accumulator(
        &self,
        prev_acc: H256,
        prev_delayed_count: U256,
        delayed_acc: H256,
    ) -> H256 {
        match &self.sequencer_message {
            Some(message) => keccak_concat([
                b"Sequencer message:".as_slice(),
                prev_acc.as_bytes(),
                &u256_bytes(self.last_sequence_number),
                keccak(message).as_bytes(),
            ]),
            None => {
                let span = self.total_delayed_count.saturating_sub(prev_delayed_count);
                let first_sequence_number =
                    (self.last_sequence_number + U256::one()).saturating_sub(span);
                keccak_concat([
                    b"Delayed messages:".as_slice(),
                    prev_acc.as_bytes(),
                    &u256_bytes(first_sequence_number),
                    &u256_bytes(prev_delayed_count),
                    &u256_bytes(self.total_delayed_count),
                    delayed_acc.as_bytes(),
                ])
            }
        }
    }
}

/// An L1-originated message queued until a sequencer item consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DelayedMessage {
    pub delayed_sequence_number: U256,
    pub delayed_accumulator: H256,
    pub block_number: U256,
    pub message: Bytes,
}

impl DelayedMessage {
    pub fn key(&self) -> [u8; 32] {
        u256_bytes(self.delayed_sequence_number)
    }

    /// Storage row: `delayed_accumulator ‖ block_number ‖ message_body`.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.message.len());
        append_h256(&mut out, self.delayed_accumulator);
        append_u256(&mut out, self.block_number);
        out.extend_from_slice(&self.message);
        out
    }

    pub fn decode_value(delayed_sequence_number: U256, value: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(value);
        Ok(Self {
            delayed_sequence_number,
            delayed_accumulator: reader.read_h256()?,
            block_number: reader.read_u256()?,
            message: reader.read_tail(),
        })
    }

    pub fn to_delivery_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.key());
        out.extend_from_slice(&self.encode_value());
        out
    }

    pub fn from_delivery_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let delayed_sequence_number = reader.read_u256()?;
        Self::decode_value(delayed_sequence_number, &bytes[32..])
    }

    /// Delayed-inbox chain step: `keccak(prev_acc ‖ keccak(body))`.
    pub fn chain_accumulator(prev_acc: H256, body: &[u8]) -> H256 {
        keccak_concat([prev_acc.as_bytes(), keccak(body).as_bytes()])
    }
}

/// One stored log row: the emitted value by hash plus the inbox position at
/// emission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub value_hash: H256,
    pub inbox: InboxState,
}

impl LogRecord {
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        append_h256(&mut out, self.value_hash);
        self.inbox.encode_to(&mut out);
        out
    }

    pub fn decode_value(value: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(value);
        let record = Self {
            value_hash: reader.read_h256()?,
            inbox: InboxState::decode_from(&mut reader)?,
        };
        reader.finish()?;
        Ok(record)
    }
}

/// One stored send row: inbox metadata prefix followed by the opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub inbox: InboxState,
    pub body: Bytes,
}

impl SendRecord {
    pub fn encode_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        self.inbox.encode_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode_value(value: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(value);
        Ok(Self {
            inbox: InboxState::decode_from(&mut reader)?,
            body: reader.read_tail(),
        })
    }
}

/// A raw inbox entry as surfaced to message readers: serialized message
/// bytes, the (possibly delayed-tagged) sequence number, and the accumulator
/// of the covering batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessageInfo {
    pub message: Bytes,
    pub sequence_number: U256,
    pub accumulator: H256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_item_row_round_trip() {
        let item = SequencerBatchItem {
            last_sequence_number: U256::from(7u64),
            accumulator: keccak(b"acc"),
            total_delayed_count: U256::from(3u64),
            sequencer_message: Some(Bytes::from_static(b"message body")),
        };
        let decoded =
            SequencerBatchItem::decode_value(item.last_sequence_number, &item.encode_value())
                .unwrap();
        assert_eq!(decoded, item);

        let delivered = SequencerBatchItem::from_delivery_bytes(&item.to_delivery_bytes()).unwrap();
        assert_eq!(delivered, item);
    }

    #[test]
    fn batch_item_without_message_has_no_tail() {
        let item = SequencerBatchItem {
            last_sequence_number: U256::zero(),
            accumulator: keccak(b"acc"),
            total_delayed_count: U256::from(1u64),
            sequencer_message: None,
        };
        let value = item.encode_value();
        assert_eq!(value.len(), 64);
        assert_eq!(
            SequencerBatchItem::decode_value(U256::zero(), &value).unwrap(),
            item
        );
    }

    #[test]
    fn delayed_message_round_trip() {
        let message = DelayedMessage {
            delayed_sequence_number: U256::from(5u64),
            delayed_accumulator: keccak(b"delayed"),
            block_number: U256::from(100u64),
            message: Bytes::from_static(b"payload"),
        };
        let decoded = DelayedMessage::from_delivery_bytes(&message.to_delivery_bytes()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn accumulators_differ_by_item_kind() {
        let with_message = SequencerBatchItem {
            last_sequence_number: U256::zero(),
            accumulator: H256::zero(),
            total_delayed_count: U256::zero(),
            sequencer_message: Some(Bytes::from_static(b"x")),
        };
        let delayed_span = SequencerBatchItem {
            last_sequence_number: U256::zero(),
            accumulator: H256::zero(),
            total_delayed_count: U256::one(),
            sequencer_message: None,
        };
        let delayed_acc = DelayedMessage::chain_accumulator(H256::zero(), b"x");
        assert_ne!(
            with_message.compute_accumulator(H256::zero(), U256::zero(), H256::zero()),
            delayed_span.compute_accumulator(H256::zero(), U256::zero(), delayed_acc),
        );
    }

    #[test]
    fn delayed_marker_sets_top_bit() {
        let tagged = delayed_sequence_number(U256::from(9u64));
        assert_eq!(tagged & (U256::one() << 255), U256::one() << 255);
        assert_eq!(tagged & U256::from(u64::MAX), U256::from(9u64));
    }
}
