use bytes::Bytes;
use ethereum_types::U256;

use crate::wire::{WireError, WireReader, append_u256};

/// A single inbox message as consumed by the machine:
/// `block_number ‖ timestamp ‖ payload`.
///
/// `inbox_sequence_number` is not part of the serialized body; readers fill
/// it in from the covering batch item (delayed entries get the tagged form).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboxMessage {
    pub block_number: U256,
    pub timestamp: U256,
    pub payload: Bytes,
    pub inbox_sequence_number: U256,
}

impl InboxMessage {
    pub fn new(block_number: U256, timestamp: U256, payload: Bytes) -> Self {
        Self {
            block_number,
            timestamp,
            payload,
            inbox_sequence_number: U256::zero(),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.payload.len());
        append_u256(&mut out, self.block_number);
        append_u256(&mut out, self.timestamp);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        Ok(Self {
            block_number: reader.read_u256()?,
            timestamp: reader.read_u256()?,
            payload: reader.read_tail(),
            inbox_sequence_number: U256::zero(),
        })
    }

    /// Reads only the leading block number, without decoding the body.
    pub fn extract_block_number(bytes: &[u8]) -> Result<U256, WireError> {
        WireReader::new(bytes).read_u256()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let message = InboxMessage::new(
            U256::from(42u64),
            U256::from(1_700_000_000u64),
            Bytes::from_static(b"hello"),
        );
        let decoded = InboxMessage::decode(&message.encode_to_vec()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(
            InboxMessage::extract_block_number(&message.encode_to_vec()).unwrap(),
            U256::from(42u64)
        );
    }
}
