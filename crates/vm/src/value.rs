use bytes::Bytes;
use ethereum_types::{H256, U256};

use arbrex_common::utils::keccak;
use arbrex_common::wire::{WireError, WireReader, append_u256};

const TAG_INT: u8 = 0;
const TAG_BUFFER: u8 = 1;
const TAG_TUPLE: u8 = 2;

/// Tuples are capped so a corrupt row cannot allocate unboundedly.
const MAX_TUPLE_LEN: usize = 8;
const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("value format error: {0}")]
    Wire(#[from] WireError),

    #[error("tuple of length {0} exceeds maximum")]
    TupleTooLong(usize),

    #[error("value nesting exceeds maximum depth")]
    TooDeep,
}

/// A machine value: content-addressed, immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(U256),
    Buffer(Bytes),
    Tuple(Vec<Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Tuple(Vec::new())
    }
}

impl Value {
    /// Content hash. Two values are interchangeable iff their hashes match.
    pub fn hash(&self) -> H256 {
        match self {
            Value::Int(value) => {
                let mut preimage = vec![TAG_INT];
                append_u256(&mut preimage, *value);
                keccak(&preimage)
            }
            Value::Buffer(data) => {
                let mut preimage = vec![TAG_BUFFER];
                preimage.extend_from_slice(data);
                keccak(&preimage)
            }
            Value::Tuple(items) => {
                let mut preimage = vec![TAG_TUPLE, items.len() as u8];
                for item in items {
                    preimage.extend_from_slice(item.hash().as_bytes());
                }
                keccak(&preimage)
            }
        }
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(value) => {
                out.push(TAG_INT);
                append_u256(out, *value);
            }
            Value::Buffer(data) => {
                out.push(TAG_BUFFER);
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
            }
            Value::Tuple(items) => {
                out.push(TAG_TUPLE);
                out.push(items.len() as u8);
                for item in items {
                    item.encode_to(out);
                }
            }
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VmError> {
        let mut reader = WireReader::new(bytes);
        let value = Self::decode_from(&mut reader, 0)?;
        reader.finish().map_err(VmError::Wire)?;
        Ok(value)
    }

    pub fn decode_from(reader: &mut WireReader<'_>, depth: usize) -> Result<Self, VmError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(VmError::TooDeep);
        }
        match reader.read_u8()? {
            TAG_INT => Ok(Value::Int(reader.read_u256()?)),
            TAG_BUFFER => {
                let len = u32::from_be_bytes(
                    reader.read_bytes(4)?.try_into().unwrap_or([0; 4]),
                ) as usize;
                Ok(Value::Buffer(Bytes::copy_from_slice(
                    reader.read_bytes(len)?,
                )))
            }
            TAG_TUPLE => {
                let len = reader.read_u8()? as usize;
                if len > MAX_TUPLE_LEN {
                    return Err(VmError::TupleTooLong(len));
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Self::decode_from(reader, depth + 1)?);
                }
                Ok(Value::Tuple(items))
            }
            other => Err(VmError::Wire(WireError::InvalidDiscriminator(other))),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_nested_value() {
        let value = Value::Tuple(vec![
            Value::Int(U256::from(9u64)),
            Value::Buffer(Bytes::from_static(b"buf")),
            Value::Tuple(vec![Value::Int(U256::zero())]),
        ]);
        assert_eq!(Value::decode(&value.encode_to_vec()).unwrap(), value);
    }

    #[test]
    fn hash_distinguishes_shape() {
        let int = Value::Int(U256::zero());
        let tuple = Value::Tuple(vec![Value::Int(U256::zero())]);
        assert_ne!(int.hash(), tuple.hash());
        assert_ne!(Value::Tuple(Vec::new()).hash(), int.hash());
    }

    #[test]
    fn oversized_tuple_is_rejected() {
        let mut bytes = vec![2u8, 9];
        bytes.extend(std::iter::repeat_n(0u8, 9 * 33));
        assert!(matches!(
            Value::decode(&bytes),
            Err(VmError::TupleTooLong(9))
        ));
    }
}
