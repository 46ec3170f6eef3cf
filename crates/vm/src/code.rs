use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use ethereum_types::H256;

use arbrex_common::utils::keccak;
use arbrex_common::wire::{WireError, WireReader, append_u64};

use crate::value::{Value, VmError};

/// One instruction: an opcode byte with an optional immediate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub immediate: Option<Value>,
}

impl Instruction {
    pub fn simple(opcode: u8) -> Self {
        Self {
            opcode,
            immediate: None,
        }
    }
}

/// An immutable sequence of instructions, addressed by segment id.
///
/// Segments reference each other only through ids; lifetime is managed by
/// explicit reference counts in the code-segment store, never by pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSegment {
    pub segment_id: u64,
    pub instructions: Vec<Instruction>,
}

impl CodeSegment {
    pub fn hash(&self) -> H256 {
        keccak(self.encode_to_vec())
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        append_u64(&mut out, self.segment_id);
        append_u64(&mut out, self.instructions.len() as u64);
        for instruction in &self.instructions {
            out.push(instruction.opcode);
            match &instruction.immediate {
                Some(value) => {
                    out.push(1);
                    value.encode_to(&mut out);
                }
                None => out.push(0),
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VmError> {
        let mut reader = WireReader::new(bytes);
        let segment_id = reader.read_u64()?;
        let count = reader.read_u64()? as usize;
        let mut instructions = Vec::with_capacity(count);
        for _ in 0..count {
            let opcode = reader.read_u8()?;
            let immediate = match reader.read_u8()? {
                0 => None,
                1 => Some(Value::decode_from(&mut reader, 0)?),
                other => return Err(VmError::Wire(WireError::InvalidDiscriminator(other))),
            };
            instructions.push(Instruction { opcode, immediate });
        }
        reader.finish().map_err(VmError::Wire)?;
        Ok(Self {
            segment_id,
            instructions,
        })
    }
}

/// Shared arena of code segments, keyed by integer id.
#[derive(Debug)]
pub struct CoreCode {
    segments: RwLock<BTreeMap<u64, Arc<CodeSegment>>>,
    next_segment_id: RwLock<u64>,
}

impl CoreCode {
    pub fn new(next_segment_id: u64) -> Self {
        Self {
            segments: RwLock::new(BTreeMap::new()),
            next_segment_id: RwLock::new(next_segment_id),
        }
    }

    /// Allocates a fresh segment id and installs the instructions under it.
    pub fn add_segment(&self, instructions: Vec<Instruction>) -> Arc<CodeSegment> {
        let mut next = self
            .next_segment_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let segment = Arc::new(CodeSegment {
            segment_id: *next,
            instructions,
        });
        *next += 1;
        self.segments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(segment.segment_id, Arc::clone(&segment));
        segment
    }

    /// Re-installs a segment loaded from storage, keeping ids stable.
    pub fn restore_segment(&self, segment: CodeSegment) -> Arc<CodeSegment> {
        let segment = Arc::new(segment);
        let mut segments = self
            .segments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        segments.insert(segment.segment_id, Arc::clone(&segment));
        let mut next = self
            .next_segment_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if segment.segment_id >= *next {
            *next = segment.segment_id + 1;
        }
        segment
    }

    pub fn segment(&self, segment_id: u64) -> Option<Arc<CodeSegment>> {
        self.segments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&segment_id)
            .cloned()
    }
}

/// A program to boot the genesis machine from: the initial static value plus
/// the instructions of its root code segment.
#[derive(Debug, Clone)]
pub struct Executable {
    pub static_val: Value,
    pub instructions: Vec<Instruction>,
}

impl Executable {
    /// Minimal single-opcode program; enough to drive the replay machine.
    pub fn trivial() -> Self {
        Self {
            static_val: Value::default(),
            instructions: vec![Instruction::simple(0)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    #[test]
    fn segment_round_trip() {
        let segment = CodeSegment {
            segment_id: 3,
            instructions: vec![
                Instruction::simple(0x10),
                Instruction {
                    opcode: 0x20,
                    immediate: Some(Value::Int(U256::from(5u64))),
                },
            ],
        };
        assert_eq!(CodeSegment::decode(&segment.encode_to_vec()).unwrap(), segment);
    }

    #[test]
    fn arena_allocates_monotonic_ids() {
        let code = CoreCode::new(0);
        let first = code.add_segment(vec![Instruction::simple(0)]);
        let second = code.add_segment(vec![Instruction::simple(1)]);
        assert_eq!(first.segment_id, 0);
        assert_eq!(second.segment_id, 1);
        assert_eq!(code.segment(0).unwrap().instructions[0].opcode, 0);
    }

    #[test]
    fn restore_keeps_next_id_ahead() {
        let code = CoreCode::new(0);
        code.restore_segment(CodeSegment {
            segment_id: 7,
            instructions: vec![Instruction::simple(0)],
        });
        let fresh = code.add_segment(vec![Instruction::simple(1)]);
        assert_eq!(fresh.segment_id, 8);
    }
}
