use ethereum_types::{H256, U256};

use crate::types::InboxState;
use crate::utils::keccak;
use crate::wire::{WireError, WireReader, append_h256, append_u64, append_u256};

/// The observable suffix of machine state: everything the engine indexes,
/// validates, and reorgs by.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineOutput {
    pub fully_processed_inbox: InboxState,
    pub arb_gas_used: U256,
    pub log_count: U256,
    pub send_count: U256,
    pub l1_block_number: U256,
    pub l2_block_number: U256,
    pub last_inbox_timestamp: U256,
    pub last_sideload: Option<U256>,
}

impl MachineOutput {
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        self.fully_processed_inbox.encode_to(out);
        append_u256(out, self.arb_gas_used);
        append_u256(out, self.log_count);
        append_u256(out, self.send_count);
        append_u256(out, self.l1_block_number);
        append_u256(out, self.l2_block_number);
        append_u256(out, self.last_inbox_timestamp);
        match self.last_sideload {
            Some(block) => {
                out.push(1);
                append_u256(out, block);
            }
            None => out.push(0),
        }
    }

    pub fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let fully_processed_inbox = InboxState::decode_from(reader)?;
        let arb_gas_used = reader.read_u256()?;
        let log_count = reader.read_u256()?;
        let send_count = reader.read_u256()?;
        let l1_block_number = reader.read_u256()?;
        let l2_block_number = reader.read_u256()?;
        let last_inbox_timestamp = reader.read_u256()?;
        let last_sideload = match reader.read_u8()? {
            0 => None,
            1 => Some(reader.read_u256()?),
            other => return Err(WireError::InvalidDiscriminator(other)),
        };
        Ok(Self {
            fully_processed_inbox,
            arb_gas_used,
            log_count,
            send_count,
            l1_block_number,
            l2_block_number,
            last_inbox_timestamp,
            last_sideload,
        })
    }
}

/// Reference to an instruction: code segment id plus offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodePointRef {
    pub segment: u64,
    pub offset: u64,
}

impl CodePointRef {
    fn encode_to(&self, out: &mut Vec<u8>) {
        append_u64(out, self.segment);
        append_u64(out, self.offset);
    }

    fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            segment: reader.read_u64()?,
            offset: reader.read_u64()?,
        })
    }
}

/// CPU halt state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MachineCpuState {
    #[default]
    Extensive = 0,
    Errored = 1,
    Halted = 2,
}

impl MachineCpuState {
    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(Self::Extensive),
            1 => Ok(Self::Errored),
            2 => Ok(Self::Halted),
            other => Err(WireError::InvalidDiscriminator(other)),
        }
    }
}

/// A machine state reduced to content hashes: enough to rebuild the full
/// machine from the value store, and enough to identify it (`machine_hash`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStateKeys {
    pub static_hash: H256,
    pub register_hash: H256,
    pub datastack_hash: H256,
    pub auxstack_hash: H256,
    pub pc: CodePointRef,
    pub err_pc: CodePointRef,
    pub arb_gas_remaining: U256,
    pub cpu_state: MachineCpuState,
    pub output: MachineOutput,
}

impl MachineStateKeys {
    pub fn machine_hash(&self) -> H256 {
        let mut preimage = Vec::with_capacity(193);
        append_h256(&mut preimage, self.static_hash);
        append_h256(&mut preimage, self.register_hash);
        append_h256(&mut preimage, self.datastack_hash);
        append_h256(&mut preimage, self.auxstack_hash);
        self.pc.encode_to(&mut preimage);
        self.err_pc.encode_to(&mut preimage);
        append_u256(&mut preimage, self.arb_gas_remaining);
        preimage.push(self.cpu_state as u8);
        keccak(&preimage)
    }

    fn encode_to(&self, out: &mut Vec<u8>) {
        append_h256(out, self.static_hash);
        append_h256(out, self.register_hash);
        append_h256(out, self.datastack_hash);
        append_h256(out, self.auxstack_hash);
        self.pc.encode_to(out);
        self.err_pc.encode_to(out);
        append_u256(out, self.arb_gas_remaining);
        out.push(self.cpu_state as u8);
        self.output.encode_to(out);
    }

    fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            static_hash: reader.read_h256()?,
            register_hash: reader.read_h256()?,
            datastack_hash: reader.read_h256()?,
            auxstack_hash: reader.read_h256()?,
            pc: CodePointRef::decode_from(reader)?,
            err_pc: CodePointRef::decode_from(reader)?,
            arb_gas_remaining: reader.read_u256()?,
            cpu_state: MachineCpuState::from_byte(reader.read_u8()?)?,
            output: MachineOutput::decode_from(reader)?,
        })
    }
}

/// A stored checkpoint is either a full machine (state keys) or just the
/// observable output. The discriminator byte is part of the storage format;
/// never rely on payload length to tell the variants apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointVariant {
    Light(MachineOutput),
    Full(MachineStateKeys),
}

const CHECKPOINT_LIGHT: u8 = 0;
const CHECKPOINT_FULL: u8 = 1;

impl CheckpointVariant {
    pub fn output(&self) -> &MachineOutput {
        match self {
            Self::Light(output) => output,
            Self::Full(keys) => &keys.output,
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Light(output) => {
                out.push(CHECKPOINT_LIGHT);
                output.encode_to(&mut out);
            }
            Self::Full(keys) => {
                out.push(CHECKPOINT_FULL);
                keys.encode_to(&mut out);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);
        let variant = match reader.read_u8()? {
            CHECKPOINT_LIGHT => Self::Light(MachineOutput::decode_from(&mut reader)?),
            CHECKPOINT_FULL => Self::Full(MachineStateKeys::decode_from(&mut reader)?),
            other => return Err(WireError::InvalidDiscriminator(other)),
        };
        reader.finish()?;
        Ok(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys() -> MachineStateKeys {
        MachineStateKeys {
            static_hash: keccak(b"static"),
            register_hash: keccak(b"register"),
            datastack_hash: keccak(b"datastack"),
            auxstack_hash: keccak(b"auxstack"),
            pc: CodePointRef {
                segment: 0,
                offset: 3,
            },
            err_pc: CodePointRef::default(),
            arb_gas_remaining: U256::MAX,
            cpu_state: MachineCpuState::Extensive,
            output: MachineOutput {
                fully_processed_inbox: InboxState {
                    count: U256::from(4u64),
                    accumulator: keccak(b"acc"),
                },
                arb_gas_used: U256::from(400_000u64),
                log_count: U256::from(4u64),
                send_count: U256::one(),
                l1_block_number: U256::from(10u64),
                l2_block_number: U256::from(4u64),
                last_inbox_timestamp: U256::from(1_700_000_000u64),
                last_sideload: Some(U256::from(3u64)),
            },
        }
    }

    #[test]
    fn checkpoint_variants_round_trip() {
        let keys = sample_keys();
        let full = CheckpointVariant::Full(keys.clone());
        assert_eq!(
            CheckpointVariant::decode(&full.encode_to_vec()).unwrap(),
            full
        );

        let light = CheckpointVariant::Light(keys.output);
        assert_eq!(
            CheckpointVariant::decode(&light.encode_to_vec()).unwrap(),
            light
        );
    }

    #[test]
    fn variant_discriminator_is_checked() {
        let mut bytes = CheckpointVariant::Full(sample_keys()).encode_to_vec();
        bytes[0] = 9;
        assert!(matches!(
            CheckpointVariant::decode(&bytes),
            Err(WireError::InvalidDiscriminator(9))
        ));
    }

    #[test]
    fn machine_hash_tracks_components() {
        let keys = sample_keys();
        let mut other = keys.clone();
        other.pc.offset += 1;
        assert_ne!(keys.machine_hash(), other.machine_hash());

        // The hash binds the machine, not its output.
        let mut same_machine = keys.clone();
        same_machine.output.log_count += U256::one();
        assert_eq!(keys.machine_hash(), same_machine.machine_hash());
    }
}
