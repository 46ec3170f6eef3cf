//! Table names used by the engine's key-value store.

/// Scalar engine state column family: `[u8; 1..2]` => `[u8; 32]`
/// - key = single tag byte (`0xC4` log inserted, `0xC3` log processed,
///   `0xC2` send inserted, `0xC1` send processed, `0xC0` schema version)
///   or `0x88 ‖ byte(cursor_index)` for log-cursor positions
/// - value = big-endian uint256 scalar
pub const STATE: &str = "state";

/// Checkpoint column family: `[u8; 32]` => `Vec<u8>`
/// - key = big-endian uint256 `arb_gas_used`
/// - value = `CheckpointVariant::encode_to_vec()` (tagged machine state keys
///   or machine output)
pub const CHECKPOINT: &str = "checkpoint";

/// Sequencer batch item column family: `[u8; 32]` => `Vec<u8>`
/// - key = big-endian uint256 `last_sequence_number`
/// - value = `accumulator ‖ total_delayed_count ‖ [sequencer_message]`
pub const SEQUENCER_BATCH_ITEM: &str = "sequencerBatchItem";

/// Delayed message column family: `[u8; 32]` => `Vec<u8>`
/// - key = big-endian uint256 `delayed_sequence_number`
/// - value = `delayed_accumulator ‖ block_number ‖ message_body`
pub const DELAYED_MESSAGE: &str = "delayedMessage";

/// Log column family: `[u8; 32]` => `[u8; 96]`
/// - key = big-endian uint256 `log_index`
/// - value = `value_hash ‖ inbox_count ‖ inbox_accumulator`
pub const LOG: &str = "log";

/// Send column family: `[u8; 32]` => `Vec<u8>`
/// - key = big-endian uint256 `send_index`
/// - value = `inbox_count ‖ inbox_accumulator ‖ body`
pub const SEND: &str = "send";

/// Sideload position column family: `[u8; 32]` => `[u8; 32]`
/// - key = big-endian uint256 L2 block number
/// - value = big-endian uint256 `arb_gas_used`
pub const SIDELOAD: &str = "sideload";

/// Content-addressed machine value column family: `[u8; 32]` => `Vec<u8>`
/// - key = value hash
/// - value = `be64(refcount) ‖ serialized value`
pub const VALUE: &str = "value";

/// Code segment column family: `[u8; 8]` => `Vec<u8>`
/// - key = big-endian u64 segment id
/// - value = `be64(refcount) ‖ serialized segment`
pub const CODE_SEGMENT: &str = "codeSegment";

pub const TABLES: [&str; 9] = [
    STATE,
    CHECKPOINT,
    SEQUENCER_BATCH_ITEM,
    DELAYED_MESSAGE,
    LOG,
    SEND,
    SIDELOAD,
    VALUE,
    CODE_SEGMENT,
];
