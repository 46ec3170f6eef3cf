mod inbox;
mod machine;
mod message;

pub use inbox::{
    DelayedMessage, InboxState, LogRecord, RawMessageInfo, SendRecord, SequencerBatchItem,
    delayed_sequence_number,
};
pub use machine::{CheckpointVariant, CodePointRef, MachineCpuState, MachineOutput,
    MachineStateKeys};
pub use message::InboxMessage;
