//! Deterministic replay machine for the arbrex engine.
//!
//! The machine consumes inbox messages and produces logs, sends, and
//! sideload pauses with exact gas accounting. Its state decomposes into
//! content-hashed components (static value, register, stacks, code
//! segments), which is what the checkpoint store persists and rebuilds.
//! The engine only depends on the operations exposed here; the per-message
//! transition is deliberately simple.

mod code;
mod machine;
mod message;
mod value;

pub use code::{CodeSegment, CoreCode, Executable, Instruction};
pub use machine::{
    Assertion, Machine, MachineEmission, MachineExecutionConfig, MachineRunStatus,
    MachineState, MESSAGE_BASE_GAS, MESSAGE_BYTE_GAS, SEND_MARKER,
};
pub use message::MachineMessage;
pub use value::{Value, VmError};
