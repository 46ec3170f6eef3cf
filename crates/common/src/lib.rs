//! Shared types for the arbrex rollup engine.
//!
//! This crate holds the wire-visible data model: inbox accumulators,
//! sequencer batch items, delayed messages, machine outputs and state keys,
//! and the fixed-width big-endian codecs used to persist them. Everything
//! here is storage-format compatible code; engine behavior lives in
//! `arbrex-core`.

pub mod types;
pub mod utils;
pub mod wire;

pub use ethereum_types::{H256, U256};
