//! Scalar engine state stored under fixed tag bytes.
//!
//! The tag values are compatibility-critical: a database written by one
//! build must be readable by the next.

use ethereum_types::U256;

use arbrex_common::wire::u256_bytes;
use arbrex_storage::api::tables::STATE;
use arbrex_storage::api::{ReadView, WriteTransaction};

use crate::error::CoreError;

pub(crate) const LOG_INSERTED_KEY: [u8; 1] = [0xC4];
pub(crate) const LOG_PROCESSED_KEY: [u8; 1] = [0xC3];
pub(crate) const SEND_INSERTED_KEY: [u8; 1] = [0xC2];
pub(crate) const SEND_PROCESSED_KEY: [u8; 1] = [0xC1];
pub(crate) const SCHEMA_VERSION_KEY: [u8; 1] = [0xC0];
pub(crate) const LOGS_CURSOR_CURRENT_PREFIX: u8 = 0x88;

pub(crate) const SCHEMA_VERSION: u64 = 3;

pub(crate) fn logs_cursor_current_key(cursor_index: usize) -> [u8; 2] {
    [LOGS_CURSOR_CURRENT_PREFIX, cursor_index as u8]
}

pub(crate) fn state_get_u256<V: ReadView + ?Sized>(
    view: &V,
    key: &[u8],
) -> Result<Option<U256>, CoreError> {
    Ok(view
        .get(STATE, key)?
        .map(|bytes| U256::from_big_endian(&bytes)))
}

pub(crate) fn state_put_u256<T: WriteTransaction + ?Sized>(
    tx: &mut T,
    key: &[u8],
    value: U256,
) -> Result<(), CoreError> {
    tx.put(STATE, key, &u256_bytes(value))?;
    Ok(())
}

/// Reads a required scalar; absence means the database was never
/// initialized or has been damaged.
pub(crate) fn state_require_u256<V: ReadView + ?Sized>(
    view: &V,
    key: &[u8],
) -> Result<U256, CoreError> {
    state_get_u256(view, key)?.ok_or_else(|| {
        CoreError::Corruption(format!("missing engine state scalar {key:02x?}"))
    })
}
