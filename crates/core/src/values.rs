//! Content-addressed machine values and code segments with reference
//! counting, plus the rotating value-load cache.
//!
//! Rows are `be64(refcount) ‖ payload`. A checkpoint save increments the
//! refcount of everything it references; reorg deletion decrements. A row
//! disappears when its count reaches zero, which is what keeps invariant
//! "every live checkpoint/log reference has refcount ≥ 1" observable.

use ethereum_types::H256;
use rustc_hash::FxHashMap;
use tracing::warn;

use arbrex_storage::api::tables::{CODE_SEGMENT, VALUE};
use arbrex_storage::api::{ReadView, WriteTransaction};
use arbrex_vm::{CodeSegment, Value};

use crate::error::CoreError;

const REFCOUNT_LEN: usize = 8;

fn read_refcount(row: &[u8]) -> Result<u64, CoreError> {
    let bytes: [u8; REFCOUNT_LEN] = row
        .get(..REFCOUNT_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| CoreError::Corruption("refcounted row shorter than prefix".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn bump_refcount(row: &mut [u8], refcount: u64) {
    row[..REFCOUNT_LEN].copy_from_slice(&refcount.to_be_bytes());
}

/// Stores the value (or bumps its refcount) and returns its hash.
pub(crate) fn save_value<T: WriteTransaction + ?Sized>(
    tx: &mut T,
    value: &Value,
) -> Result<H256, CoreError> {
    let hash = value.hash();
    match tx.get(VALUE, hash.as_bytes())? {
        Some(mut row) => {
            let refcount = read_refcount(&row)?;
            bump_refcount(&mut row, refcount + 1);
            tx.put(VALUE, hash.as_bytes(), &row)?;
        }
        None => {
            let mut row = 1u64.to_be_bytes().to_vec();
            value.encode_to(&mut row);
            tx.put(VALUE, hash.as_bytes(), &row)?;
        }
    }
    Ok(hash)
}

/// Drops one reference; the row is deleted when the last reference goes.
pub(crate) fn release_value<T: WriteTransaction + ?Sized>(
    tx: &mut T,
    hash: H256,
) -> Result<(), CoreError> {
    let Some(mut row) = tx.get(VALUE, hash.as_bytes())? else {
        warn!("released value {hash:#x} not present in value store");
        return Ok(());
    };
    let refcount = read_refcount(&row)?;
    if refcount <= 1 {
        tx.delete(VALUE, hash.as_bytes())?;
    } else {
        bump_refcount(&mut row, refcount - 1);
        tx.put(VALUE, hash.as_bytes(), &row)?;
    }
    Ok(())
}

/// Loads a value by hash. `lazy_load` skips warming the cache, keeping
/// archive queries from displacing the core machine's working set.
pub(crate) fn get_value<V: ReadView + ?Sized>(
    view: &V,
    hash: H256,
    cache: &mut ValueCache,
    lazy_load: bool,
) -> Result<Value, CoreError> {
    if let Some(value) = cache.get(&hash) {
        return Ok(value);
    }
    let row = view
        .get(VALUE, hash.as_bytes())?
        .ok_or_else(|| CoreError::Corruption(format!("missing value {hash:#x}")))?;
    let value = Value::decode(&row[REFCOUNT_LEN.min(row.len())..])?;
    if !lazy_load {
        cache.insert(hash, value.clone());
    }
    Ok(value)
}

pub(crate) fn value_refcount<V: ReadView + ?Sized>(view: &V, hash: H256) -> Result<u64, CoreError> {
    match view.get(VALUE, hash.as_bytes())? {
        Some(row) => read_refcount(&row),
        None => Ok(0),
    }
}

/// Commits one more generation's reference to a code segment.
pub(crate) fn commit_code_segment<T: WriteTransaction + ?Sized>(
    tx: &mut T,
    segment: &CodeSegment,
) -> Result<(), CoreError> {
    let key = segment.segment_id.to_be_bytes();
    match tx.get(CODE_SEGMENT, &key)? {
        Some(mut row) => {
            let refcount = read_refcount(&row)?;
            bump_refcount(&mut row, refcount + 1);
            tx.put(CODE_SEGMENT, &key, &row)?;
        }
        None => {
            let mut row = 1u64.to_be_bytes().to_vec();
            row.extend_from_slice(&segment.encode_to_vec());
            tx.put(CODE_SEGMENT, &key, &row)?;
        }
    }
    Ok(())
}

pub(crate) fn release_code_segment<T: WriteTransaction + ?Sized>(
    tx: &mut T,
    segment_id: u64,
) -> Result<(), CoreError> {
    let key = segment_id.to_be_bytes();
    let Some(mut row) = tx.get(CODE_SEGMENT, &key)? else {
        warn!("released code segment {segment_id} not present");
        return Ok(());
    };
    let refcount = read_refcount(&row)?;
    if refcount <= 1 {
        tx.delete(CODE_SEGMENT, &key)?;
    } else {
        bump_refcount(&mut row, refcount - 1);
        tx.put(CODE_SEGMENT, &key, &row)?;
    }
    Ok(())
}

pub(crate) fn load_code_segment<V: ReadView + ?Sized>(
    view: &V,
    segment_id: u64,
) -> Result<CodeSegment, CoreError> {
    let row = view
        .get(CODE_SEGMENT, &segment_id.to_be_bytes())?
        .ok_or_else(|| CoreError::Corruption(format!("missing code segment {segment_id}")))?;
    Ok(CodeSegment::decode(&row[REFCOUNT_LEN.min(row.len())..])?)
}

/// First unused segment id: one past the greatest stored id.
pub(crate) fn next_segment_id<V: ReadView + ?Sized>(view: &V) -> Result<u64, CoreError> {
    match view.last(CODE_SEGMENT)? {
        Some((key, _)) => {
            let bytes: [u8; 8] = key.as_slice().try_into().map_err(|_| {
                CoreError::Corruption("code segment key is not 8 bytes".into())
            })?;
            Ok(u64::from_be_bytes(bytes) + 1)
        }
        None => Ok(0),
    }
}

/// Rotating generations of loaded values. `next_cache` retires the oldest
/// generation wholesale; entries hit in an old generation are promoted so
/// the working set survives rotation.
#[derive(Debug)]
pub struct ValueCache {
    generations: Vec<FxHashMap<H256, Value>>,
    current: usize,
}

impl ValueCache {
    pub fn new(generation_count: usize) -> Self {
        Self {
            generations: vec![FxHashMap::default(); generation_count.max(1)],
            current: 0,
        }
    }

    pub fn get(&mut self, hash: &H256) -> Option<Value> {
        let generation_count = self.generations.len();
        for age in 0..generation_count {
            let index = (self.current + generation_count - age) % generation_count;
            if let Some(value) = self.generations[index].get(hash).cloned() {
                if index != self.current {
                    self.generations[self.current].insert(*hash, value.clone());
                }
                return Some(value);
            }
        }
        None
    }

    pub fn insert(&mut self, hash: H256, value: Value) {
        self.generations[self.current].insert(hash, value);
    }

    /// Rotates to the next generation, clearing what it held.
    pub fn next_cache(&mut self) {
        self.current = (self.current + 1) % self.generations.len();
        self.generations[self.current].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbrex_storage::Store;
    use arbrex_vm::Instruction;
    use ethereum_types::U256;

    #[test]
    fn value_refcounts_balance() {
        let store = Store::in_memory();
        let value = Value::Int(U256::from(7u64));
        let hash = value.hash();

        let mut tx = store.begin_write().unwrap();
        save_value(tx.as_mut(), &value).unwrap();
        save_value(tx.as_mut(), &value).unwrap();
        tx.commit().unwrap();

        let view = store.begin_read().unwrap();
        assert_eq!(value_refcount(view.as_ref(), hash).unwrap(), 2);
        drop(view);

        let mut tx = store.begin_write().unwrap();
        release_value(tx.as_mut(), hash).unwrap();
        release_value(tx.as_mut(), hash).unwrap();
        tx.commit().unwrap();

        let view = store.begin_read().unwrap();
        assert_eq!(value_refcount(view.as_ref(), hash).unwrap(), 0);
        let mut cache = ValueCache::new(1);
        assert!(get_value(view.as_ref(), hash, &mut cache, false).is_err());
    }

    #[test]
    fn value_round_trips_through_store() {
        let store = Store::in_memory();
        let value = Value::Tuple(vec![Value::Int(U256::one())]);
        let mut tx = store.begin_write().unwrap();
        let hash = save_value(tx.as_mut(), &value).unwrap();
        tx.commit().unwrap();

        let view = store.begin_read().unwrap();
        let mut cache = ValueCache::new(2);
        assert_eq!(
            get_value(view.as_ref(), hash, &mut cache, false).unwrap(),
            value
        );
        // Second read hits the cache.
        assert_eq!(
            get_value(view.as_ref(), hash, &mut cache, false).unwrap(),
            value
        );
    }

    #[test]
    fn segment_ids_continue_after_restart() {
        let store = Store::in_memory();
        let segment = CodeSegment {
            segment_id: 4,
            instructions: vec![Instruction::simple(0)],
        };
        let mut tx = store.begin_write().unwrap();
        commit_code_segment(tx.as_mut(), &segment).unwrap();
        tx.commit().unwrap();

        let view = store.begin_read().unwrap();
        assert_eq!(next_segment_id(view.as_ref()).unwrap(), 5);
        assert_eq!(load_code_segment(view.as_ref(), 4).unwrap(), segment);
    }

    #[test]
    fn cache_rotation_keeps_promoted_entries() {
        let mut cache = ValueCache::new(2);
        let value = Value::Int(U256::from(3u64));
        let hash = value.hash();
        cache.insert(hash, value.clone());
        cache.next_cache();
        // Hit in the old generation promotes into the current one.
        assert_eq!(cache.get(&hash), Some(value.clone()));
        cache.next_cache();
        assert_eq!(cache.get(&hash), Some(value));
    }
}
