//! Tiered in-memory cache of machine snapshots, keyed by gas position.
//!
//! Three layers: `basic` is a bounded ring fed by driver progress, `lru`
//! holds execution-cursor results, and `timed` holds the machine at every
//! recent sideload, evicted by wall-clock age.

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ethereum_types::U256;
use lru::LruCache;

use arbrex_vm::Machine;

/// Outcome of a starting-point lookup for a target gas position.
#[derive(Debug)]
pub(crate) enum CacheLookup {
    /// Cached snapshot; closest predecessor of the target.
    Machine(Box<Machine>),
    /// The database checkpoint offered by the caller is the better start.
    UseDatabase,
    /// Every candidate is further from the target than the execution bound
    /// allows.
    TooMuchExecution,
    /// Keep whatever the caller already has (or nothing was found).
    Nothing,
}

#[derive(Debug)]
struct TimedEntry {
    inserted_at: Instant,
    machine: Arc<Machine>,
}

#[derive(Debug)]
pub(crate) struct CombinedMachineCache {
    basic: VecDeque<Arc<Machine>>,
    basic_size: usize,
    lru: LruCache<U256, Arc<Machine>>,
    timed: BTreeMap<U256, TimedEntry>,
    expiration: Duration,
    load_gas_cost: U256,
    max_execution_gas: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Current,
    Cache,
    Database,
}

impl CombinedMachineCache {
    pub(crate) fn new(
        basic_size: usize,
        lru_size: usize,
        expiration_seconds: u64,
        load_gas_cost: u64,
        max_execution_gas: u64,
    ) -> Self {
        Self {
            basic: VecDeque::new(),
            basic_size: basic_size.max(1),
            lru: LruCache::new(NonZeroUsize::new(lru_size.max(1)).unwrap_or(NonZeroUsize::MIN)),
            timed: BTreeMap::new(),
            expiration: Duration::from_secs(expiration_seconds),
            load_gas_cost: U256::from(load_gas_cost),
            max_execution_gas: U256::from(max_execution_gas),
        }
    }

    /// Timestamp before which timed entries are considered stale; startup
    /// seeding replays forward from here.
    pub(crate) fn expired_timestamp(&self) -> U256 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        U256::from(now.saturating_sub(self.expiration.as_secs()))
    }

    pub(crate) fn basic_add(&mut self, machine: Machine) {
        self.basic.push_back(Arc::new(machine));
        while self.basic.len() > self.basic_size {
            self.basic.pop_front();
        }
    }

    pub(crate) fn lru_add(&mut self, machine: Machine) {
        let gas = machine.output().arb_gas_used;
        self.lru.put(gas, Arc::new(machine));
    }

    pub(crate) fn timed_add(&mut self, machine: Machine) {
        self.prune_expired();
        let gas = machine.output().arb_gas_used;
        self.timed.insert(
            gas,
            TimedEntry {
                inserted_at: Instant::now(),
                machine: Arc::new(machine),
            },
        );
    }

    pub(crate) fn timed_len(&self) -> usize {
        self.timed.len()
    }

    fn prune_expired(&mut self) {
        let expiration = self.expiration;
        self.timed
            .retain(|_, entry| entry.inserted_at.elapsed() < expiration);
    }

    fn best_cached_at_or_before(&mut self, target: U256) -> Option<Arc<Machine>> {
        self.prune_expired();
        let mut best: Option<Arc<Machine>> = None;
        let mut consider = |candidate: &Arc<Machine>| {
            let gas = candidate.output().arb_gas_used;
            if gas > target {
                return;
            }
            match &best {
                Some(current) if current.output().arb_gas_used >= gas => {}
                _ => best = Some(Arc::clone(candidate)),
            }
        };
        for machine in &self.basic {
            consider(machine);
        }
        for (_, machine) in self.lru.iter() {
            consider(machine);
        }
        if let Some((_, entry)) = self.timed.range(..=target).next_back() {
            consider(&entry.machine);
        }
        best
    }

    /// Picks the best starting point for reaching `target`:
    /// the closest predecessor among the cached snapshots, the caller's
    /// current machine, and the database checkpoint at `db_gas` (handicapped
    /// by the load cost). Candidates further than the execution bound fail
    /// the lookup unless `allow_too_much_execution` is set.
    pub(crate) fn at_or_before_gas(
        &mut self,
        target: U256,
        current: Option<U256>,
        db_gas: Option<U256>,
        allow_too_much_execution: bool,
    ) -> CacheLookup {
        let cached = self.best_cached_at_or_before(target);

        let mut best: Option<(U256, Candidate)> = None;
        let mut consider = |gas: Option<U256>, penalty: U256, candidate: Candidate| {
            let Some(gas) = gas else { return };
            if gas > target {
                return;
            }
            let distance = (target - gas) + penalty;
            match best {
                Some((best_distance, _)) if best_distance <= distance => {}
                _ => best = Some((distance, candidate)),
            }
        };
        // On ties the earlier candidate wins: keeping the current machine
        // beats copying from cache beats a database load.
        consider(current, U256::zero(), Candidate::Current);
        consider(
            cached.as_ref().map(|m| m.output().arb_gas_used),
            U256::zero(),
            Candidate::Cache,
        );
        consider(db_gas, self.load_gas_cost, Candidate::Database);

        let Some((distance, candidate)) = best else {
            return CacheLookup::Nothing;
        };
        if !allow_too_much_execution
            && !self.max_execution_gas.is_zero()
            && distance > self.max_execution_gas
        {
            return CacheLookup::TooMuchExecution;
        }
        match candidate {
            Candidate::Current => CacheLookup::Nothing,
            Candidate::Database => CacheLookup::UseDatabase,
            Candidate::Cache => match cached {
                Some(machine) => CacheLookup::Machine(Box::new((*machine).clone())),
                None => CacheLookup::Nothing,
            },
        }
    }

    /// Drops every entry at or past the reorg point.
    pub(crate) fn reorg(&mut self, reorg_gas: U256) {
        self.basic
            .retain(|machine| machine.output().arb_gas_used < reorg_gas);
        let stale: Vec<U256> = self
            .lru
            .iter()
            .filter(|(gas, _)| **gas >= reorg_gas)
            .map(|(gas, _)| *gas)
            .collect();
        for gas in stale {
            self.lru.pop(&gas);
        }
        self.timed.split_off(&reorg_gas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbrex_vm::{CoreCode, Executable, Machine};

    fn machine_at_gas(gas: u64) -> Machine {
        let executable = Executable::trivial();
        let code = Arc::new(CoreCode::new(0));
        let segment = code.add_segment(executable.instructions);
        let mut machine = Machine::new(code, segment.segment_id, executable.static_val);
        machine.state.output.arb_gas_used = U256::from(gas);
        machine
    }

    fn cache() -> CombinedMachineCache {
        CombinedMachineCache::new(4, 4, 60, 100, 1_000)
    }

    #[test]
    fn lookup_prefers_closest_predecessor() {
        let mut cache = cache();
        cache.basic_add(machine_at_gas(100));
        cache.lru_add(machine_at_gas(300));
        cache.timed_add(machine_at_gas(200));

        match cache.at_or_before_gas(U256::from(250u64), None, None, true) {
            CacheLookup::Machine(machine) => {
                assert_eq!(machine.output().arb_gas_used, U256::from(200u64));
            }
            other => panic!("unexpected lookup result: {other:?}"),
        }
    }

    #[test]
    fn database_wins_when_closer_by_more_than_load_cost() {
        let mut cache = cache();
        cache.basic_add(machine_at_gas(100));
        // db at 900: distance 100 + load cost 100 = 200 < 900 from cache.
        match cache.at_or_before_gas(
            U256::from(1_000u64),
            None,
            Some(U256::from(900u64)),
            true,
        ) {
            CacheLookup::UseDatabase => {}
            other => panic!("unexpected lookup result: {other:?}"),
        }
    }

    #[test]
    fn current_machine_is_kept_on_tie() {
        let mut cache = cache();
        cache.basic_add(machine_at_gas(500));
        match cache.at_or_before_gas(
            U256::from(600u64),
            Some(U256::from(500u64)),
            None,
            true,
        ) {
            CacheLookup::Nothing => {}
            other => panic!("unexpected lookup result: {other:?}"),
        }
    }

    #[test]
    fn distant_candidates_fail_without_allowance() {
        let mut cache = cache();
        cache.basic_add(machine_at_gas(0));
        match cache.at_or_before_gas(U256::from(5_000u64), None, None, false) {
            CacheLookup::TooMuchExecution => {}
            other => panic!("unexpected lookup result: {other:?}"),
        }
        match cache.at_or_before_gas(U256::from(5_000u64), None, None, true) {
            CacheLookup::Machine(_) => {}
            other => panic!("unexpected lookup result: {other:?}"),
        }
    }

    #[test]
    fn reorg_drops_entries_at_or_past_point() {
        let mut cache = cache();
        cache.basic_add(machine_at_gas(100));
        cache.basic_add(machine_at_gas(200));
        cache.lru_add(machine_at_gas(250));
        cache.timed_add(machine_at_gas(300));
        cache.reorg(U256::from(200u64));

        match cache.at_or_before_gas(U256::from(1_000u64), None, None, true) {
            CacheLookup::Machine(machine) => {
                assert_eq!(machine.output().arb_gas_used, U256::from(100u64));
            }
            other => panic!("unexpected lookup result: {other:?}"),
        }
        assert_eq!(cache.timed_len(), 0);
    }

    #[test]
    fn empty_cache_returns_nothing() {
        let mut cache = cache();
        assert!(matches!(
            cache.at_or_before_gas(U256::from(10u64), None, None, true),
            CacheLookup::Nothing
        ));
    }
}
