//! End-to-end scenarios against a running driver thread.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ethereum_types::{H256, U256};

use arbrex_common::types::{InboxMessage, SequencerBatchItem};
use arbrex_core::{ArbCore, CoreConfig, MessageStatus};
use arbrex_storage::Store;
use arbrex_vm::{CoreCode, Executable, Machine, MachineExecutionConfig, MachineMessage};

fn test_config() -> CoreConfig {
    CoreConfig {
        message_process_count: 4,
        min_gas_checkpoint_frequency: 1,
        basic_machine_cache_interval: 1,
        checkpoint_load_gas_cost: 1,
        checkpoint_max_execution_gas: 0,
        idle_sleep_milliseconds: 1,
        ..CoreConfig::default()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

/// Producer-side accumulator chain over sequencer message items.
#[derive(Default)]
struct ChainBuilder {
    prev_acc: H256,
    next_seq: U256,
}

impl ChainBuilder {
    fn message_body(block: u64, timestamp: u64, payload: &[u8]) -> Bytes {
        InboxMessage::new(
            U256::from(block),
            U256::from(timestamp),
            Bytes::copy_from_slice(payload),
        )
        .encode_to_vec()
        .into()
    }

    fn message_item(&mut self, block: u64, timestamp: u64, payload: &[u8]) -> SequencerBatchItem {
        let mut item = SequencerBatchItem {
            last_sequence_number: self.next_seq,
            accumulator: H256::zero(),
            total_delayed_count: U256::zero(),
            sequencer_message: Some(Self::message_body(block, timestamp, payload)),
        };
        item.accumulator = item.compute_accumulator(self.prev_acc, U256::zero(), H256::zero());
        self.prev_acc = item.accumulator;
        self.next_seq += U256::one();
        item
    }
}

fn start_core(store: Store, config: CoreConfig) -> Arc<ArbCore> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let core = Arc::new(ArbCore::new(store, config).unwrap());
    core.initialize(Executable::trivial()).unwrap();
    assert!(core.start_thread());
    core
}

fn deliver_items(core: &ArbCore, previous_count: u64, previous_acc: H256, items: &[SequencerBatchItem]) {
    wait_until("message slot to open", || {
        core.deliver_messages(
            U256::from(previous_count),
            previous_acc,
            items.iter().map(|item| item.to_delivery_bytes()).collect(),
            Vec::new(),
            None,
        )
    });
    wait_until("delivery to be processed", || {
        matches!(
            core.messages_status(),
            MessageStatus::Success | MessageStatus::Error
        )
    });
}

#[test]
fn driver_processes_delivered_batches() {
    let core = start_core(Store::in_memory(), test_config());
    let mut chain = ChainBuilder::default();
    let items = [
        chain.message_item(10, 1_000, b"m0"),
        chain.message_item(10, 1_001, b"m1"),
    ];

    deliver_items(&core, 0, H256::zero(), &items);
    wait_until("machine to replay both messages", || {
        core.machine_messages_read() == U256::from(2u64)
    });

    assert_eq!(
        core.get_inbox_acc(U256::zero()).unwrap(),
        Some(items[0].accumulator)
    );
    assert_eq!(
        core.get_inbox_acc(U256::one()).unwrap(),
        Some(items[1].accumulator)
    );
    let messages = core
        .get_messages(U256::zero(), U256::from(2u64))
        .unwrap()
        .unwrap();
    assert_eq!(messages[0], items[0].sequencer_message.clone().unwrap());
    assert_eq!(messages[1], items[1].sequencer_message.clone().unwrap());
    assert_eq!(core.message_entry_inserted_count().unwrap(), U256::from(2u64));

    core.abort_thread();
}

#[test]
fn restart_recovers_checkpoints_and_seeds_cache() {
    let store = Store::in_memory();
    let core = start_core(store.clone(), test_config());
    let mut chain = ChainBuilder::default();
    let now = unix_now();
    let items = [
        chain.message_item(10, now, b"m0"),
        chain.message_item(10, now, b"m1"),
        chain.message_item(10, now, b"m2"),
    ];
    deliver_items(&core, 0, H256::zero(), &items);
    wait_until("machine to replay all messages", || {
        core.machine_messages_read() == U256::from(3u64)
    });
    let head_gas = core.max_checkpoint_gas().unwrap();
    assert!(head_gas > U256::zero());
    core.abort_thread();
    drop(core);

    // Restart over the same database with cache seeding enabled.
    let config = CoreConfig {
        seed_cache_on_startup: true,
        ..test_config()
    };
    let core = Arc::new(ArbCore::new(store, config).unwrap());
    core.initialize(Executable::trivial()).unwrap();

    assert_eq!(core.max_checkpoint_gas().unwrap(), head_gas);
    let output = core.get_last_machine_output().unwrap();
    assert_eq!(output.arb_gas_used, head_gas);
    assert_eq!(output.fully_processed_inbox.count, U256::from(3u64));

    // The timed cache was rebuilt during seeding: a cache-only lookup
    // resolves without touching the checkpoint column.
    let cursor = core
        .get_execution_cursor(head_gas, false)
        .unwrap()
        .expect("seeded cache should satisfy a cache-only lookup");
    assert_eq!(cursor.output().arb_gas_used, head_gas);
}

#[test]
fn slow_lookup_replays_from_database_checkpoint() {
    let store = Store::in_memory();
    let core = start_core(store.clone(), test_config());
    let mut chain = ChainBuilder::default();
    let items = [
        chain.message_item(10, 1_000, b"m0"),
        chain.message_item(10, 1_001, b"m1"),
        chain.message_item(10, 1_002, b"m2"),
    ];
    deliver_items(&core, 0, H256::zero(), &items);
    wait_until("machine to replay all messages", || {
        core.machine_messages_read() == U256::from(3u64)
    });
    let head_gas = core.max_checkpoint_gas().unwrap();
    core.abort_thread();
    drop(core);

    // A fresh instance has cold caches, so the cursor must come from the
    // checkpoint column.
    let core = Arc::new(ArbCore::new(store, test_config()).unwrap());
    core.initialize(Executable::trivial()).unwrap();

    let target = head_gas - U256::one();
    let mut cursor = core
        .get_execution_cursor(target, true)
        .unwrap()
        .expect("database lookup should resolve");
    assert!(cursor.output().arb_gas_used <= target);
    assert_eq!(cursor.output().fully_processed_inbox.count, U256::from(2u64));

    // The cursor machine must equal a machine replayed from genesis.
    let machine = core.take_execution_cursor_machine(&mut cursor).unwrap();
    let replayed = replay_from_genesis(&core, 2);
    assert_eq!(machine.state.machine_hash(), replayed.state.machine_hash());

    // Advancing twice to the same absolute target: the second call is a
    // no-op on an already positioned cursor.
    assert!(core.advance_execution_cursor(&mut cursor, head_gas, false, true).unwrap());
    let gas_after_first = cursor.output().arb_gas_used;
    let hash_after_first = cursor.machine_hash();
    assert!(core.advance_execution_cursor(&mut cursor, head_gas, false, true).unwrap());
    assert_eq!(cursor.output().arb_gas_used, gas_after_first);
    assert_eq!(cursor.machine_hash(), hash_after_first);
    assert_eq!(gas_after_first, head_gas);
}

/// Replays the first `count` inbox entries on a brand-new machine.
fn replay_from_genesis(core: &ArbCore, count: u64) -> Machine {
    let executable = Executable::trivial();
    let code = Arc::new(CoreCode::new(0));
    let segment = code.add_segment(executable.instructions);
    let mut machine = Machine::new(code, segment.segment_id, executable.static_val);

    let mut messages = Vec::new();
    for index in 0..count {
        let body = core
            .get_messages(U256::from(index), U256::one())
            .unwrap()
            .unwrap()
            .remove(0);
        let mut message = InboxMessage::decode(&body).unwrap();
        message.inbox_sequence_number = U256::from(index);
        let accumulator = core.get_inbox_acc(U256::from(index)).unwrap().unwrap();
        messages.push(MachineMessage {
            message,
            accumulator,
        });
    }
    machine.run(MachineExecutionConfig {
        inbox_messages: messages,
        ..Default::default()
    });
    machine
}

#[test]
fn delivery_slot_reports_busy() {
    let core = Arc::new(ArbCore::new(Store::in_memory(), test_config()).unwrap());
    core.initialize(Executable::trivial()).unwrap();
    let mut chain = ChainBuilder::default();
    let item = chain.message_item(10, 1_000, b"m0");

    // Without a driver draining the slot, the second delivery is refused.
    assert!(core.deliver_messages(
        U256::zero(),
        H256::zero(),
        vec![item.to_delivery_bytes()],
        Vec::new(),
        None,
    ));
    assert!(!core.deliver_messages(
        U256::zero(),
        H256::zero(),
        vec![item.to_delivery_bytes()],
        Vec::new(),
        None,
    ));
    assert_eq!(core.messages_status(), MessageStatus::Ready);
}

#[test]
fn trigger_save_checkpoint_blocks_until_saved() {
    let core = start_core(Store::in_memory(), test_config());
    let mut chain = ChainBuilder::default();
    let items = [chain.message_item(10, 1_000, b"m0")];
    deliver_items(&core, 0, H256::zero(), &items);
    wait_until("machine to replay the message", || {
        core.machine_messages_read() == U256::one()
    });

    core.trigger_save_checkpoint().unwrap();
    assert!(core.max_checkpoint_gas().unwrap() > U256::zero());
    core.abort_thread();
}

#[test]
fn abort_drives_cursors_to_error() {
    let core = start_core(Store::in_memory(), test_config());
    assert!(core.logs_cursor_request(0, U256::one()).unwrap());
    core.abort_thread();

    assert!(core.logs_cursor_check_error(0).unwrap());
    assert_eq!(core.logs_cursor_clear_error(0).unwrap(), "arbcore thread aborted");
    assert!(!core.logs_cursor_check_error(0).unwrap());
}
