use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use ethereum_types::{H256, U256};

use arbrex_common::types::{
    CodePointRef, InboxState, MachineCpuState, MachineOutput, MachineStateKeys,
};

use crate::code::CoreCode;
use crate::message::MachineMessage;
use crate::value::Value;

/// Flat gas cost charged for consuming any message.
pub const MESSAGE_BASE_GAS: u64 = 100_000;
/// Additional gas per payload byte.
pub const MESSAGE_BYTE_GAS: u64 = 100;
/// Leading payload byte that makes a message emit a send.
pub const SEND_MARKER: u8 = 0x01;

/// A value or byte string the machine emitted, tagged with the inbox
/// position at emission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineEmission<T> {
    pub val: T,
    pub inbox: InboxState,
}

/// Execution record between two pauses.
#[derive(Debug, Clone, Default)]
pub struct Assertion {
    pub logs: Vec<MachineEmission<Value>>,
    pub sends: Vec<MachineEmission<Bytes>>,
    pub sideload_block_number: Option<U256>,
    pub gas_count: U256,
}

/// Bounds for one execution round.
#[derive(Debug, Clone, Default)]
pub struct MachineExecutionConfig {
    pub inbox_messages: Vec<MachineMessage>,
    pub stop_on_sideload: bool,
    /// Gas ceiling; zero means unlimited.
    pub max_gas: U256,
    /// When set, the machine may finish the message that crosses `max_gas`;
    /// otherwise it stops short of it.
    pub go_over_gas: bool,
}

#[derive(Debug, Default)]
struct AssertionContext {
    messages: VecDeque<MachineMessage>,
    stop_on_sideload: bool,
    max_gas: U256,
    go_over_gas: bool,
}

impl From<MachineExecutionConfig> for AssertionContext {
    fn from(config: MachineExecutionConfig) -> Self {
        Self {
            messages: config.inbox_messages.into(),
            stop_on_sideload: config.stop_on_sideload,
            max_gas: config.max_gas,
            go_over_gas: config.go_over_gas,
        }
    }
}

/// Run state of the machine as observed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MachineRunStatus {
    #[default]
    None,
    Running,
    Success,
    Aborted,
    Error,
}

/// Full machine state between pauses. Decomposes into the content hashes
/// persisted by the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub static_val: Value,
    pub register: Value,
    pub datastack: Vec<Value>,
    pub auxstack: Vec<Value>,
    pub pc: CodePointRef,
    pub err_pc: CodePointRef,
    pub arb_gas_remaining: U256,
    pub cpu_state: MachineCpuState,
    pub output: MachineOutput,
}

impl MachineState {
    pub fn new(segment_id: u64, static_val: Value) -> Self {
        let origin = CodePointRef {
            segment: segment_id,
            offset: 0,
        };
        Self {
            static_val,
            register: Value::default(),
            datastack: Vec::new(),
            auxstack: Vec::new(),
            pc: origin,
            err_pc: origin,
            arb_gas_remaining: U256::MAX,
            cpu_state: MachineCpuState::Extensive,
            output: MachineOutput::default(),
        }
    }

    pub fn datastack_value(&self) -> Value {
        Value::Tuple(self.datastack.clone())
    }

    pub fn auxstack_value(&self) -> Value {
        Value::Tuple(self.auxstack.clone())
    }

    pub fn state_keys(&self) -> MachineStateKeys {
        MachineStateKeys {
            static_hash: self.static_val.hash(),
            register_hash: self.register.hash(),
            datastack_hash: self.datastack_value().hash(),
            auxstack_hash: self.auxstack_value().hash(),
            pc: self.pc,
            err_pc: self.err_pc,
            arb_gas_remaining: self.arb_gas_remaining,
            cpu_state: self.cpu_state,
            output: self.output.clone(),
        }
    }

    pub fn machine_hash(&self) -> H256 {
        self.state_keys().machine_hash()
    }
}

pub fn message_gas_cost(payload_len: usize) -> U256 {
    U256::from(MESSAGE_BASE_GAS) + U256::from(MESSAGE_BYTE_GAS) * U256::from(payload_len)
}

/// The deterministic replay machine.
///
/// Each consumed message closes one L2 block: the machine charges gas,
/// advances `fully_processed_inbox`, emits one log (and a send for marked
/// payloads), and records the sideload position. With `stop_on_sideload`
/// set it pauses after every block so the driver can persist the assertion.
#[derive(Debug)]
pub struct Machine {
    pub state: MachineState,
    code: Arc<CoreCode>,
    context: AssertionContext,
    status: MachineRunStatus,
    pending: Assertion,
    error_message: String,
}

impl Clone for Machine {
    /// Snapshots the machine state. The pending run context is not part of
    /// a snapshot; clones start idle.
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            code: Arc::clone(&self.code),
            context: AssertionContext::default(),
            status: MachineRunStatus::None,
            pending: Assertion::default(),
            error_message: String::new(),
        }
    }
}

impl Machine {
    pub fn new(code: Arc<CoreCode>, segment_id: u64, static_val: Value) -> Self {
        Self::from_state(MachineState::new(segment_id, static_val), code)
    }

    pub fn from_state(state: MachineState, code: Arc<CoreCode>) -> Self {
        Self {
            state,
            code,
            context: AssertionContext::default(),
            status: MachineRunStatus::None,
            pending: Assertion::default(),
            error_message: String::new(),
        }
    }

    pub fn status(&self) -> MachineRunStatus {
        self.status
    }

    pub fn output(&self) -> &MachineOutput {
        &self.state.output
    }

    pub fn code(&self) -> &Arc<CoreCode> {
        &self.code
    }

    pub fn error_string(&self) -> &str {
        &self.error_message
    }

    pub fn clear_error(&mut self) {
        self.status = MachineRunStatus::None;
        self.error_message.clear();
    }

    /// Drops any staged work and marks the machine aborted.
    pub fn abort(&mut self) {
        self.context = AssertionContext::default();
        self.pending = Assertion::default();
        self.status = MachineRunStatus::Aborted;
    }

    /// Gas cost of the next staged message, zero when none is staged.
    pub fn next_gas_cost(&self) -> U256 {
        self.context
            .messages
            .front()
            .map(|message| message_gas_cost(message.message.payload.len()))
            .unwrap_or_default()
    }

    /// Stages a new execution round and runs it to the first pause.
    pub fn run_machine(&mut self, config: MachineExecutionConfig) -> bool {
        self.context = config.into();
        self.status = MachineRunStatus::Running;
        self.execute();
        self.status = MachineRunStatus::Success;
        true
    }

    /// Resumes the staged round after a sideload pause.
    pub fn continue_running_machine(&mut self) -> bool {
        self.status = MachineRunStatus::Running;
        self.execute();
        self.status = MachineRunStatus::Success;
        true
    }

    /// Consumes the pending assertion and resets the run state.
    pub fn next_assertion(&mut self) -> Assertion {
        self.status = MachineRunStatus::None;
        std::mem::take(&mut self.pending)
    }

    /// Runs one bounded round directly, returning its assertion. Used by
    /// execution cursors, which manage their own pause loop.
    pub fn run(&mut self, config: MachineExecutionConfig) -> Assertion {
        self.context = config.into();
        self.execute();
        self.status = MachineRunStatus::None;
        std::mem::take(&mut self.pending)
    }

    fn execute(&mut self) {
        loop {
            let cost = match self.context.messages.front() {
                Some(message) => message_gas_cost(message.message.payload.len()),
                None => break,
            };
            if !self.context.max_gas.is_zero() {
                if self.state.output.arb_gas_used >= self.context.max_gas {
                    break;
                }
                if !self.context.go_over_gas
                    && self.state.output.arb_gas_used + cost > self.context.max_gas
                {
                    break;
                }
            }
            let Some(message) = self.context.messages.pop_front() else {
                break;
            };
            self.process_message(message, cost);
            if self.context.stop_on_sideload {
                self.pending.sideload_block_number = self.state.output.last_sideload;
                break;
            }
        }
    }

    fn process_message(&mut self, message: MachineMessage, cost: U256) {
        let closed_block = self.state.output.l2_block_number;
        let payload = message.message.payload;

        let inbox = InboxState {
            count: self.state.output.fully_processed_inbox.count + U256::one(),
            accumulator: message.accumulator,
        };
        self.state.output.fully_processed_inbox = inbox;
        self.state.output.arb_gas_used += cost;
        self.state.arb_gas_remaining = self.state.arb_gas_remaining.saturating_sub(cost);
        self.state.output.l1_block_number = message.message.block_number;
        self.state.output.last_inbox_timestamp = message.message.timestamp;
        self.state.register = Value::Buffer(payload.clone());

        let segment_len = self
            .code
            .segment(self.state.pc.segment)
            .map(|segment| segment.instructions.len() as u64)
            .unwrap_or(1)
            .max(1);
        self.state.pc.offset = (self.state.pc.offset + 1) % segment_len;

        let log = Value::Tuple(vec![
            Value::Int(closed_block),
            Value::Int(inbox.count),
            Value::Buffer(payload.clone()),
        ]);
        self.pending.logs.push(MachineEmission { val: log, inbox });
        self.state.output.log_count += U256::one();

        if payload.first() == Some(&SEND_MARKER) {
            self.pending.sends.push(MachineEmission {
                val: payload.slice(1..),
                inbox,
            });
            self.state.output.send_count += U256::one();
        }

        self.state.output.l2_block_number = closed_block + U256::one();
        self.state.output.last_sideload = Some(closed_block);
        self.pending.gas_count += cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbrex_common::types::InboxMessage;
    use arbrex_common::utils::keccak;
    use crate::code::{CoreCode, Instruction};

    fn test_machine() -> Machine {
        let code = Arc::new(CoreCode::new(0));
        let segment = code.add_segment(vec![Instruction::simple(0), Instruction::simple(1)]);
        Machine::new(code, segment.segment_id, Value::default())
    }

    fn message(payload: &'static [u8], tag: &[u8]) -> MachineMessage {
        MachineMessage {
            message: InboxMessage::new(
                U256::from(10u64),
                U256::from(1_000u64),
                Bytes::from_static(payload),
            ),
            accumulator: keccak(tag),
        }
    }

    #[test]
    fn each_message_closes_a_block_and_logs() {
        let mut machine = test_machine();
        machine.run_machine(MachineExecutionConfig {
            inbox_messages: vec![message(b"a", b"acc0"), message(b"b", b"acc1")],
            stop_on_sideload: true,
            ..Default::default()
        });
        assert_eq!(machine.status(), MachineRunStatus::Success);

        let first = machine.next_assertion();
        assert_eq!(first.sideload_block_number, Some(U256::zero()));
        assert_eq!(first.logs.len(), 1);
        assert_eq!(machine.output().l2_block_number, U256::one());
        assert_eq!(machine.output().fully_processed_inbox.count, U256::one());

        machine.continue_running_machine();
        let second = machine.next_assertion();
        assert_eq!(second.sideload_block_number, Some(U256::one()));
        assert_eq!(machine.output().fully_processed_inbox.accumulator, keccak(b"acc1"));
        assert_eq!(machine.output().log_count, U256::from(2u64));
    }

    #[test]
    fn marked_payload_emits_send() {
        let mut machine = test_machine();
        let assertion = machine.run(MachineExecutionConfig {
            inbox_messages: vec![message(b"\x01payload", b"acc0")],
            ..Default::default()
        });
        assert_eq!(assertion.sends.len(), 1);
        assert_eq!(assertion.sends[0].val.as_ref(), b"payload");
        assert_eq!(machine.output().send_count, U256::one());
    }

    #[test]
    fn gas_ceiling_stops_short_without_go_over() {
        let mut machine = test_machine();
        let one_message_gas = message_gas_cost(1);
        let assertion = machine.run(MachineExecutionConfig {
            inbox_messages: vec![message(b"a", b"acc0"), message(b"b", b"acc1")],
            max_gas: one_message_gas + U256::one(),
            go_over_gas: false,
            ..Default::default()
        });
        // The second message would cross the ceiling, so only one ran.
        assert_eq!(assertion.gas_count, one_message_gas);
        assert_eq!(machine.output().fully_processed_inbox.count, U256::one());
    }

    #[test]
    fn go_over_gas_finishes_the_crossing_message() {
        let mut machine = test_machine();
        let one_message_gas = message_gas_cost(1);
        let assertion = machine.run(MachineExecutionConfig {
            inbox_messages: vec![message(b"a", b"acc0"), message(b"b", b"acc1")],
            max_gas: one_message_gas + U256::one(),
            go_over_gas: true,
            ..Default::default()
        });
        assert_eq!(assertion.gas_count, one_message_gas * U256::from(2u64));
    }

    #[test]
    fn replay_is_deterministic() {
        let run = |payloads: &[&'static [u8]]| {
            let mut machine = test_machine();
            for (i, payload) in payloads.iter().enumerate() {
                let accumulator = keccak(i.to_be_bytes());
                machine.run(MachineExecutionConfig {
                    inbox_messages: vec![MachineMessage {
                        message: InboxMessage::new(
                            U256::from(i as u64),
                            U256::from(i as u64),
                            Bytes::from_static(payload),
                        ),
                        accumulator,
                    }],
                    ..Default::default()
                });
            }
            machine.state.machine_hash()
        };
        assert_eq!(run(&[b"x", b"y"]), run(&[b"x", b"y"]));
        assert_ne!(run(&[b"x", b"y"]), run(&[b"y", b"x"]));
    }

    #[test]
    fn snapshot_clone_is_idle() {
        let mut machine = test_machine();
        machine.run_machine(MachineExecutionConfig {
            inbox_messages: vec![message(b"a", b"acc0"), message(b"b", b"acc1")],
            stop_on_sideload: true,
            ..Default::default()
        });
        let snapshot = machine.clone();
        assert_eq!(snapshot.status(), MachineRunStatus::None);
        assert_eq!(snapshot.next_gas_cost(), U256::zero());
        assert_eq!(snapshot.state, machine.state);
    }
}
