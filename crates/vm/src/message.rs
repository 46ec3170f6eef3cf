use ethereum_types::H256;

use arbrex_common::types::InboxMessage;

/// A message handed to the machine together with the accumulator of its
/// covering batch item. Mid-span delayed messages carry the item accumulator
/// too, so a machine paused anywhere inside a span still validates against
/// the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineMessage {
    pub message: InboxMessage,
    pub accumulator: H256,
}
