use arbrex_common::wire::WireError;
use arbrex_storage::error::StoreError;
use arbrex_vm::VmError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("vm error: {0}")]
    Vm(#[from] VmError),

    /// Schema mismatch or a violated invariant found in stored data.
    /// Operator intervention required.
    #[error("database corruption: {0}")]
    Corruption(String),

    /// The caller handed the engine arguments that violate its contract.
    #[error("{0}")]
    UserLogic(String),

    /// Transient contention; the caller should retry.
    #[error("busy, try again")]
    Busy,

    /// The machine stopped with an error while the driver was advancing it.
    #[error("machine error: {0}")]
    Machine(String),
}
