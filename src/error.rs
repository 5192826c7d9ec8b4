use crate::domain::entity::EntityId;
use crate::domain::orchestration::InstanceId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Entity {0} is unavailable: {1}")]
    EntityUnavailable(EntityId, String),
    #[error("Lock lease held by {holder} on {entity} has expired")]
    LockLeaseExpired { holder: InstanceId, entity: EntityId },
    #[error("Timed out waiting for lock on {entity} (held by {blocker})")]
    LockWaitTimeout { entity: EntityId, blocker: InstanceId },
    #[error("Orchestration failed: {0}")]
    OrchestrationFailure(String),
    #[error("Replay of {instance} diverged at sequence {sequence}: expected {expected}, recorded {recorded}")]
    NonDeterministic {
        instance: InstanceId,
        sequence: u64,
        expected: String,
        recorded: String,
    },
    #[error("Replay of {0} reached the end of recorded history")]
    ReplayExhausted(InstanceId),
    #[error("History sequence violation for {instance}: expected {expected}, got {got}")]
    SequenceViolation {
        instance: InstanceId,
        expected: u64,
        got: u64,
    },
    #[error("Instance {0} is terminal; its history is immutable")]
    InstanceTerminated(InstanceId),
    #[error("Instance cancelled: {0}")]
    Cancelled(String),
    #[error("Orchestration instance not found: {0}")]
    InstanceNotFound(InstanceId),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl OrchestrationError {
    /// Infrastructure hiccups worth retrying with backoff.
    ///
    /// Everything else is either a caller mistake or an unrecoverable
    /// orchestration failure and must not be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestrationError::StorageError(_)
            | OrchestrationError::EntityUnavailable(..)
            | OrchestrationError::IoError(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            OrchestrationError::RocksDbError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
