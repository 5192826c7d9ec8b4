use super::entity::{EntityId, EntityOperation, OperationResult};
use super::lock::LockRecord;
use crate::error::{OrchestrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one durable orchestration instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the instance id from the room pair, so duplicate requests for
    /// the same pair land on the same instance.
    pub fn for_transfer(request: &TransferRequest) -> Self {
        Self(format!("orch.{}.{}", request.from_room, request.to_room))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input of the transfer orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_room: String,
    pub to_room: String,
}

impl TransferRequest {
    pub fn new(from_room: impl Into<String>, to_room: impl Into<String>) -> Self {
        Self {
            from_room: from_room.into(),
            to_room: to_room.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from_room.trim().is_empty() || self.to_room.trim().is_empty() {
            return Err(OrchestrationError::ValidationError(
                "Room numbers must not be empty".to_string(),
            ));
        }
        if self.from_room == self.to_room {
            return Err(OrchestrationError::ValidationError(format!(
                "Cannot transfer room {} onto itself",
                self.from_room
            )));
        }
        Ok(())
    }

    pub fn from_entity(&self) -> EntityId {
        EntityId::room(self.from_room.as_str())
    }

    pub fn to_entity(&self) -> EntityId {
        EntityId::room(self.to_room.as_str())
    }
}

/// Outcome of a transfer. A rejected transfer is still a completed orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub success: bool,
    pub message: String,
}

impl TransferResult {
    pub const BOOKED: &'static str = "Room booked!";
    pub const ALREADY_BOOKED: &'static str = "Room already booked!";

    pub fn booked() -> Self {
        Self {
            success: true,
            message: Self::BOOKED.to_string(),
        }
    }

    pub fn already_booked() -> Self {
        Self {
            success: false,
            message: Self::ALREADY_BOOKED.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted metadata of an instance. History is stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub input: TransferRequest,
    pub status: InstanceStatus,
    pub result: Option<TransferResult>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(id: InstanceId, input: TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            input,
            status: InstanceStatus::Pending,
            result: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What happened at one step of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEventKind {
    LockAcquired {
        lock: LockRecord,
    },
    LockReleased {
        entity_ids: Vec<EntityId>,
    },
    EntityOpCompleted {
        entity: EntityId,
        operation: EntityOperation,
        result: OperationResult,
    },
    OrchestrationCompleted {
        result: TransferResult,
    },
    OrchestrationFailed {
        reason: String,
    },
}

impl HistoryEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEventKind::OrchestrationCompleted { .. }
                | HistoryEventKind::OrchestrationFailed { .. }
        )
    }

    /// Short description used in divergence reports.
    pub fn describe(&self) -> String {
        match self {
            HistoryEventKind::LockAcquired { lock } => {
                format!("lock_acquired {:?}", keys(&lock.entity_ids))
            }
            HistoryEventKind::LockReleased { entity_ids } => {
                format!("lock_released {:?}", keys(entity_ids))
            }
            HistoryEventKind::EntityOpCompleted {
                entity, operation, ..
            } => format!("{operation} on {entity}"),
            HistoryEventKind::OrchestrationCompleted { .. } => "orchestration_completed".into(),
            HistoryEventKind::OrchestrationFailed { .. } => "orchestration_failed".into(),
        }
    }
}

fn keys(entity_ids: &[EntityId]) -> Vec<String> {
    entity_ids.iter().map(EntityId::to_string).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
}

impl HistoryEvent {
    pub fn new(sequence: u64, kind: HistoryEventKind) -> Self {
        Self { sequence, kind }
    }

    /// Checks that `self` may be appended after `last`.
    ///
    /// Sequences start at 1 and grow by exactly one; nothing follows a
    /// terminal event.
    pub fn check_follows(&self, instance: &InstanceId, last: Option<&HistoryEvent>) -> Result<()> {
        if let Some(last) = last
            && last.kind.is_terminal()
        {
            return Err(OrchestrationError::InstanceTerminated(instance.clone()));
        }
        let expected = last.map_or(1, |event| event.sequence + 1);
        if self.sequence != expected {
            return Err(OrchestrationError::SequenceViolation {
                instance: instance.clone(),
                expected,
                got: self.sequence,
            });
        }
        Ok(())
    }
}

/// An instance together with its full history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestrationInstance {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub history: Vec<HistoryEvent>,
}

/// What a status poll returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub result: Option<TransferResult>,
    pub failure: Option<String>,
}

impl From<&InstanceRecord> for StatusReport {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.id.clone(),
            status: record.status,
            result: record.result.clone(),
            failure: record.failure.clone(),
        }
    }
}
