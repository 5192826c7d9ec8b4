use serde::{Deserialize, Serialize};
use std::fmt;

/// The bounded set of entity types the store knows how to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Room,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Room => "room",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one independently-owned entity, e.g. `room@101`.
///
/// The derived ordering (kind, then key) is the canonical order used by the
/// lock manager, so it must never change once locks have been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub key: String,
}

impl EntityId {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    pub fn room(number: impl Into<String>) -> Self {
        Self::new(EntityKind::Room, number)
    }

    /// Key used by storage adapters.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.key)
    }
}

/// Operations every hosted entity type must support.
pub trait Bookable {
    fn is_currently_booked(&self) -> bool;
    fn book(&mut self);
    fn unbook(&mut self);
}

/// Durable state of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    pub booked: bool,
}

impl Bookable for RoomState {
    fn is_currently_booked(&self) -> bool {
        self.booked
    }

    fn book(&mut self) {
        self.booked = true;
    }

    fn unbook(&mut self) {
        self.booked = false;
    }
}

/// An operation dispatched to a single entity through the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntityOperation {
    CheckState,
    SetState { booked: bool },
}

impl EntityOperation {
    pub fn book() -> Self {
        EntityOperation::SetState { booked: true }
    }

    pub fn unbook() -> Self {
        EntityOperation::SetState { booked: false }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, EntityOperation::SetState { .. })
    }

    /// Applies the operation to `state` and reports the resulting flag.
    pub fn apply<B: Bookable>(&self, state: &mut B) -> OperationResult {
        match self {
            EntityOperation::CheckState => {}
            EntityOperation::SetState { booked: true } => state.book(),
            EntityOperation::SetState { booked: false } => state.unbook(),
        }
        OperationResult {
            booked: state.is_currently_booked(),
        }
    }
}

impl fmt::Display for EntityOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityOperation::CheckState => f.write_str("check_state"),
            EntityOperation::SetState { booked: true } => f.write_str("book"),
            EntityOperation::SetState { booked: false } => f.write_str("unbook"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub booked: bool,
}

/// An entity together with its current state, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub state: RoomState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_apply_to_room() {
        let mut room = RoomState::default();

        let checked = EntityOperation::CheckState.apply(&mut room);
        assert!(!checked.booked);

        let booked = EntityOperation::book().apply(&mut room);
        assert!(booked.booked);
        assert!(room.is_currently_booked());

        let unbooked = EntityOperation::unbook().apply(&mut room);
        assert!(!unbooked.booked);
        assert_eq!(room, RoomState { booked: false });
    }

    #[test]
    fn test_only_set_state_mutates() {
        assert!(!EntityOperation::CheckState.is_mutation());
        assert!(EntityOperation::book().is_mutation());
        assert!(EntityOperation::unbook().is_mutation());
    }

    #[test]
    fn test_entity_id_display_and_order() {
        let a = EntityId::room("101");
        let b = EntityId::room("102");
        assert_eq!(a.to_string(), "room@101");
        assert_eq!(a.storage_key(), "room@101");
        assert!(a < b);
    }

    #[test]
    fn test_operation_serialization_is_tagged() {
        let json = serde_json::to_string(&EntityOperation::book()).unwrap();
        assert_eq!(json, r#"{"op":"set_state","booked":true}"#);
    }
}
