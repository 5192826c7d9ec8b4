//! Application layer: the durable orchestration engine and its collaborators.
//!
//! `OrchestrationEngine` replays a deterministic procedure against its
//! recorded history, dispatching only the steps not yet recorded. Entity
//! mutations go through the single-writer `EntityStore`; cross-entity
//! exclusion comes from the `LockManager`.

pub mod context;
pub mod engine;
pub mod entity_store;
pub mod lock_manager;
pub mod recovery;
pub mod retry;
pub mod transfer;
