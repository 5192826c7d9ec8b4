//! Domain types: entities, lock records, orchestration history and the
//! storage ports the application layer is written against.

pub mod entity;
pub mod lock;
pub mod orchestration;
pub mod ports;
