//! Outer surfaces: request intake and the CSV formats used by the CLI.

pub mod csv;
pub mod intake;
