//! Deterministic, pure logic shared by the sequencer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values (config, environment maps, plans) and return deterministic outputs
//! suitable for tests.

pub mod directives;
pub mod environment;
pub mod invariants;
pub mod plan;
pub mod resources;
pub mod types;
