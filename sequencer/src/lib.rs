//! Batch job sequencer for a distributed (DDP) and a single-process (DP)
//! training run.
//!
//! The crate turns a small TOML job description into scheduler directives, a
//! job script, and an ordered pair of process invocations with an explicit
//! child environment. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (resource formats, invariants,
//!   environment maps, plan construction). No I/O.
//! - **[`io`]**: Side-effecting operations (config files, module loading,
//!   process execution, submission, run records).
//!
//! Orchestration modules ([`sequence`], [`job`]) coordinate the two to
//! implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod job;
pub mod logging;
pub mod sequence;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
