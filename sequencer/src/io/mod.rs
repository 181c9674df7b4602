//! I/O helpers for sequencer commands.

pub mod config;
pub mod launcher;
pub mod modules;
pub mod process;
pub mod run_log;
pub mod script;
pub mod submit;
