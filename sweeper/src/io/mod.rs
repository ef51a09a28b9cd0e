//! I/O adapters used by the processor and the run orchestrator.

pub mod config;
pub mod git;
pub mod locker;
pub mod process;
pub mod run_state;
pub mod task_file;
