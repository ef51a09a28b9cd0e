//! Bot that applies declarative tasks across many git repositories.
//!
//! For every (repository, task) pair the bot decides whether a change
//! request must be created, updated, merged or closed, and performs only the
//! side effects that decision needs. The crate is split the same way the
//! decision is:
//!
//! - **[`core`]**: Pure, deterministic policy (result kinds, schedule and
//!   duration parsing, auto-merge/auto-close predicates). No I/O.
//! - **[`io`]**: Side-effecting adapters (git subprocesses, locks, config,
//!   persisted run state, task files).
//!
//! Orchestration modules ([`processor`], [`run`]) combine both with the
//! capability traits in [`host`], [`action`] and [`filter`]. Run and git
//! metrics go through the `metrics` facade ([`metrics`]).

pub mod action;
pub mod core;
pub mod exit_codes;
pub mod filter;
pub mod host;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod run;
pub mod task;
pub mod template;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
