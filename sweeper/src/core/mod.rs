//! Deterministic, pure logic shared by the processor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for tests.

pub mod duration;
pub mod policy;
pub mod result;
pub mod schedule;
pub mod slug;
