//! Deterministic, pure logic shared by the repair engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod convergence;
pub mod diff;
pub mod failures;
pub mod path;
pub mod reply;
pub mod tiers;
pub mod tools;
pub mod types;
