//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod failure_memory;
pub mod invariants;
pub mod plan;
pub mod resolver;
pub mod response;
pub mod session;
pub mod types;
