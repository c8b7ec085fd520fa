//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod comment;
pub mod labels;
pub mod merge_gate;
pub mod outcome;
pub mod path;
pub mod precondition;
pub mod types;
