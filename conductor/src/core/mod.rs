//! Deterministic, pure logic shared by the pipeline engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod checkin;
pub mod fix;
pub mod gate;
pub mod naming;
pub mod transition;
pub mod types;
