//! Deterministic, pure logic shared by the run loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! snapshots of the requirements document and return deterministic outputs.

pub mod events;
pub mod prd;
pub mod selector;
pub mod tool_usage;
