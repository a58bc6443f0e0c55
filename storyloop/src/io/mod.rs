//! I/O helpers for the run loop.

pub mod agent;
pub mod claude;
pub mod config;
pub mod emitter;
pub mod prd_store;
pub mod prompt;
pub mod tool_detail;
