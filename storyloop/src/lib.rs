//! Iteration loop that drives a coding agent through a story backlog.
//!
//! Each iteration re-reads the requirements document, picks the highest-priority
//! open story, hands it to the agent, and streams the agent's narration and tool
//! use onto a line-delimited JSON event channel. The agent owns the document and
//! marks stories as passing; the loop only observes.
//!
//! - **[`core`]**: Pure, deterministic logic (document types, selection, tool
//!   accounting, the event vocabulary). No I/O.
//! - **[`io`]**: Side-effecting operations (document store, agent process, prompt
//!   rendering, event output).
//!
//! Orchestration modules ([`run`], [`select`]) coordinate core logic with I/O to
//! implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
