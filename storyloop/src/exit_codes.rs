//! Stable exit codes for storyloop CLI commands.

/// Command succeeded (including a run that ended normally).
pub const OK: i32 = 0;
/// Invalid arguments, configuration, credential, or paths. No events were emitted.
pub const INVALID: i32 = 1;
/// `storyloop select` found no open story (document complete).
pub const COMPLETE: i32 = 2;
/// The run failed after startup; `run_failed` was emitted.
pub const RUN_FAILED: i32 = 3;
/// The event channel could not be written.
pub const OUTPUT_FAILED: i32 = 4;
