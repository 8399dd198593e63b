//! Exit codes for the CLI

/// Every task succeeded
pub const SUCCESS: i32 = 0;

/// At least one task did not succeed
pub const TASK_FAILURE: i32 = 1;

/// The batch could not be orchestrated (bad batch file, cycle, config,
/// checkpoint or workspace backend error)
pub const ORCHESTRATION_ERROR: i32 = 2;

/// Interrupted by the user
pub const CANCELLED: i32 = 130;
