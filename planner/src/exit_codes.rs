//! Stable exit codes for planner CLI commands.

/// Command succeeded with no node errors.
pub const OK: i32 = 0;
/// Command failed due to invalid input/config or other errors.
pub const INVALID: i32 = 1;
/// A governor stopped the compilation before the tree was exhausted.
pub const LIMIT_REACHED: i32 = 2;
/// The run finished but one or more nodes or leaves recorded errors.
pub const NODE_ERRORS: i32 = 3;
