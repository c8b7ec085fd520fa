//! Stable exit codes for `outbox` CLI commands.

/// Command succeeded (merge-check: ready; pipeline: ready to merge).
pub const OK: i32 = 0;
/// Infrastructure or unexpected failure.
pub const FAILED: i32 = 1;
/// Bad input; nothing was written.
pub const INVALID: i32 = 2;
/// The issue needs a human: a blocked transition, a pipeline that stopped
/// for manual intervention, or a merge gate that is not ready.
pub const BLOCKED: i32 = 3;
