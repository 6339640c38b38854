//! Stable exit codes for fixloop CLI commands.

/// Every workflow ended in success (or the command had no workflow to run).
pub const OK: i32 = 0;
/// Invalid usage, config, target or input file.
pub const INVALID: i32 = 1;
/// A sensitive action was not approved.
pub const REJECTED: i32 = 2;
/// The retry budget ran out or an adapter failed.
pub const FAILURE: i32 = 3;
