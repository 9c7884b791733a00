/// Process exit codes shared by the agent and the scripts that supervise it.
pub const SUCCESS: u8 = 0;
pub const FAILURE: u8 = 1;

/// Returned by `burrow update` when a newer release was installed and the
/// running process must be restarted to pick it up.
pub const UPDATE_APPLIED: u8 = 64;
