//! Stable exit codes for patchbeam CLI commands.

/// Command succeeded; for `run`, a candidate passed the evaluator.
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments, or an infrastructure
/// error before the search could report a terminal status.
pub const INVALID: i32 = 1;
/// `patchbeam run` exhausted every trajectory before the depth budget.
pub const EXHAUSTED: i32 = 2;
/// `patchbeam run` hit the depth budget; best trajectory was reported.
pub const BUDGET: i32 = 3;
/// `patchbeam run` was cancelled.
pub const CANCELLED: i32 = 4;
/// `patchbeam run` aborted on excessive infrastructure failures.
pub const INFRA: i32 = 5;
