//! Gated beam search for automated repository repair.
//!
//! Candidate repair plans flow through a fixed pipeline: a generator
//! proposes them, a pure safety gate accepts or rejects them, a git-backed
//! rollback layer applies them to disposable sandboxes, an evaluator scores
//! the results, and a beam keeps only the most promising trajectories per
//! depth. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan model, gate policy,
//!   fingerprints, ranking). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (git, process execution, durable
//!   records, generator and evaluator backends). Isolated behind traits to
//!   enable scripting in tests.
//!
//! [`search`] coordinates core logic with I/O to run a search to one of its
//! terminal statuses.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod search;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
