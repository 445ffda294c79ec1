//! Proposal generator seam and bounded retry.
//!
//! The searcher talks to an opaque generator through a trait so tests can
//! script proposals deterministically and production can plug in a model
//! backend. Every call is bounded by the context's timeout; a hung call is
//! abandoned and counted as a transport failure. Transport failures are
//! retried with exponential backoff up to a bounded attempt count;
//! `Ok(None)` means the generator has nothing further for this context and
//! is never retried.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::plan::Plan;

/// Everything a generator may condition on when proposing the next plan.
#[derive(Debug, Clone)]
pub struct GenerateContext {
    /// Repair goal, stated by the caller.
    pub goal: String,
    /// Normalized failure signature of the trajectory's current state.
    pub failure_signature: String,
    /// Plans already applied along this trajectory, oldest first.
    pub plans_so_far: Vec<Plan>,
    /// Per-call wall-clock budget.
    pub timeout: Duration,
}

/// Source of candidate plans.
///
/// `Ok(None)` means drained for this context; `Err` is a transport failure
/// eligible for retry.
pub trait Generator: Send + Sync {
    fn generate(&self, ctx: &GenerateContext) -> Result<Option<Plan>>;
}

/// Bounded retry with exponential backoff for generator transport errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retrying after `attempt` failures (1-based, capped
    /// doubling).
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(8).saturating_sub(1);
        self.base_delay.saturating_mul(factor)
    }
}

/// Call the generator with the context's deadline enforced, retrying
/// transport errors and expired calls per the policy.
pub fn generate_with_retry(
    generator: &Arc<dyn Generator>,
    ctx: &GenerateContext,
    policy: RetryPolicy,
) -> Result<Option<Plan>> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match generate_with_deadline(generator, ctx) {
            Ok(plan) => {
                debug!(attempt, proposed = plan.is_some(), "generator call finished");
                return Ok(plan);
            }
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, err = %err, delay_ms = delay.as_millis() as u64, "generator failed, retrying");
                thread::sleep(delay);
            }
            Err(err) => {
                return Err(err.context(format!("generator failed after {attempt} attempts")));
            }
        }
    }
}

/// Run one generator call on a worker thread and give up after the
/// context's timeout. The trait has no cancellation hook, so an expired
/// call's worker is left to finish on its own and its result is dropped.
fn generate_with_deadline(
    generator: &Arc<dyn Generator>,
    ctx: &GenerateContext,
) -> Result<Option<Plan>> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(generator);
    let worker_ctx = ctx.clone();
    thread::spawn(move || {
        let _ = tx.send(worker.generate(&worker_ctx));
    });
    match rx.recv_timeout(ctx.timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(anyhow!(
            "generator call exceeded its {:?} timeout",
            ctx.timeout
        )),
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("generator worker panicked")),
    }
}

/// Generator backed by a directory of plan JSON files, consumed in
/// lexicographic filename order. Useful for replaying recorded proposals
/// and for driving the CLI without a model backend.
pub struct FilePlanGenerator {
    pending: Mutex<Vec<PathBuf>>,
}

impl FilePlanGenerator {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let entries =
            fs::read_dir(dir).with_context(|| format!("read plan directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        // Reversed so generate() can pop from the back in order.
        files.reverse();
        Ok(Self {
            pending: Mutex::new(files),
        })
    }
}

impl Generator for FilePlanGenerator {
    fn generate(&self, _ctx: &GenerateContext) -> Result<Option<Plan>> {
        let next = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.pop()
        };
        let Some(path) = next else {
            return Ok(None);
        };
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read plan {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&contents)
            .with_context(|| format!("parse plan {}", path.display()))?;
        Ok(Some(plan))
    }
}
