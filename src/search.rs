//! Beam search over gated, sandboxed repair plans.
//!
//! Each depth expands every frontier node by asking the generator for
//! candidate plans, gates them, applies the approved ones to forked
//! sandboxes, evaluates the results in parallel, then ranks and prunes the
//! survivors back down to the beam width. The primary working copy is never
//! mutated; only snapshots and sandboxes are.
//!
//! Failure handling is split three ways: a gate rejection or evaluator
//! failure is a data point (recorded, candidate pruned), an apply conflict
//! is a data point charged without running the evaluator, and an
//! infrastructure error (fork, snapshot, generator transport) is counted
//! toward an abort threshold so a broken substrate ends the run loudly
//! instead of masquerading as "no plan worked".

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::fingerprint::context_fingerprint;
use crate::core::gate::{self, GateConfig};
use crate::core::plan::Plan;
use crate::core::rank::{RankKey, prune_to_width, ranked_order};
use crate::io::config::SearchConfig;
use crate::io::evaluator::{Evaluation, Evaluator};
use crate::io::generator::{GenerateContext, Generator, RetryPolicy, generate_with_retry};
use crate::io::outcome_store::{
    CandidateOutcome, OutcomeRecord, OutcomeStore, Prior, now_rfc3339,
};
use crate::io::rollback::{RollbackManager, Sandbox, SnapshotId};
use crate::io::run_state::{RunState, load_run_state, write_run_state};

/// Cooperative cancellation flag, checked between units of work. Cloning
/// shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// A candidate passed the evaluator at or above the success threshold.
    Success,
    /// Every trajectory died out before the depth budget.
    Exhausted,
    /// The depth budget ran out; the best trajectory so far is returned.
    BudgetExhausted,
    /// Cancellation was requested.
    Cancelled,
    /// Too many snapshot, fork, or generator transport errors.
    InfrastructureFailure,
}

/// One active trajectory in the frontier.
#[derive(Debug)]
struct BeamNode {
    /// Plans applied along this trajectory, oldest first.
    plans: Vec<Plan>,
    /// Pinned snapshot of the trajectory's repository state.
    snapshot: SnapshotId,
    /// Failure signature of this state, conditioning the next expansion.
    failure_signature: String,
}

/// Best trajectory found by a search, reproducible via its snapshot.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub plans: Vec<Plan>,
    pub snapshot: SnapshotId,
}

/// Final result of one search run.
#[derive(Debug)]
pub struct SearchOutcome {
    pub status: TerminalStatus,
    /// Best trajectory observed, if any candidate ever scored above zero.
    pub best: Option<Trajectory>,
    pub best_score: f64,
    /// Deepest depth that was fully processed.
    pub depths_explored: u32,
    /// Audit trail: every outcome recorded during this run, in order.
    pub records: Vec<OutcomeRecord>,
}

struct Candidate {
    parent: usize,
    plan: Plan,
    seq: usize,
}

enum CandidateResult {
    Skipped,
    Infra(anyhow::Error),
    Conflict(String),
    Evaluated(Evaluation),
}

struct CandidateEval {
    sandbox: Option<Sandbox>,
    result: CandidateResult,
}

/// Orchestrates one search over a repository.
pub struct BeamSearcher<'a> {
    config: &'a SearchConfig,
    gate: &'a GateConfig,
    rollback: &'a RollbackManager,
    store: &'a OutcomeStore,
    generator: Arc<dyn Generator>,
    evaluator: &'a dyn Evaluator,
    cancel: CancelToken,
    run_state_path: Option<PathBuf>,
}

impl<'a> BeamSearcher<'a> {
    pub fn new(
        config: &'a SearchConfig,
        gate: &'a GateConfig,
        rollback: &'a RollbackManager,
        store: &'a OutcomeStore,
        generator: Arc<dyn Generator>,
        evaluator: &'a dyn Evaluator,
    ) -> Self {
        Self {
            config,
            gate,
            rollback,
            store,
            generator,
            evaluator,
            cancel: CancelToken::new(),
            run_state_path: None,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Persist progress after every depth to the given path.
    pub fn with_run_state_path(mut self, path: PathBuf) -> Self {
        self.run_state_path = Some(path);
        self
    }

    /// Run the search to a terminal status.
    ///
    /// Infrastructure problems below the abort threshold degrade individual
    /// candidates; an `Err` from here means the search could not even start
    /// or could not restore invariants.
    #[instrument(skip_all)]
    pub fn run(&self, goal: &str, failure_signature: &str) -> Result<SearchOutcome> {
        let initial = self.rollback.snapshot()?;
        let mut frontier = vec![BeamNode {
            plans: Vec::new(),
            snapshot: initial.clone(),
            failure_signature: failure_signature.to_string(),
        }];
        let retry = RetryPolicy::new(
            self.config.generator_max_attempts,
            Duration::from_millis(self.config.generator_retry_base_ms),
        );

        let mut best: Option<Trajectory> = None;
        let mut best_score = 0.0f64;
        let mut trail: Vec<OutcomeRecord> = Vec::new();
        let mut infra_failures = 0usize;
        let mut observations = 0usize;
        let mut depths_explored = 0u32;
        let mut status = TerminalStatus::BudgetExhausted;

        // An interrupted run leaves a non-terminal run state behind; pick
        // up its pinned frontier instead of re-exploring from scratch.
        let mut start_depth = 1u32;
        if let Some(path) = &self.run_state_path {
            match load_run_state(path) {
                Ok(Some(state)) if state.status.is_none() && !state.frontier.is_empty() => {
                    info!(depth = state.depth, "resuming from persisted run state");
                    best_score = state.best_score;
                    depths_explored = state.depth;
                    start_depth = state.depth + 1;
                    frontier = state
                        .frontier
                        .into_iter()
                        .map(|snapshot| BeamNode {
                            plans: Vec::new(),
                            snapshot,
                            failure_signature: failure_signature.to_string(),
                        })
                        .collect();
                }
                Ok(_) => {}
                Err(err) => warn!(err = %err, "ignoring unreadable run state"),
            }
        }

        'depths: for depth in start_depth..=self.config.max_depth {
            if self.cancel.is_cancelled() {
                status = TerminalStatus::Cancelled;
                break 'depths;
            }

            let candidates =
                self.propose(goal, &frontier, &mut observations, &mut infra_failures, retry);
            if candidates.is_empty() && infra_failures == 0 {
                status = self.exhausted_or_cancelled();
                break 'depths;
            }

            let approved = self.gate_candidates(&frontier, candidates, &mut trail);
            if approved.is_empty() {
                if self.infra_rate_exceeded(infra_failures, observations) {
                    status = TerminalStatus::InfrastructureFailure;
                } else {
                    status = self.exhausted_or_cancelled();
                }
                break 'depths;
            }

            let evals = self.evaluate_all(&frontier, &approved);

            // Priors are read before this depth's outcomes are appended so
            // ranking reflects history, not the rows being written now.
            let priors = self.priors_per_parent(&frontier, &approved);

            let mut survivors: Vec<(usize, Evaluation, Sandbox)> = Vec::new();
            let mut winner: Option<(usize, Evaluation, Sandbox)> = None;
            for (idx, (cand, eval)) in approved.iter().zip(evals).enumerate() {
                let context = self.context_for(&frontier[cand.parent]);
                match eval.result {
                    CandidateResult::Skipped => {
                        self.dispose(eval.sandbox);
                    }
                    CandidateResult::Infra(err) => {
                        warn!(seq = cand.seq, err = %err, "candidate lost to infrastructure");
                        observations += 1;
                        infra_failures += 1;
                        self.dispose(eval.sandbox);
                    }
                    CandidateResult::Conflict(detail) => {
                        debug!(seq = cand.seq, detail = %detail, "candidate conflicted on apply");
                        observations += 1;
                        self.record_plan(
                            &mut trail,
                            &context,
                            &cand.plan,
                            CandidateOutcome::Failure,
                            0.0,
                        );
                        self.dispose(eval.sandbox);
                    }
                    CandidateResult::Evaluated(evaluation) => {
                        observations += 1;
                        let outcome = if evaluation.passed {
                            CandidateOutcome::Success
                        } else {
                            CandidateOutcome::Failure
                        };
                        self.record_plan(&mut trail, &context, &cand.plan, outcome, evaluation.score);
                        let Some(sandbox) = eval.sandbox else {
                            continue;
                        };
                        let is_win = evaluation.passed
                            && evaluation.score >= self.config.success_threshold;
                        if is_win && winner.is_none() {
                            winner = Some((idx, evaluation, sandbox));
                        } else if evaluation.passed || evaluation.score > 0.0 {
                            survivors.push((idx, evaluation, sandbox));
                        } else {
                            self.dispose(Some(sandbox));
                        }
                    }
                }
            }

            if let Some((idx, evaluation, sandbox)) = winner {
                let cand = &approved[idx];
                let snapshot = self.rollback.merge(&sandbox)?;
                self.dispose(Some(sandbox));
                for (_, _, leftover) in survivors {
                    self.dispose(Some(leftover));
                }
                let mut plans = frontier[cand.parent].plans.clone();
                plans.push(cand.plan.clone());
                info!(depth, score = evaluation.score, "candidate passed, search succeeded");
                best_score = evaluation.score;
                best = Some(Trajectory { plans, snapshot });
                status = TerminalStatus::Success;
                depths_explored = depth;
                break 'depths;
            }

            if self.infra_rate_exceeded(infra_failures, observations) {
                for (_, _, sandbox) in survivors {
                    self.dispose(Some(sandbox));
                }
                status = TerminalStatus::InfrastructureFailure;
                break 'depths;
            }

            if survivors.is_empty() {
                status = self.exhausted_or_cancelled();
                depths_explored = depth;
                break 'depths;
            }

            let keys: Vec<RankKey> = survivors
                .iter()
                .map(|(idx, evaluation, _)| RankKey {
                    score: evaluation.score,
                    prior: plan_prior(&priors[approved[*idx].parent], &approved[*idx].plan),
                    seq: approved[*idx].seq,
                })
                .collect();
            let kept = prune_to_width(ranked_order(&keys), self.config.width);
            let kept_set: HashSet<usize> = kept.iter().copied().collect();

            let mut next_frontier = Vec::with_capacity(kept.len());
            let mut survivors: Vec<Option<(usize, Evaluation, Sandbox)>> =
                survivors.into_iter().map(Some).collect();
            for &slot in &kept {
                let Some((idx, evaluation, sandbox)) = survivors[slot].take() else {
                    continue;
                };
                let cand = &approved[idx];
                let snapshot = self.rollback.merge(&sandbox)?;
                self.dispose(Some(sandbox));
                let mut plans = frontier[cand.parent].plans.clone();
                plans.push(cand.plan.clone());
                if evaluation.score > best_score || best.is_none() {
                    best_score = evaluation.score.max(best_score);
                    best = Some(Trajectory {
                        plans: plans.clone(),
                        snapshot: snapshot.clone(),
                    });
                }
                next_frontier.push(BeamNode {
                    plans,
                    snapshot,
                    failure_signature: evaluation.detail,
                });
            }
            for (slot, leftover) in survivors.into_iter().enumerate() {
                if !kept_set.contains(&slot) {
                    if let Some((_, _, sandbox)) = leftover {
                        self.dispose(Some(sandbox));
                    }
                }
            }

            self.release_superseded(&frontier, &initial, best.as_ref());
            frontier = next_frontier;
            depths_explored = depth;
            debug!(depth, frontier = frontier.len(), best_score, "depth complete");
            self.persist_progress(depth, &frontier, best_score, None);
        }

        // Cancellation during the final depth otherwise falls out of the
        // loop as a budget cutoff.
        if status == TerminalStatus::BudgetExhausted && self.cancel.is_cancelled() {
            status = TerminalStatus::Cancelled;
        }

        // Terminal frontiers are superseded by the result itself; only the
        // initial snapshot and the best trajectory stay pinned.
        self.release_superseded(&frontier, &initial, best.as_ref());

        let outcome = SearchOutcome {
            status,
            best,
            best_score,
            depths_explored,
            records: trail,
        };
        self.persist_progress(
            depths_explored,
            &frontier,
            best_score,
            Some(outcome.status),
        );
        info!(status = ?outcome.status, best_score, depths_explored, "search finished");
        Ok(outcome)
    }

    /// Ask the generator for up to `branch_factor` plans per frontier node.
    fn propose(
        &self,
        goal: &str,
        frontier: &[BeamNode],
        observations: &mut usize,
        infra_failures: &mut usize,
        retry: RetryPolicy,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (parent, node) in frontier.iter().enumerate() {
            for _ in 0..self.config.branch_factor {
                if self.cancel.is_cancelled() {
                    return candidates;
                }
                let ctx = GenerateContext {
                    goal: goal.to_string(),
                    failure_signature: node.failure_signature.clone(),
                    plans_so_far: node.plans.clone(),
                    timeout: self.config.generator_timeout(),
                };
                *observations += 1;
                match generate_with_retry(&self.generator, &ctx, retry) {
                    Ok(Some(plan)) => {
                        let seq = candidates.len();
                        candidates.push(Candidate { parent, plan, seq });
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(parent, err = %err, "generator gave up for this node");
                        *infra_failures += 1;
                        break;
                    }
                }
            }
        }
        candidates
    }

    /// Apply the gate; rejected plans are recorded as blocked and never
    /// consume a sandbox.
    fn gate_candidates(
        &self,
        frontier: &[BeamNode],
        candidates: Vec<Candidate>,
        trail: &mut Vec<OutcomeRecord>,
    ) -> Vec<Candidate> {
        let mut approved = Vec::new();
        for cand in candidates {
            let verdict = gate::validate(&cand.plan, self.gate);
            if verdict.allowed {
                approved.push(cand);
            } else {
                debug!(seq = cand.seq, reason = ?verdict.reason, "plan blocked by gate");
                let context = self.context_for(&frontier[cand.parent]);
                self.record_plan(trail, &context, &cand.plan, CandidateOutcome::Blocked, 0.0);
            }
        }
        approved
    }

    /// Fork, apply, and evaluate every approved candidate concurrently.
    /// Results come back in candidate order regardless of completion order.
    fn evaluate_all(&self, frontier: &[BeamNode], approved: &[Candidate]) -> Vec<CandidateEval> {
        thread::scope(|scope| {
            let handles: Vec<_> = approved
                .iter()
                .map(|cand| {
                    let parent = &frontier[cand.parent];
                    scope.spawn(move || self.evaluate_candidate(parent, cand))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(eval) => eval,
                    Err(_) => CandidateEval {
                        sandbox: None,
                        result: CandidateResult::Infra(anyhow!("evaluation worker panicked")),
                    },
                })
                .collect()
        })
    }

    fn evaluate_candidate(&self, parent: &BeamNode, cand: &Candidate) -> CandidateEval {
        if self.cancel.is_cancelled() {
            return CandidateEval {
                sandbox: None,
                result: CandidateResult::Skipped,
            };
        }
        let sandbox = match self.rollback.fork(&parent.snapshot) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                return CandidateEval {
                    sandbox: None,
                    result: CandidateResult::Infra(err),
                };
            }
        };
        let applied = match self.rollback.apply(&sandbox, &cand.plan) {
            Ok(outcome) => outcome,
            Err(err) => {
                return CandidateEval {
                    sandbox: Some(sandbox),
                    result: CandidateResult::Infra(err),
                };
            }
        };
        if !applied.applied {
            let detail = applied.conflict.unwrap_or_else(|| "conflict".to_string());
            return CandidateEval {
                sandbox: Some(sandbox),
                result: CandidateResult::Conflict(detail),
            };
        }
        match self
            .evaluator
            .evaluate(sandbox.path(), self.config.evaluator_timeout())
        {
            Ok(evaluation) => CandidateEval {
                sandbox: Some(sandbox),
                result: CandidateResult::Evaluated(evaluation),
            },
            Err(err) => CandidateEval {
                sandbox: Some(sandbox),
                result: CandidateResult::Infra(err),
            },
        }
    }

    fn priors_per_parent(
        &self,
        frontier: &[BeamNode],
        approved: &[Candidate],
    ) -> Vec<BTreeMap<crate::core::plan::ActionKind, Prior>> {
        let needed: HashSet<usize> = approved.iter().map(|cand| cand.parent).collect();
        frontier
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                if needed.contains(&idx) {
                    self.store.query_priors(&self.context_for(node))
                } else {
                    BTreeMap::new()
                }
            })
            .collect()
    }

    fn context_for(&self, node: &BeamNode) -> String {
        context_fingerprint(&node.failure_signature, &self.config.language)
    }

    fn record_plan(
        &self,
        trail: &mut Vec<OutcomeRecord>,
        context: &str,
        plan: &Plan,
        outcome: CandidateOutcome,
        score: f64,
    ) {
        for kind in plan.action_kinds() {
            let record = OutcomeRecord {
                context: context.to_string(),
                action_kind: kind,
                outcome,
                score,
                recorded_at: now_rfc3339(),
            };
            self.store.record(&record);
            trail.push(record);
        }
    }

    fn infra_rate_exceeded(&self, infra_failures: usize, observations: usize) -> bool {
        observations >= 4
            && infra_failures as f64 / observations as f64 > self.config.max_infra_failure_rate
    }

    /// A depth that dies out after cancellation was requested is a
    /// cancellation, not an exhaustion: skipped workers produce no
    /// survivors by construction.
    fn exhausted_or_cancelled(&self) -> TerminalStatus {
        if self.cancel.is_cancelled() {
            TerminalStatus::Cancelled
        } else {
            TerminalStatus::Exhausted
        }
    }

    /// Best-effort sandbox cleanup; a leaked worktree is logged, never fatal.
    fn dispose(&self, sandbox: Option<Sandbox>) {
        if let Some(sandbox) = sandbox {
            if let Err(err) = self.rollback.discard(&sandbox) {
                warn!(err = %err, "failed to discard sandbox");
            }
        }
    }

    /// Unpin snapshots of frontier nodes that are no longer needed, either
    /// because a deeper frontier replaced them or because the search ended.
    /// The initial snapshot and the best trajectory's snapshot stay pinned.
    fn release_superseded(
        &self,
        old_frontier: &[BeamNode],
        initial: &SnapshotId,
        best: Option<&Trajectory>,
    ) {
        for node in old_frontier {
            if node.snapshot == *initial {
                continue;
            }
            if best.is_some_and(|t| t.snapshot == node.snapshot) {
                continue;
            }
            if let Err(err) = self.rollback.release(&node.snapshot) {
                warn!(err = %err, "failed to release snapshot pin");
            }
        }
    }

    fn persist_progress(
        &self,
        depth: u32,
        frontier: &[BeamNode],
        best_score: f64,
        status: Option<TerminalStatus>,
    ) {
        let Some(path) = &self.run_state_path else {
            return;
        };
        let state = RunState {
            depth,
            frontier: frontier.iter().map(|node| node.snapshot.clone()).collect(),
            best_score,
            status,
        };
        if let Err(err) = write_run_state(path, &state) {
            warn!(err = %err, "failed to persist run state");
        }
    }
}

/// Mean historical score over the action kinds a plan uses. Kinds with no
/// history contribute zero, so an unknown plan never outranks a known-good
/// one on prior alone.
fn plan_prior(
    priors: &BTreeMap<crate::core::plan::ActionKind, Prior>,
    plan: &Plan,
) -> f64 {
    let kinds = plan.action_kinds();
    if kinds.is_empty() {
        return 0.0;
    }
    let sum: f64 = kinds
        .iter()
        .map(|kind| priors.get(kind).map_or(0.0, |prior| prior.mean_score))
        .sum();
    sum / kinds.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{Action, ActionKind};

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn terminal_status_serializes_snake_case() {
        let json = serde_json::to_string(&TerminalStatus::InfrastructureFailure).expect("json");
        assert_eq!(json, "\"infrastructure_failure\"");
        let json = serde_json::to_string(&TerminalStatus::BudgetExhausted).expect("json");
        assert_eq!(json, "\"budget_exhausted\"");
    }

    #[test]
    fn plan_prior_averages_over_plan_kinds_only() {
        let mut priors = BTreeMap::new();
        priors.insert(
            ActionKind::FileWrite,
            Prior {
                mean_score: 0.8,
                samples: 4,
            },
        );
        priors.insert(
            ActionKind::Command,
            Prior {
                mean_score: 0.2,
                samples: 1,
            },
        );
        let plan = Plan::new(vec![
            Action::FileWrite {
                path: "a".to_string(),
                contents: String::new(),
            },
            Action::FileDelete {
                path: "b".to_string(),
            },
        ]);
        // file_write has history (0.8), file_delete has none (0.0).
        assert!((plan_prior(&priors, &plan) - 0.4).abs() < 1e-9);
        assert_eq!(plan_prior(&priors, &Plan::default()), 0.0);
    }
}
