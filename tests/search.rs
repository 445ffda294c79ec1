//! Search-level tests driving the full pipeline end to end: scripted
//! generator, real gate, real git-backed rollback, scripted evaluator.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use patchbeam::core::plan::{Action, Plan};
use patchbeam::io::config::SearchConfig;
use patchbeam::io::evaluator::{Evaluation, Evaluator};
use patchbeam::io::generator::{GenerateContext, Generator};
use patchbeam::io::outcome_store::OutcomeStore;
use patchbeam::io::rollback::RollbackManager;
use patchbeam::io::run_state::{RunState, load_run_state, write_run_state};
use patchbeam::search::{BeamSearcher, CancelToken, TerminalStatus};
use patchbeam::test_support::{
    ScriptedEvaluator, ScriptedGenerator, TestRepo, failing, passing, write_plan,
};

fn search_config(width: usize, max_depth: u32, branch_factor: usize) -> SearchConfig {
    SearchConfig {
        width,
        max_depth,
        branch_factor,
        generator_retry_base_ms: 1,
        ..SearchConfig::default()
    }
}

fn manager(repo: &TestRepo, config: &SearchConfig) -> RollbackManager {
    RollbackManager::new(
        repo.root(),
        repo.root().join(".patchbeam/worktrees"),
        config.command_timeout(),
        config.output_limit_bytes,
    )
}

fn scripted(plans: Vec<Plan>) -> Arc<dyn Generator> {
    Arc::new(ScriptedGenerator::new(plans))
}

/// Number of snapshots still pinned under the crate's ref namespace.
fn snapshot_pins(repo: &TestRepo) -> usize {
    let output = Command::new("git")
        .args(["for-each-ref", "refs/patchbeam/snapshots"])
        .current_dir(repo.root())
        .output()
        .expect("git for-each-ref");
    String::from_utf8_lossy(&output.stdout).lines().count()
}

#[test]
fn greedy_search_succeeds_at_depth_one() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 3, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator = scripted(vec![write_plan("fix.txt", "patched")]);
    let evaluator = ScriptedEvaluator::new(
        vec![("fix.txt".to_string(), passing(1.0))],
        failing(0.0, "still failing"),
    );

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::Success);
    assert_eq!(outcome.best_score, 1.0);
    assert_eq!(outcome.depths_explored, 1);

    // The winning state is reachable through its snapshot, and the primary
    // working copy was never mutated.
    let best = outcome.best.expect("trajectory");
    assert_eq!(best.plans.len(), 1);
    assert!(!repo.root().join("fix.txt").exists());
    let check = rollback.fork(&best.snapshot).expect("fork winner");
    assert_eq!(
        fs::read_to_string(check.path().join("fix.txt")).expect("read"),
        "patched"
    );
    rollback.discard(&check).expect("discard");

    // Only the initial snapshot and the winner stay pinned.
    assert_eq!(snapshot_pins(&repo), 2);
}

#[test]
fn blocked_plans_are_recorded_without_consuming_a_sandbox() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 2, 1);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    // Default policy makes .git immutable, so this plan must be blocked.
    let generator = scripted(vec![write_plan(".git/hooks/pre-commit", "#!/bin/sh")]);
    let evaluator = ScriptedEvaluator::failing_everything();

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::Exhausted);
    assert!(outcome.best.is_none());
    assert_eq!(outcome.records.len(), 1);

    let log = fs::read_to_string(repo.root().join(".patchbeam/outcomes.jsonl")).expect("log");
    assert!(log.contains("\"blocked\""));
    // No fork ever happened, so the scratch directory was never created.
    assert!(!repo.root().join(".patchbeam/worktrees").exists());
}

#[test]
fn partial_progress_survives_and_is_returned_on_exhaustion() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 3, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    // One partial improvement, then the generator drains.
    let generator = scripted(vec![write_plan("partial.txt", "some tests fixed")]);
    let evaluator = ScriptedEvaluator::new(
        vec![("partial.txt".to_string(), failing(0.4, "3 of 5 tests pass"))],
        failing(0.0, "still failing"),
    );

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::Exhausted);
    assert_eq!(outcome.best_score, 0.4);
    let best = outcome.best.expect("best trajectory");
    let check = rollback.fork(&best.snapshot).expect("fork best");
    assert!(check.path().join("partial.txt").exists());
    rollback.discard(&check).expect("discard");
}

#[test]
fn zero_scoring_candidates_never_survive() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(2, 3, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator = scripted(vec![write_plan("a.txt", "a"), write_plan("b.txt", "b")]);
    let evaluator = ScriptedEvaluator::failing_everything();

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    // Every depth-1 candidate scored zero, so the search ends at depth 1
    // with nothing to return.
    assert_eq!(outcome.status, TerminalStatus::Exhausted);
    assert_eq!(outcome.depths_explored, 1);
    assert!(outcome.best.is_none());
}

#[test]
fn depth_budget_returns_best_so_far() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 2, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator = scripted(vec![
        write_plan("a.txt", "a"),
        write_plan("b.txt", "b"),
        write_plan("c.txt", "c"),
        write_plan("d.txt", "d"),
    ]);
    // Later-depth markers first: a depth-2 sandbox also contains its
    // depth-1 ancestor's file.
    let evaluator = ScriptedEvaluator::new(
        vec![
            ("c.txt".to_string(), failing(0.6, "closer")),
            ("d.txt".to_string(), failing(0.5, "closer")),
            ("a.txt".to_string(), failing(0.3, "slightly better")),
            ("b.txt".to_string(), failing(0.2, "slightly better")),
        ],
        failing(0.0, "still failing"),
    );

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::BudgetExhausted);
    assert_eq!(outcome.depths_explored, 2);
    assert_eq!(outcome.best_score, 0.6);
    let best = outcome.best.expect("best trajectory");
    assert_eq!(best.plans.len(), 2);

    // Intermediate snapshots were unpinned along the way and at the end.
    assert_eq!(snapshot_pins(&repo), 2);
}

#[test]
fn pre_cancelled_token_stops_before_any_expansion() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 3, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator = scripted(vec![write_plan("fix.txt", "patched")]);
    let evaluator = ScriptedEvaluator::failing_everything();

    let cancel = CancelToken::new();
    cancel.cancel();
    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator)
        .with_cancel_token(cancel);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::Cancelled);
    assert_eq!(outcome.depths_explored, 0);
    assert!(outcome.best.is_none());
}

#[test]
fn cancellation_during_evaluation_reports_cancelled() {
    // Flips the shared token while the depth is mid-flight, like an
    // operator interrupt landing during a long evaluation.
    struct InterruptingEvaluator {
        token: CancelToken,
    }
    impl Evaluator for InterruptingEvaluator {
        fn evaluate(&self, _workdir: &Path, _timeout: Duration) -> Result<Evaluation> {
            self.token.cancel();
            Ok(failing(0.0, "interrupted"))
        }
    }

    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 3, 1);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator = scripted(vec![write_plan("fix.txt", "patched")]);

    let cancel = CancelToken::new();
    let evaluator = InterruptingEvaluator {
        token: cancel.clone(),
    };
    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator)
        .with_cancel_token(cancel);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::Cancelled);
}

#[test]
fn frontier_is_pruned_to_width_and_persisted() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(2, 3, 3);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator = scripted(vec![
        write_plan("a.txt", "a"),
        write_plan("b.txt", "b"),
        write_plan("c.txt", "c"),
    ]);
    let evaluator = ScriptedEvaluator::new(
        vec![
            ("a.txt".to_string(), failing(0.5, "a")),
            ("b.txt".to_string(), failing(0.7, "b")),
            ("c.txt".to_string(), failing(0.6, "c")),
        ],
        failing(0.0, "still failing"),
    );

    let state_path = repo.root().join(".patchbeam/run_state.json");
    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator)
        .with_run_state_path(state_path.clone());
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    // Three candidates survived depth 1 but only two fit the beam; the
    // generator then drains and the search exhausts.
    assert_eq!(outcome.status, TerminalStatus::Exhausted);
    assert_eq!(outcome.best_score, 0.7);

    let state = load_run_state(&state_path).expect("load").expect("present");
    assert_eq!(state.frontier.len(), 2);
    assert_eq!(state.status, Some(TerminalStatus::Exhausted));
    assert_eq!(state.best_score, 0.7);
}

#[test]
fn run_resumes_from_a_persisted_frontier() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 2, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));

    // Fabricate the state an interrupted run leaves behind: a merged
    // depth-1 snapshot pinned in the frontier, no terminal status.
    let base = rollback.snapshot().expect("snapshot");
    let sandbox = rollback.fork(&base).expect("fork");
    let applied = rollback
        .apply(&sandbox, &write_plan("partial.txt", "step one"))
        .expect("apply");
    assert!(applied.applied);
    let resumed = rollback.merge(&sandbox).expect("merge");
    rollback.discard(&sandbox).expect("discard");

    let state_path = repo.root().join(".patchbeam/run_state.json");
    write_run_state(
        &state_path,
        &RunState {
            depth: 1,
            frontier: vec![resumed],
            best_score: 0.4,
            status: None,
        },
    )
    .expect("write state");

    let generator = scripted(vec![write_plan("fix.txt", "patched")]);
    let evaluator = ScriptedEvaluator::new(
        vec![("fix.txt".to_string(), passing(1.0))],
        failing(0.0, "still failing"),
    );
    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator)
        .with_run_state_path(state_path);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    // The search picked up at depth 2 on top of the persisted snapshot:
    // the winner carries both the earlier progress and the new fix.
    assert_eq!(outcome.status, TerminalStatus::Success);
    let best = outcome.best.expect("trajectory");
    let check = rollback.fork(&best.snapshot).expect("fork winner");
    assert!(check.path().join("partial.txt").exists());
    assert!(check.path().join("fix.txt").exists());
    rollback.discard(&check).expect("discard");
}

#[test]
fn persistent_infrastructure_errors_abort_the_search() {
    // Yields real plans at depth 1, then every call fails like an
    // unreachable backend.
    struct FlakyBackend {
        plans: Mutex<VecDeque<Plan>>,
    }
    impl Generator for FlakyBackend {
        fn generate(&self, _ctx: &GenerateContext) -> Result<Option<Plan>> {
            match self.plans.lock().unwrap().pop_front() {
                Some(plan) => Ok(Some(plan)),
                None => anyhow::bail!("backend unreachable"),
            }
        }
    }

    let repo = TestRepo::new().expect("repo");
    let config = SearchConfig {
        width: 2,
        max_depth: 4,
        branch_factor: 2,
        generator_max_attempts: 1,
        generator_retry_base_ms: 1,
        max_infra_failure_rate: 0.25,
        ..SearchConfig::default()
    };
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    let generator: Arc<dyn Generator> = Arc::new(FlakyBackend {
        plans: Mutex::new(vec![write_plan("a.txt", "a"), write_plan("b.txt", "b")].into()),
    });
    let evaluator = ScriptedEvaluator::new(
        vec![
            ("a.txt".to_string(), failing(0.5, "a")),
            ("b.txt".to_string(), failing(0.4, "b")),
        ],
        failing(0.0, "still failing"),
    );

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    // Depth 1 produced real progress; depth 2's generator failures push
    // the infra rate over the threshold and the run aborts loudly.
    assert_eq!(outcome.status, TerminalStatus::InfrastructureFailure);
    assert_eq!(outcome.best_score, 0.5);
    assert!(outcome.best.is_some());
}

#[test]
fn conflicting_plan_is_a_failure_data_point_not_an_error() {
    let repo = TestRepo::new().expect("repo");
    let config = search_config(1, 2, 2);
    let gate = patchbeam::core::gate::GateConfig::default();
    let rollback = manager(&repo, &config);
    let store = OutcomeStore::new(repo.root().join(".patchbeam/outcomes.jsonl"));
    // Deleting a file that does not exist conflicts on apply; the second
    // plan is a real improvement.
    let generator = scripted(vec![
        Plan::new(vec![Action::FileDelete {
            path: "no_such_file.txt".to_string(),
        }]),
        write_plan("fix.txt", "patched"),
    ]);
    let evaluator = ScriptedEvaluator::new(
        vec![("fix.txt".to_string(), passing(1.0))],
        failing(0.0, "still failing"),
    );

    let searcher = BeamSearcher::new(&config, &gate, &rollback, &store, generator, &evaluator);
    let outcome = searcher.run("fix the build", "error: boom").expect("run");

    assert_eq!(outcome.status, TerminalStatus::Success);
    let log = fs::read_to_string(repo.root().join(".patchbeam/outcomes.jsonl")).expect("log");
    assert!(log.contains("\"file_delete\""));
    assert!(log.contains("\"failure\""));
}
