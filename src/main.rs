//! Gated beam search CLI.
//!
//! Runs searches over a target git repository, keeping all run state under
//! the repository's `.patchbeam/` directory (config, outcome log, run
//! state, sandbox worktrees).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;

use patchbeam::core::fingerprint::context_fingerprint;
use patchbeam::exit_codes;
use patchbeam::io::config::{Config, load_config, write_config};
use patchbeam::io::evaluator::CommandEvaluator;
use patchbeam::io::generator::{FilePlanGenerator, Generator};
use patchbeam::io::outcome_store::OutcomeStore;
use patchbeam::io::rollback::RollbackManager;
use patchbeam::search::{BeamSearcher, TerminalStatus};

const STATE_DIR: &str = ".patchbeam";

#[derive(Parser)]
#[command(
    name = "patchbeam",
    version,
    about = "Gated beam search for automated repository repair"
)]
struct Cli {
    /// Target git repository.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and write defaults if none exists.
    Check,
    /// Search for a repair, consuming candidate plans from a directory of
    /// plan JSON files.
    Run {
        /// Repair goal, passed to the generator.
        #[arg(long)]
        goal: String,
        /// Directory of candidate plan JSON files.
        #[arg(long)]
        plans: PathBuf,
        /// Failure signature of the current broken state.
        #[arg(long, default_value = "")]
        signature: String,
    },
    /// Print historical priors for a failure signature as JSON.
    Priors {
        #[arg(long)]
        signature: String,
    },
}

fn main() {
    patchbeam::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if !cli.repo.join(".git").exists() {
        bail!("{} is not a git repository", cli.repo.display());
    }
    let state_dir = cli.repo.join(STATE_DIR);
    match cli.command {
        Command::Check => cmd_check(&state_dir),
        Command::Run {
            goal,
            plans,
            signature,
        } => cmd_run(&cli.repo, &state_dir, &goal, &plans, &signature),
        Command::Priors { signature } => cmd_priors(&state_dir, &signature),
    }
}

fn cmd_check(state_dir: &Path) -> Result<i32> {
    let config_path = state_dir.join("config.toml");
    if config_path.exists() {
        load_config(&config_path)?;
    } else {
        write_config(&config_path, &Config::default())?;
        ensure_state_ignored(state_dir)?;
        println!("wrote default config to {}", config_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(
    repo: &Path,
    state_dir: &Path,
    goal: &str,
    plans: &Path,
    signature: &str,
) -> Result<i32> {
    let config = load_config(&state_dir.join("config.toml"))?;
    ensure_state_ignored(state_dir)?;

    let rollback = RollbackManager::new(
        repo,
        state_dir.join("worktrees"),
        config.search.command_timeout(),
        config.search.output_limit_bytes,
    );
    let store = OutcomeStore::new(state_dir.join("outcomes.jsonl"));
    let generator: Arc<dyn Generator> = Arc::new(FilePlanGenerator::from_dir(plans)?);
    let evaluator = CommandEvaluator::new(
        config.search.evaluator_command.clone(),
        config.search.output_limit_bytes,
    )?;

    let searcher = BeamSearcher::new(
        &config.search,
        &config.gate,
        &rollback,
        &store,
        generator,
        &evaluator,
    )
    .with_run_state_path(state_dir.join("run_state.json"));

    let outcome = searcher.run(goal, signature)?;

    let summary = json!({
        "status": outcome.status,
        "best_score": outcome.best_score,
        "depths_explored": outcome.depths_explored,
        "best_snapshot": outcome.best.as_ref().map(|t| t.snapshot.as_str()),
        "best_plan_steps": outcome.best.as_ref().map(|t| {
            t.plans.iter().map(patchbeam::core::plan::Plan::step_count).sum::<usize>()
        }),
        "outcomes_recorded": outcome.records.len(),
    });
    println!("{summary:#}");

    Ok(match outcome.status {
        TerminalStatus::Success => exit_codes::OK,
        TerminalStatus::Exhausted => exit_codes::EXHAUSTED,
        TerminalStatus::BudgetExhausted => exit_codes::BUDGET,
        TerminalStatus::Cancelled => exit_codes::CANCELLED,
        TerminalStatus::InfrastructureFailure => exit_codes::INFRA,
    })
}

fn cmd_priors(state_dir: &Path, signature: &str) -> Result<i32> {
    let config = load_config(&state_dir.join("config.toml"))?;
    let store = OutcomeStore::new(state_dir.join("outcomes.jsonl"));
    let context = context_fingerprint(signature, &config.search.language);
    let priors = store.query_priors(&context);

    let entries: serde_json::Map<String, serde_json::Value> = priors
        .into_iter()
        .map(|(kind, prior)| {
            (
                kind.as_str().to_string(),
                json!({ "mean_score": prior.mean_score, "samples": prior.samples }),
            )
        })
        .collect();
    let report = json!({ "context": context, "priors": entries });
    println!("{report:#}");
    Ok(exit_codes::OK)
}

/// Make the state directory invisible to the search itself: snapshots must
/// never capture sandbox worktrees or the outcome log.
fn ensure_state_ignored(state_dir: &Path) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("create {}", state_dir.display()))?;
    let ignore_path = state_dir.join(".gitignore");
    if !ignore_path.exists() {
        fs::write(&ignore_path, "*\n")
            .with_context(|| format!("write {}", ignore_path.display()))?;
    }
    Ok(())
}
