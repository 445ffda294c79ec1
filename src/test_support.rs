//! Shared fixtures for unit and integration tests.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::plan::{Action, Plan};
use crate::io::evaluator::{Evaluation, Evaluator};
use crate::io::generator::{GenerateContext, Generator};

/// Throwaway git repository with one initial commit and a `.patchbeam/`
/// state directory that ignores itself.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet", "--initial-branch=main"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "user.email", "test@localhost"])?;
        fs::write(repo.root().join("README.md"), "# fixture\n").context("write README")?;
        fs::create_dir_all(repo.root().join(".patchbeam")).context("create state dir")?;
        fs::write(repo.root().join(".patchbeam/.gitignore"), "*\n").context("write gitignore")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "--quiet", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let target = self.root().join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create parent dir")?;
        }
        fs::write(&target, contents).with_context(|| format!("write {path}"))
    }

    /// Leave the index with an unmerged entry by constructing a real merge
    /// conflict on a scratch branch.
    pub fn create_unmerged_entry(&self) -> Result<()> {
        self.write_file("conflicted.txt", "base\n")?;
        self.git(&["add", "-A"])?;
        self.git(&["commit", "--quiet", "-m", "base"])?;
        self.git(&["checkout", "--quiet", "-b", "side"])?;
        self.write_file("conflicted.txt", "side\n")?;
        self.git(&["commit", "--quiet", "-am", "side"])?;
        self.git(&["checkout", "--quiet", "main"])?;
        self.write_file("conflicted.txt", "main\n")?;
        self.git(&["commit", "--quiet", "-am", "main"])?;
        // Expected to fail with a conflict; the unmerged index entry is the
        // state under test.
        let _ = self.try_git(&["merge", "side"]);
        Ok(())
    }

    pub fn git(&self, args: &[&str]) -> Result<()> {
        let output = self.try_git(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(())
    }

    fn try_git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Plan builder shorthand used across tests.
pub fn file_write(path: &str, contents: &str) -> Action {
    Action::FileWrite {
        path: path.to_string(),
        contents: contents.to_string(),
    }
}

pub fn write_plan(path: &str, contents: &str) -> Plan {
    Plan::new(vec![file_write(path, contents)])
}

/// Generator that yields a fixed sequence of plans, then reports drained.
pub struct ScriptedGenerator {
    plans: Mutex<VecDeque<Plan>>,
}

impl ScriptedGenerator {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
        }
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, _ctx: &GenerateContext) -> Result<Option<Plan>> {
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(plans.pop_front())
    }
}

/// Evaluator scripted by sandbox contents rather than call order, so it
/// stays deterministic when candidates are evaluated concurrently. The
/// first rule whose marker file exists in the sandbox decides the verdict.
pub struct ScriptedEvaluator {
    rules: Vec<(String, Evaluation)>,
    default: Evaluation,
}

impl ScriptedEvaluator {
    pub fn new(rules: Vec<(String, Evaluation)>, default: Evaluation) -> Self {
        Self { rules, default }
    }

    pub fn failing_everything() -> Self {
        Self::new(
            Vec::new(),
            Evaluation {
                score: 0.0,
                passed: false,
                detail: "still failing".to_string(),
            },
        )
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, workdir: &Path, _timeout: Duration) -> Result<Evaluation> {
        for (marker, evaluation) in &self.rules {
            if workdir.join(marker).exists() {
                return Ok(evaluation.clone());
            }
        }
        Ok(self.default.clone())
    }
}

pub fn passing(score: f64) -> Evaluation {
    Evaluation {
        score,
        passed: true,
        detail: "evaluator passed".to_string(),
    }
}

pub fn failing(score: f64, detail: &str) -> Evaluation {
    Evaluation {
        score,
        passed: false,
        detail: detail.to_string(),
    }
}
