//! Evaluator seam and the command-backed reference implementation.
//!
//! An evaluator scores a sandbox after a plan has been applied. A timeout is
//! an evaluation result (score 0, not passed), not an infrastructure error;
//! only failures to run the evaluator at all propagate as `Err`.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;

/// Verdict over one sandbox state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Score in `[0, 1]`, higher is better.
    pub score: f64,
    /// Whether the state satisfies the acceptance criterion outright.
    pub passed: bool,
    /// Free-form detail for logs and failure signatures.
    pub detail: String,
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, workdir: &Path, timeout: Duration) -> Result<Evaluation>;
}

/// Evaluator that runs a fixed command inside the sandbox.
///
/// Exit 0 scores 1.0 and passes, anything else scores 0.0. A line of the
/// form `patchbeam-score: <value>` on stdout overrides the score with a
/// partial-credit value in `[0, 1]`, letting test harnesses report fraction
/// of tests passing.
pub struct CommandEvaluator {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandEvaluator {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("evaluator command must not be empty"));
        }
        Ok(Self {
            command,
            output_limit_bytes,
        })
    }
}

impl Evaluator for CommandEvaluator {
    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn evaluate(&self, workdir: &Path, timeout: Duration) -> Result<Evaluation> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).current_dir(workdir);
        let output = run_command_with_timeout(cmd, timeout, self.output_limit_bytes)?;

        if output.timed_out {
            return Ok(Evaluation {
                score: 0.0,
                passed: false,
                detail: format!("evaluator timed out after {}s", timeout.as_secs()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let passed = output.status.success();
        let mut score = if passed { 1.0 } else { 0.0 };
        if let Some(reported) = parse_reported_score(&stdout) {
            score = reported;
        }

        let detail = if passed {
            "evaluator passed".to_string()
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = last_lines(stderr.trim(), 20);
            format!("evaluator exit {:?}: {tail}", output.status.code())
        };

        debug!(score, passed, "evaluation finished");
        Ok(Evaluation {
            score,
            passed,
            detail,
        })
    }
}

/// Last `patchbeam-score:` line on stdout, when it parses to a value in
/// `[0, 1]`. Out-of-range or unparseable values are ignored.
fn parse_reported_score(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("patchbeam-score:"))
        .filter_map(|rest| rest.trim().parse::<f64>().ok())
        .filter(|score| (0.0..=1.0).contains(score))
        .next_back()
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(command: &[&str]) -> Evaluation {
        let temp = tempfile::tempdir().expect("tempdir");
        let evaluator = CommandEvaluator::new(
            command.iter().map(|s| s.to_string()).collect(),
            100_000,
        )
        .expect("evaluator");
        evaluator
            .evaluate(temp.path(), Duration::from_secs(5))
            .expect("evaluate")
    }

    #[test]
    fn exit_zero_passes_with_full_score() {
        let result = eval(&["true"]);
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn nonzero_exit_fails_with_zero_score() {
        let result = eval(&["false"]);
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn reported_score_overrides_exit_mapping() {
        let result = eval(&["sh", "-c", "echo 'patchbeam-score: 0.75'; exit 1"]);
        assert!(!result.passed);
        assert_eq!(result.score, 0.75);
    }

    #[test]
    fn out_of_range_reported_score_is_ignored() {
        let result = eval(&["sh", "-c", "echo 'patchbeam-score: 3.5'; exit 1"]);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn timeout_is_a_result_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let evaluator =
            CommandEvaluator::new(vec!["sleep".to_string(), "5".to_string()], 1000).expect("new");
        let result = evaluator
            .evaluate(temp.path(), Duration::from_millis(50))
            .expect("evaluate");
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.detail.contains("timed out"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandEvaluator::new(Vec::new(), 1000).is_err());
    }
}
