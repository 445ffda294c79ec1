//! Git-backed snapshot, fork, and rollback layer.
//!
//! All repository mutation flows through the snapshot/fork/apply/merge
//! lifecycle; nothing else in the crate writes to a working copy. Snapshots
//! are plain commits (content-addressed, survive restarts) pinned under
//! `refs/patchbeam/snapshots/` so they are never garbage-collected until
//! explicitly released. Forks are detached worktrees: they share the object
//! store but own private working trees, so concurrent sandboxes never alias
//! each other's files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::plan::{Action, Plan};
use crate::io::process::run_command_with_timeout;

const SNAPSHOT_REF_PREFIX: &str = "refs/patchbeam/snapshots/";

/// Content-addressed reference to an immutable repository state (a commit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Isolated working copy forked from a snapshot.
///
/// A sandbox has exactly one owner at a time; the type is deliberately not
/// `Clone` so ownership transfers are visible in the code that does them.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
    base: SnapshotId,
}

impl Sandbox {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> &SnapshotId {
        &self.base
    }
}

/// Result of applying a plan to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: bool,
    /// Human-readable conflict description when the plan could not be
    /// applied cleanly (stale base). `None` when `applied` is true.
    pub conflict: Option<String>,
}

impl ApplyOutcome {
    fn applied() -> Self {
        Self {
            applied: true,
            conflict: None,
        }
    }

    fn conflict(detail: String) -> Self {
        Self {
            applied: false,
            conflict: Some(detail),
        }
    }
}

/// Snapshot/fork/apply/discard/merge over a git repository.
pub struct RollbackManager {
    repo: PathBuf,
    scratch: PathBuf,
    fork_seq: AtomicU64,
    command_timeout: Duration,
    output_limit_bytes: usize,
}

impl RollbackManager {
    pub fn new(
        repo: impl Into<PathBuf>,
        scratch: impl Into<PathBuf>,
        command_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            repo: repo.into(),
            scratch: scratch.into(),
            fork_seq: AtomicU64::new(0),
            command_timeout,
            output_limit_bytes,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Capture the current state of the primary working copy as an
    /// immutable, pinned snapshot.
    #[instrument(skip_all)]
    pub fn snapshot(&self) -> Result<SnapshotId> {
        self.ensure_no_unmerged(&self.repo)?;
        self.run_checked(&self.repo, &["add", "-A"])?;
        self.commit(&self.repo, "patchbeam: snapshot")?;
        let sha = self.head_sha(&self.repo)?;
        let id = SnapshotId(sha);
        self.pin(&id)?;
        debug!(snapshot = %id.short(), "captured snapshot");
        Ok(id)
    }

    /// Fork an isolated sandbox from a snapshot. Concurrent forks from the
    /// same snapshot are independent: each gets its own detached worktree.
    #[instrument(skip_all, fields(snapshot = %snapshot.short()))]
    pub fn fork(&self, snapshot: &SnapshotId) -> Result<Sandbox> {
        fs::create_dir_all(&self.scratch)
            .with_context(|| format!("create scratch dir {}", self.scratch.display()))?;
        let seq = self.fork_seq.fetch_add(1, Ordering::Relaxed);
        let dir = self.scratch.join(format!("sbx-{}-{seq}", snapshot.short()));
        let dir_str = dir
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 sandbox path {}", dir.display()))?;
        self.run_checked(
            &self.repo,
            &["worktree", "add", "--detach", dir_str, snapshot.as_str()],
        )?;
        debug!(sandbox = %dir.display(), "forked sandbox");
        Ok(Sandbox {
            path: dir,
            base: snapshot.clone(),
        })
    }

    /// Apply a gate-approved plan onto a sandbox.
    ///
    /// Atomic: either every action lands or the sandbox is hard-reset to its
    /// base snapshot and the failure is reported as a conflict. Never
    /// returns a half-applied sandbox.
    #[instrument(skip_all, fields(actions = plan.step_count()))]
    pub fn apply(&self, sandbox: &Sandbox, plan: &Plan) -> Result<ApplyOutcome> {
        for (index, action) in plan.actions.iter().enumerate() {
            match self.apply_action(sandbox, action) {
                Ok(None) => {}
                Ok(Some(conflict)) => {
                    warn!(index, conflict = %conflict, "plan conflicted, resetting sandbox");
                    self.reset_to_base(sandbox)?;
                    return Ok(ApplyOutcome::conflict(format!("action {index}: {conflict}")));
                }
                Err(err) => {
                    // Infrastructure error: still restore the sandbox before
                    // propagating so the caller never sees partial state.
                    self.reset_to_base(sandbox)?;
                    return Err(err);
                }
            }
        }
        Ok(ApplyOutcome::applied())
    }

    /// Release a sandbox's resources. Idempotent: safe to call twice and
    /// safe on a sandbox that was never applied to.
    #[instrument(skip_all, fields(sandbox = %sandbox.path.display()))]
    pub fn discard(&self, sandbox: &Sandbox) -> Result<()> {
        if !sandbox.path.exists() {
            return Ok(());
        }
        let dir_str = sandbox
            .path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 sandbox path {}", sandbox.path.display()))?;
        if let Err(err) = self.run_checked(
            &self.repo,
            &["worktree", "remove", "--force", "--force", dir_str],
        ) {
            // The worktree may already be half-removed; fall back to a
            // direct delete plus prune so discard stays idempotent.
            warn!(err = %err, "worktree remove failed, pruning");
            fs::remove_dir_all(&sandbox.path)
                .with_context(|| format!("remove sandbox {}", sandbox.path.display()))?;
            self.run_checked(&self.repo, &["worktree", "prune"])?;
        }
        debug!("sandbox discarded");
        Ok(())
    }

    /// Promote a sandbox's current state to a new immutable, pinned
    /// snapshot. The sandbox remains valid until discarded.
    #[instrument(skip_all, fields(sandbox = %sandbox.path.display()))]
    pub fn merge(&self, sandbox: &Sandbox) -> Result<SnapshotId> {
        self.run_checked(&sandbox.path, &["add", "-A"])?;
        self.commit(&sandbox.path, "patchbeam: merge sandbox")?;
        let sha = self.head_sha(&sandbox.path)?;
        let id = SnapshotId(sha);
        self.pin(&id)?;
        debug!(snapshot = %id.short(), "merged sandbox into snapshot");
        Ok(id)
    }

    /// Drop the pin keeping a snapshot alive. The commit stays resolvable
    /// until git prunes unreachable objects.
    pub fn release(&self, snapshot: &SnapshotId) -> Result<()> {
        let reference = format!("{SNAPSHOT_REF_PREFIX}{}", snapshot.as_str());
        self.run_checked(&self.repo, &["update-ref", "-d", &reference])?;
        Ok(())
    }

    fn apply_action(&self, sandbox: &Sandbox, action: &Action) -> Result<Option<String>> {
        match action {
            Action::FileWrite { path, contents } => {
                let target = sandbox.path.join(path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::write(&target, contents)
                    .with_context(|| format!("write {}", target.display()))?;
                Ok(None)
            }
            Action::FileDelete { path } => {
                let target = sandbox.path.join(path);
                if !target.exists() {
                    return Ok(Some(format!("delete target missing: {path}")));
                }
                if target.is_dir() {
                    fs::remove_dir_all(&target)
                        .with_context(|| format!("remove {}", target.display()))?;
                } else {
                    fs::remove_file(&target)
                        .with_context(|| format!("remove {}", target.display()))?;
                }
                Ok(None)
            }
            Action::Command { command } => {
                let mut parts = command.split_whitespace();
                let Some(program) = parts.next() else {
                    return Ok(Some("empty command".to_string()));
                };
                let mut cmd = Command::new(program);
                cmd.args(parts).current_dir(&sandbox.path);
                let output =
                    run_command_with_timeout(cmd, self.command_timeout, self.output_limit_bytes)?;
                if output.timed_out {
                    return Ok(Some(format!("command timed out: {command}")));
                }
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Ok(Some(format!(
                        "command failed ({:?}): {}",
                        output.status.code(),
                        stderr.trim()
                    )));
                }
                Ok(None)
            }
            Action::DependencyChange { manifest, contents } => {
                let target = sandbox.path.join(manifest);
                if !target.exists() {
                    return Ok(Some(format!("manifest missing: {manifest}")));
                }
                fs::write(&target, contents)
                    .with_context(|| format!("write {}", target.display()))?;
                Ok(None)
            }
        }
    }

    fn reset_to_base(&self, sandbox: &Sandbox) -> Result<()> {
        self.run_checked(
            &sandbox.path,
            &["reset", "--hard", sandbox.base.as_str()],
        )?;
        self.run_checked(&sandbox.path, &["clean", "-fd"])?;
        Ok(())
    }

    fn ensure_no_unmerged(&self, dir: &Path) -> Result<()> {
        let out = self.run_capture(dir, &["ls-files", "--unmerged"])?;
        if !out.trim().is_empty() {
            return Err(anyhow!(
                "working copy has unmerged paths, cannot snapshot"
            ));
        }
        Ok(())
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<()> {
        // Identity is pinned so snapshots work in repos without git config;
        // hooks are skipped because repository-controlled code must not run
        // during state capture.
        self.run_checked(
            dir,
            &[
                "-c",
                "user.name=patchbeam",
                "-c",
                "user.email=patchbeam@localhost",
                "commit",
                "--quiet",
                "--allow-empty",
                "--no-verify",
                "-m",
                message,
            ],
        )?;
        Ok(())
    }

    fn head_sha(&self, dir: &Path) -> Result<String> {
        let out = self.run_capture(dir, &["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    fn pin(&self, snapshot: &SnapshotId) -> Result<()> {
        let reference = format!("{SNAPSHOT_REF_PREFIX}{}", snapshot.as_str());
        self.run_checked(&self.repo, &["update-ref", &reference, snapshot.as_str()])?;
        Ok(())
    }

    fn run_capture(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.run_checked(dir, args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.run(dir, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
