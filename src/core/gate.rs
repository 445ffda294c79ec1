//! Static safety policy for candidate plans.
//!
//! The gate is a pure function over immutable inputs: no state, no side
//! effects, safe to call from any number of workers without coordination.
//! A plan is accepted or rejected atomically; one failing action rejects
//! the whole batch so a rejected plan can never be partially applied.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::plan::{Action, Plan};

/// Characters that allow chaining, substitution, or redirection. A command
/// containing any of these is rejected before the allowlist is consulted.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '<', '>', '`', '$', '(', ')', '{', '}', '*', '?', '~', '#', '\\', '\'', '"',
    '\n', '\r',
];

/// Policy configuration. Loaded once per run, read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Executables a command action may invoke.
    pub command_allowlist: BTreeSet<String>,
    /// Roots (relative to the repository) that every target path must stay
    /// under after `..` normalization.
    pub path_roots: Vec<String>,
    /// Control surface that may never be touched. This set dominates every
    /// other rule and cannot be weakened by any other configuration.
    pub immutable_paths: Vec<String>,
    /// Ceiling on cumulative payload bytes per plan.
    pub max_plan_bytes: usize,
    /// Ceiling on actions per plan.
    pub max_plan_steps: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            command_allowlist: BTreeSet::new(),
            path_roots: vec![".".to_string()],
            immutable_paths: vec![".git".to_string(), ".patchbeam".to_string()],
            max_plan_bytes: 256 * 1024,
            max_plan_steps: 16,
        }
    }
}

impl GateConfig {
    /// Structural validation. Failures here are fatal at startup; a search
    /// never begins with a malformed gate.
    pub fn validate(&self) -> Result<(), String> {
        if self.path_roots.is_empty() {
            return Err("gate.path_roots must not be empty".to_string());
        }
        for root in &self.path_roots {
            if normalize_relative(root).is_none() {
                return Err(format!("gate.path_roots entry '{root}' is not a relative path"));
            }
        }
        if self.max_plan_bytes == 0 {
            return Err("gate.max_plan_bytes must be > 0".to_string());
        }
        if self.max_plan_steps == 0 {
            return Err("gate.max_plan_steps must be > 0".to_string());
        }
        Ok(())
    }
}

/// Enumerated rejection codes, stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnsafeCommand,
    DisallowedCommand,
    PathEscape,
    ImmutableViolation,
    BudgetExceeded,
}

/// Gate verdict. Same `(plan, config)` inputs always yield the same result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
}

impl ValidationResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: RejectReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Validate a plan against the gate policy.
///
/// The immutable-control-surface check runs first because it dominates every
/// other rule; among the remaining rules the first failing action decides the
/// rejection code.
pub fn validate(plan: &Plan, config: &GateConfig) -> ValidationResult {
    for action in &plan.actions {
        for path in action.target_paths() {
            if touches_immutable(path, &config.immutable_paths) {
                return ValidationResult::reject(RejectReason::ImmutableViolation);
            }
        }
    }

    for action in &plan.actions {
        if let Action::Command { command } = action {
            if command.contains(SHELL_METACHARACTERS) {
                return ValidationResult::reject(RejectReason::UnsafeCommand);
            }
            let program = command.split_whitespace().next().unwrap_or("");
            if program.is_empty() || !config.command_allowlist.contains(program) {
                return ValidationResult::reject(RejectReason::DisallowedCommand);
            }
        }
        for path in action.target_paths() {
            if !resolves_under_roots(path, &config.path_roots) {
                return ValidationResult::reject(RejectReason::PathEscape);
            }
        }
    }

    if plan.step_count() > config.max_plan_steps || plan.payload_bytes() > config.max_plan_bytes {
        return ValidationResult::reject(RejectReason::BudgetExceeded);
    }

    ValidationResult::allow()
}

/// Lexically normalize a relative path, resolving `.` and `..` without
/// touching the filesystem. Returns `None` for absolute paths and for paths
/// that traverse above their starting point.
fn normalize_relative(path: &str) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

fn resolves_under_roots(path: &str, roots: &[String]) -> bool {
    let Some(normalized) = normalize_relative(path) else {
        return false;
    };
    roots.iter().any(|root| {
        let Some(root) = normalize_relative(root) else {
            return false;
        };
        // An empty normalized root (".") admits any repository-relative path.
        root.as_os_str().is_empty() || normalized.starts_with(&root)
    })
}

/// A target intersects the immutable set when either contains the other:
/// writing `config/rules.yaml` violates an immutable `config/`, and deleting
/// `config/` violates an immutable `config/rules.yaml`.
fn touches_immutable(path: &str, immutable: &[String]) -> bool {
    let Some(target) = normalize_relative(path) else {
        // Absolute and escaping paths cannot intersect the relative
        // immutable set; the path-scope rule owns their rejection.
        return false;
    };
    immutable.iter().any(|entry| {
        let Some(entry) = normalize_relative(entry) else {
            return false;
        };
        target.starts_with(&entry) || entry.starts_with(&target)
    })
}
