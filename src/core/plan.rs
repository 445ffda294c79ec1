//! Plan and action data model.
//!
//! These types are the stable contract between the proposal generator, the
//! safety gate, and the rollback layer. They are immutable once constructed
//! and must stay deterministic across runs (kind names and serialization
//! order feed outcome records and fingerprints).

use serde::{Deserialize, Serialize};

/// Kind tag for an action, used in outcome records and prior aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FileWrite,
    FileDelete,
    Command,
    DependencyChange,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::FileWrite => "file_write",
            ActionKind::FileDelete => "file_delete",
            ActionKind::Command => "command",
            ActionKind::DependencyChange => "dependency_change",
        }
    }
}

/// One atomic repository operation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Create or replace a file with the given contents.
    FileWrite { path: String, contents: String },
    /// Remove a file. Deleting a path that does not exist is an apply
    /// conflict (stale base), not a policy question.
    FileDelete { path: String },
    /// Run a command inside the sandbox. The string is split on whitespace
    /// into program and arguments; shell interpretation is never used.
    Command { command: String },
    /// Rewrite a dependency manifest.
    DependencyChange { manifest: String, contents: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::FileWrite { .. } => ActionKind::FileWrite,
            Action::FileDelete { .. } => ActionKind::FileDelete,
            Action::Command { .. } => ActionKind::Command,
            Action::DependencyChange { .. } => ActionKind::DependencyChange,
        }
    }

    /// Repository paths this action touches. Commands have no static
    /// targets; they are constrained by the allowlist instead.
    pub fn target_paths(&self) -> Vec<&str> {
        match self {
            Action::FileWrite { path, .. } | Action::FileDelete { path } => vec![path],
            Action::Command { .. } => Vec::new(),
            Action::DependencyChange { manifest, .. } => vec![manifest],
        }
    }

    /// Payload size in bytes, counted against the per-plan budget.
    pub fn payload_bytes(&self) -> usize {
        match self {
            Action::FileWrite { contents, .. } => contents.len(),
            Action::FileDelete { .. } => 0,
            Action::Command { command } => command.len(),
            Action::DependencyChange { contents, .. } => contents.len(),
        }
    }
}

/// Ordered batch of actions proposed as one unit. Accepted or rejected
/// atomically by the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn step_count(&self) -> usize {
        self.actions.len()
    }

    /// Cumulative payload size across all actions.
    pub fn payload_bytes(&self) -> usize {
        self.actions.iter().map(Action::payload_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Distinct action kinds present, in stable order.
    pub fn action_kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<ActionKind> = self.actions.iter().map(Action::kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_bytes_accumulates_across_actions() {
        let plan = Plan::new(vec![
            Action::FileWrite {
                path: "src/lib.rs".to_string(),
                contents: "abcd".to_string(),
            },
            Action::FileDelete {
                path: "old.rs".to_string(),
            },
            Action::Command {
                command: "test".to_string(),
            },
        ]);
        assert_eq!(plan.payload_bytes(), 8);
        assert_eq!(plan.step_count(), 3);
    }

    #[test]
    fn action_kinds_are_deduplicated_and_sorted() {
        let plan = Plan::new(vec![
            Action::Command {
                command: "test".to_string(),
            },
            Action::FileWrite {
                path: "a".to_string(),
                contents: String::new(),
            },
            Action::FileWrite {
                path: "b".to_string(),
                contents: String::new(),
            },
        ]);
        assert_eq!(
            plan.action_kinds(),
            vec![ActionKind::FileWrite, ActionKind::Command]
        );
    }

    #[test]
    fn action_serialization_uses_stable_kind_tags() {
        let action = Action::FileWrite {
            path: "src/main.rs".to_string(),
            contents: "fn main() {}".to_string(),
        };
        let json = serde_json::to_string(&action).expect("serialize");
        assert!(json.contains("\"kind\":\"file_write\""));
    }
}
