//! Durable per-run progress snapshot under `.patchbeam/run_state.json`.
//!
//! Written after every completed depth so an interrupted run leaves an
//! inspectable record of how far the search got. Writes are atomic (temp
//! file + rename); readers never observe a torn file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::io::rollback::SnapshotId;
use crate::search::TerminalStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Deepest fully-processed depth.
    pub depth: u32,
    /// Pinned snapshots of the surviving frontier, best first.
    pub frontier: Vec<SnapshotId>,
    /// Best evaluator score observed so far.
    pub best_score: f64,
    /// Set once the run reaches a terminal status.
    pub status: Option<TerminalStatus>,
}

pub fn load_run_state(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let state: RunState =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(state))
}

pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = load_run_state(&temp.path().join("run_state.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/run_state.json");
        let state = RunState {
            depth: 2,
            frontier: Vec::new(),
            best_score: 0.5,
            status: Some(TerminalStatus::BudgetExhausted),
        };
        write_run_state(&path, &state).expect("write");
        let loaded = load_run_state(&path).expect("load").expect("present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");
        fs::write(&path, "{not json").expect("write");
        assert!(load_run_state(&path).is_err());
    }
}
