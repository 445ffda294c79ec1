//! Append-only store of action outcomes, used as a ranking tie-break.
//!
//! Records land in a JSONL file, one record per line, never rewritten.
//! Recording is advisory: a failed append is logged and swallowed so
//! bookkeeping can never abort a search. Query results are priors only;
//! ranking always lets fresh evaluator evidence dominate them.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::plan::ActionKind;

/// Terminal outcome of one gated candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOutcome {
    /// Evaluator accepted the change.
    Success,
    /// Evaluator rejected the change, or it conflicted on apply.
    Failure,
    /// Gate rejected the plan; no sandbox was consumed.
    Blocked,
}

/// One appended outcome row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Context fingerprint the plan was proposed against.
    pub context: String,
    pub action_kind: ActionKind,
    pub outcome: CandidateOutcome,
    /// Evaluator score in `[0, 1]`; 0.0 for blocked candidates.
    pub score: f64,
    /// RFC 3339 UTC timestamp.
    pub recorded_at: String,
}

/// Aggregated history for one action kind within a context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prior {
    pub mean_score: f64,
    pub samples: usize,
}

/// Append-only JSONL outcome log.
pub struct OutcomeStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl OutcomeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Failures are logged, never propagated.
    pub fn record(&self, record: &OutcomeRecord) {
        if let Err(err) = self.append(record) {
            warn!(err = %err, path = %self.path.display(), "failed to record outcome");
        }
    }

    fn append(&self, record: &OutcomeRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize outcome record")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let guard = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        drop(guard);
        debug!(kind = record.action_kind.as_str(), "outcome recorded");
        Ok(())
    }

    /// Mean score per action kind for an exact context fingerprint.
    ///
    /// A missing log means no history. Malformed lines are skipped with a
    /// warning so one corrupt row never poisons the whole store.
    pub fn query_priors(&self, context: &str) -> BTreeMap<ActionKind, Prior> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                warn!(err = %err, path = %self.path.display(), "failed to read outcome log");
                return BTreeMap::new();
            }
        };

        let mut sums: BTreeMap<ActionKind, (f64, usize)> = BTreeMap::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: OutcomeRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(line = line_no + 1, err = %err, "skipping malformed outcome row");
                    continue;
                }
            };
            if record.context != context {
                continue;
            }
            let entry = sums.entry(record.action_kind).or_insert((0.0, 0));
            entry.0 += record.score;
            entry.1 += 1;
        }

        sums.into_iter()
            .map(|(kind, (sum, count))| {
                (
                    kind,
                    Prior {
                        mean_score: sum / count as f64,
                        samples: count,
                    },
                )
            })
            .collect()
    }
}

/// Current time as an RFC 3339 UTC string, the timestamp format used in
/// outcome rows.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
