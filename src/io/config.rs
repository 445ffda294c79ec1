//! Run configuration stored under `.patchbeam/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::gate::GateConfig;

/// Top-level configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to conservative
/// values; structural problems are fatal at load so a search never starts
/// with a malformed policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub gate: GateConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximum trajectories kept active per depth.
    pub width: usize,

    /// Maximum search depth before returning the best trajectory so far.
    pub max_depth: u32,

    /// Candidate continuations requested per frontier node per depth.
    pub branch_factor: usize,

    /// Evaluator score at or above which the search terminates immediately.
    pub success_threshold: f64,

    /// Per-call timeout for the proposal generator, in seconds.
    pub generator_timeout_secs: u64,

    /// Maximum attempts per generator call (bounded retry).
    pub generator_max_attempts: u32,

    /// Base delay for generator retry backoff, in milliseconds.
    pub generator_retry_base_ms: u64,

    /// Wall-clock budget for one evaluator invocation, in seconds.
    pub evaluator_timeout_secs: u64,

    /// Command executed by the reference evaluator inside a sandbox.
    pub evaluator_command: Vec<String>,

    /// Timeout for a single in-plan command action, in seconds.
    pub command_timeout_secs: u64,

    /// Truncate captured process output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Abort the whole search when the infrastructure failure rate exceeds
    /// this fraction (snapshot/fork/merge errors, generator transport
    /// errors), rather than silently returning a degraded result.
    pub max_infra_failure_rate: f64,

    /// Language tag mixed into context fingerprints.
    pub language: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            width: 2,
            max_depth: 4,
            branch_factor: 2,
            success_threshold: 1.0,
            generator_timeout_secs: 120,
            generator_max_attempts: 3,
            generator_retry_base_ms: 250,
            evaluator_timeout_secs: 10 * 60,
            evaluator_command: vec!["just".to_string(), "ci".to_string()],
            command_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            max_infra_failure_rate: 0.5,
            language: "unknown".to_string(),
        }
    }
}

impl SearchConfig {
    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs)
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluator_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(anyhow!("search.width must be > 0"));
        }
        if self.max_depth == 0 {
            return Err(anyhow!("search.max_depth must be > 0"));
        }
        if self.branch_factor == 0 {
            return Err(anyhow!("search.branch_factor must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.success_threshold) || self.success_threshold == 0.0 {
            return Err(anyhow!("search.success_threshold must be in (0, 1]"));
        }
        if self.generator_timeout_secs == 0
            || self.evaluator_timeout_secs == 0
            || self.command_timeout_secs == 0
        {
            return Err(anyhow!("search timeouts must be > 0"));
        }
        if self.generator_max_attempts == 0 {
            return Err(anyhow!("search.generator_max_attempts must be > 0"));
        }
        if self.evaluator_command.is_empty() || self.evaluator_command[0].trim().is_empty() {
            return Err(anyhow!("search.evaluator_command must be a non-empty array"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("search.output_limit_bytes must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.max_infra_failure_rate) {
            return Err(anyhow!("search.max_infra_failure_rate must be in [0, 1]"));
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.gate
            .validate()
            .map_err(|reason| anyhow!("invalid gate config: {reason}"))?;
        self.search.validate()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.search.width = 3;
        cfg.gate.command_allowlist.insert("patch".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn malformed_search_config_is_fatal() {
        let cfg = SearchConfig {
            width: 0,
            ..SearchConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SearchConfig {
            evaluator_command: Vec::new(),
            ..SearchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_path_roots_are_fatal_at_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[gate]\npath_roots = []\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
