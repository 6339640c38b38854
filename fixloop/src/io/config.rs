//! Configuration stored under `.fixloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CAPACITY_BYTES;
use crate::core::state::DEFAULT_MAX_RETRIES;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".fixloop/config.toml";

/// Top-level configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixloopConfig {
    /// Retry budget used when a request does not supply one.
    pub max_retries_default: u32,

    /// Capacity of the shared result cache, in estimated bytes.
    pub cache_capacity_bytes: usize,

    /// How long the approval gate waits for a human decision.
    pub approval_timeout_secs: u64,

    pub inference: InferenceConfig,

    /// Execution targets keyed by target-context identifier.
    pub targets: BTreeMap<String, TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Agent command prefix; output-schema and output-path flags are appended.
    pub command: Vec<String>,

    /// Per-call wall-clock budget in seconds.
    pub timeout_secs: u64,

    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Extra attempts per call when the agent process fails or returns bad output.
    pub transport_retries: u32,

    /// Directory holding per-call prompts, schemas and outputs.
    pub work_dir: PathBuf,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            transport_retries: 1,
            work_dir: PathBuf::from(".fixloop/calls"),
        }
    }
}

/// One execution target (a "connection" in the backend pool).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    /// Command that reads one statement on stdin and prints JSON rows.
    pub command: Vec<String>,

    /// Statement that prints a description of the target (e.g. `.schema`).
    pub describe: Option<String>,

    /// Statement sent after every statement in the same session to report how
    /// many rows it changed (e.g. `SELECT changes() AS changes;`).
    pub changes: Option<String>,

    pub timeout_secs: u64,

    pub output_limit_bytes: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            describe: None,
            changes: None,
            timeout_secs: 60,
            output_limit_bytes: 10_000_000,
        }
    }
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FixloopConfig {
    fn default() -> Self {
        Self {
            max_retries_default: DEFAULT_MAX_RETRIES,
            cache_capacity_bytes: DEFAULT_CAPACITY_BYTES,
            approval_timeout_secs: 5 * 60,
            inference: InferenceConfig::default(),
            targets: BTreeMap::new(),
        }
    }
}

impl FixloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity_bytes == 0 {
            return Err(anyhow!("cache_capacity_bytes must be > 0"));
        }
        if self.approval_timeout_secs == 0 {
            return Err(anyhow!("approval_timeout_secs must be > 0"));
        }
        if self.inference.command.is_empty() || self.inference.command[0].trim().is_empty() {
            return Err(anyhow!("inference.command must be a non-empty array"));
        }
        if self.inference.timeout_secs == 0 {
            return Err(anyhow!("inference.timeout_secs must be > 0"));
        }
        if self.inference.output_limit_bytes == 0 {
            return Err(anyhow!("inference.output_limit_bytes must be > 0"));
        }
        for (name, target) in &self.targets {
            if target.command.is_empty() || target.command[0].trim().is_empty() {
                return Err(anyhow!("targets.{name}.command must be a non-empty array"));
            }
            if target.timeout_secs == 0 {
                return Err(anyhow!("targets.{name}.timeout_secs must be > 0"));
            }
            if target.output_limit_bytes == 0 {
                return Err(anyhow!("targets.{name}.output_limit_bytes must be > 0"));
            }
        }
        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FixloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<FixloopConfig> {
    if !path.exists() {
        let cfg = FixloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FixloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FixloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_target() -> TargetConfig {
        TargetConfig {
            command: vec![
                "sqlite3".to_string(),
                "-json".to_string(),
                "app.db".to_string(),
            ],
            describe: Some(".schema".to_string()),
            ..TargetConfig::default()
        }
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FixloopConfig::default());
        assert_eq!(cfg.max_retries_default, 3);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/config.toml");
        let mut cfg = FixloopConfig::default();
        cfg.targets.insert("app".to_string(), sqlite_target());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "cache_capacity_bytes = 500\n\n[targets.app]\ncommand = [\"sqlite3\", \"-json\", \"app.db\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.cache_capacity_bytes, 500);
        assert_eq!(cfg.inference, InferenceConfig::default());
        assert_eq!(cfg.targets["app"].timeout_secs, 60);
    }

    #[test]
    fn rejects_target_without_command() {
        let mut cfg = FixloopConfig::default();
        cfg.targets.insert("empty".to_string(), TargetConfig::default());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("targets.empty.command"));
    }

    #[test]
    fn rejects_zero_cache_capacity() {
        let cfg = FixloopConfig {
            cache_capacity_bytes: 0,
            ..FixloopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
