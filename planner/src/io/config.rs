//! Planner configuration stored under `.planner/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::governor::Governors;

/// Planner configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values
/// below; CLI flags override individual fields for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PlannerConfig {
    pub governors: Governors,
    pub cache: CacheConfig,
    pub build: BuildConfig,
    pub commands: CommandConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Oracle-produced specs shorter than this with no nested block are
    /// treated as leaves without another oracle call.
    pub leaf_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            leaf_threshold_bytes: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    pub parallelism: usize,
    pub add_source_headers: bool,
    pub clean: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            add_source_headers: true,
            clean: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Setup commands a leaf may run (exact, or followed by arguments).
    pub allow: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Agent CLI invoked with the prompt on stdin (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<()> {
        let g = &self.governors;
        if g.max_nodes == 0 {
            return Err(anyhow!("governors.max_nodes must be > 0"));
        }
        if g.max_parallel == 0 {
            return Err(anyhow!("governors.max_parallel must be > 0"));
        }
        if g.negotiation_rounds == 0 {
            return Err(anyhow!("governors.negotiation_rounds must be > 0"));
        }
        if self.build.parallelism == 0 {
            return Err(anyhow!("build.parallelism must be > 0"));
        }
        if self.commands.timeout_secs == 0 {
            return Err(anyhow!("commands.timeout_secs must be > 0"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 || self.commands.output_limit_bytes == 0 {
            return Err(anyhow!("output limits must be > 0"));
        }
        if self.provider.command.is_empty() || self.provider.command[0].trim().is_empty() {
            return Err(anyhow!("provider.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PlannerConfig::default()`.
pub fn load_config(path: &Path) -> Result<PlannerConfig> {
    if !path.exists() {
        let cfg = PlannerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PlannerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PlannerConfig) -> Result<()> {
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
