//! Dispatcher configuration stored in `.dispatcher/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::redact::Redactor;

pub const DEFAULT_CONFIG_PATH: &str = ".dispatcher/config.toml";

/// Dispatcher configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for a single long-running dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between task store polls.
    pub poll_interval_secs: u64,

    /// Wall-clock budget for one agent run before it is killed.
    pub agent_timeout_secs: u64,

    /// How long shutdown waits for an in-flight task. Must exceed `agent_timeout_secs`.
    pub shutdown_timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes (per stream).
    pub output_limit_bytes: usize,

    /// Capacity of the notification channel.
    pub notify_buffer: usize,

    pub repo: RepoConfig,
    pub agent: AgentConfig,
    pub store: StoreConfig,
    pub redact: RedactConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepoConfig {
    /// Clone source. When unset, `workdir` must already be a checkout.
    pub url: Option<String>,
    /// Checkout used exclusively by the agent.
    pub workdir: PathBuf,
    pub remote: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable; the directive is written to its stdin.
    pub program: String,
    pub args: Vec<String>,
    /// Host environment variables copied into the agent's otherwise empty environment.
    pub env_passthrough: Vec<String>,
    /// Extra variables set explicitly for the agent.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RedactConfig {
    /// Host environment variables whose values are scrubbed from logs and notifications.
    pub env_vars: Vec<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            url: None,
            workdir: PathBuf::from(".dispatcher/workspace"),
            remote: "origin".to_string(),
            branch: "main".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: ["-p", "--output-format", "json", "--dangerously-skip-permissions"]
                .map(String::from)
                .to_vec(),
            env_passthrough: ["PATH", "HOME", "ANTHROPIC_API_KEY", "GH_TOKEN"]
                .map(String::from)
                .to_vec(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".dispatcher/tasks.json"),
        }
    }
}

impl Default for RedactConfig {
    fn default() -> Self {
        Self {
            env_vars: ["ANTHROPIC_API_KEY", "GH_TOKEN", "GITHUB_TOKEN"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            agent_timeout_secs: 30 * 60,
            shutdown_timeout_secs: 31 * 60,
            output_limit_bytes: 1_000_000,
            notify_buffer: 64,
            repo: RepoConfig::default(),
            agent: AgentConfig::default(),
            store: StoreConfig::default(),
            redact: RedactConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.shutdown_timeout_secs <= self.agent_timeout_secs {
            return Err(anyhow!(
                "shutdown_timeout_secs ({}) must exceed agent_timeout_secs ({})",
                self.shutdown_timeout_secs,
                self.agent_timeout_secs
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.notify_buffer == 0 {
            return Err(anyhow!("notify_buffer must be > 0"));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.repo.remote.trim().is_empty() || self.repo.branch.trim().is_empty() {
            return Err(anyhow!("repo.remote and repo.branch must be non-empty"));
        }
        if self.repo.url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return Err(anyhow!("repo.url must be non-empty when set"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Redactor seeded with the named host variables and every value set in `agent.env`.
    pub fn redactor(&self) -> Redactor {
        let host = self
            .redact
            .env_vars
            .iter()
            .filter_map(|name| std::env::var(name).ok());
        Redactor::new(host.chain(self.agent.env.values().cloned()))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DispatcherConfig::default()`.
pub fn load_config(path: &Path) -> Result<DispatcherConfig> {
    if !path.exists() {
        let cfg = DispatcherConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DispatcherConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DispatcherConfig) -> Result<()> {
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
