//! Agent abstraction for task execution.
//!
//! The [`Agent`] trait decouples the task pipeline from the actual agent
//! backend (a CLI coding agent by default). Tests use scripted agents that
//! return predetermined process outcomes without spawning anything.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::core::types::ProcessOutcome;
use crate::io::config::{AgentConfig, DispatcherConfig};
use crate::io::process::run_command_with_timeout;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Directive text fed to the agent on stdin.
    pub directive: String,
    /// Maximum time to wait before the agent is killed.
    pub timeout: Duration,
}

/// Abstraction over agent execution backends.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the agent to completion (or timeout).
    ///
    /// `Err` means the agent could not be started at all.
    async fn exec(&self, request: &AgentRequest) -> Result<ProcessOutcome>;
}

/// Agent that spawns a CLI program in the workspace with a minimal environment.
#[derive(Debug, Clone)]
pub struct CliAgent {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
    output_limit_bytes: usize,
}

impl CliAgent {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        workdir: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: workdir.into(),
            env,
            output_limit_bytes,
        }
    }

    /// Build from config, resolving passthrough variables from the host environment now.
    pub fn from_config(cfg: &DispatcherConfig) -> Self {
        let env = child_env(&cfg.agent, |name| std::env::var(name).ok());
        Self::new(
            cfg.agent.program.clone(),
            cfg.agent.args.clone(),
            cfg.repo.workdir.clone(),
            env,
            cfg.output_limit_bytes,
        )
    }

    /// Names of the variables the child will see (values are never logged).
    pub fn env_names(&self) -> Vec<&str> {
        self.env.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl Agent for CliAgent {
    #[instrument(skip_all, fields(program = %self.program, timeout_secs = request.timeout.as_secs()))]
    async fn exec(&self, request: &AgentRequest) -> Result<ProcessOutcome> {
        info!(workdir = %self.workdir.display(), "starting agent");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.workdir)
            // Only what the agent needs; never the dispatcher's full environment.
            .env_clear()
            .envs(&self.env);

        let outcome = run_command_with_timeout(
            cmd,
            Some(request.directive.clone().into_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .await
        .with_context(|| format!("run agent {}", self.program))?;

        if outcome.timed_out {
            warn!(timeout = ?request.timeout, "agent timed out");
        } else if !outcome.success {
            warn!(exit_code = ?outcome.exit_code, "agent failed");
        } else {
            debug!("agent completed successfully");
        }
        Ok(outcome)
    }
}

/// Assemble the child environment: passthrough variables present on the host,
/// then explicit entries (which win).
fn child_env(
    cfg: &AgentConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for name in &cfg.env_passthrough {
        if let Some(value) = lookup(name) {
            env.insert(name.clone(), value);
        }
    }
    for (name, value) in &cfg.env {
        env.insert(name.clone(), value.clone());
    }
    env
}
