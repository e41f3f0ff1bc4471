//! Test-only helpers: task fixtures, scripted ports, and a git repo with a bare remote.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::{Notify, watch};

use crate::core::types::{ProcessOutcome, Task, TaskStatus};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::notify::NotificationSink;
use crate::io::task_store::TaskStore;
use crate::io::verifier::RemoteVerifier;
use crate::io::workspace::Workspace;

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid fixture timestamp")
}

/// Create a deterministic queued task.
pub fn task(id: &str, title: &str) -> Task {
    Task {
        id: id.to_string(),
        title: title.to_string(),
        description: None,
        notes: None,
        area: None,
        status: TaskStatus::Queued,
        commit_ref: None,
        metrics: None,
        created_at: base_time(),
        completed_at: None,
    }
}

/// Create a task with explicit status, created `secs` after the fixture epoch.
pub fn task_created_at(id: &str, status: TaskStatus, secs: i64) -> Task {
    Task {
        status,
        created_at: base_time() + chrono::Duration::seconds(secs),
        ..task(id, &format!("{id} title"))
    }
}

/// Successful agent run whose stdout is `stdout`.
pub fn stdout_outcome(stdout: &str) -> ProcessOutcome {
    ProcessOutcome {
        success: true,
        exit_code: Some(0),
        stdout: stdout.to_string(),
        ..ProcessOutcome::default()
    }
}

/// Agent run that exited with `code` and wrote `stderr`.
pub fn failed_outcome(code: i32, stderr: &str) -> ProcessOutcome {
    ProcessOutcome {
        success: false,
        exit_code: Some(code),
        stderr: stderr.to_string(),
        ..ProcessOutcome::default()
    }
}

/// Agent run killed at its deadline.
pub fn timed_out_outcome() -> ProcessOutcome {
    ProcessOutcome {
        success: false,
        exit_code: None,
        timed_out: true,
        ..ProcessOutcome::default()
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Output(ProcessOutcome),
    SpawnError(String),
    Panic(String),
    /// Wait for the gate before returning the outcome.
    Blocked(std::sync::Arc<Notify>, ProcessOutcome),
}

/// Agent that replays scripted runs in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    runs: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn exec(&self, request: &AgentRequest) -> Result<ProcessOutcome> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.runs.lock().expect("runs lock").pop_front();
        match next {
            Some(ScriptedRun::Output(outcome)) => Ok(outcome),
            Some(ScriptedRun::SpawnError(message)) => Err(anyhow!(message)),
            Some(ScriptedRun::Panic(message)) => panic!("{message}"),
            Some(ScriptedRun::Blocked(gate, outcome)) => {
                gate.notified().await;
                Ok(outcome)
            }
            None => Err(anyhow!("no scripted run left")),
        }
    }
}

/// Verifier that answers a fixed value and records each commit it was asked about.
#[derive(Debug, Default)]
pub struct RecordingVerifier {
    verified: bool,
    calls: Mutex<Vec<String>>,
}

impl RecordingVerifier {
    pub fn new(verified: bool) -> Self {
        Self {
            verified,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl RemoteVerifier for RecordingVerifier {
    async fn is_on_remote(&self, commit: &str) -> bool {
        self.calls
            .lock()
            .expect("calls lock")
            .push(commit.to_string());
        self.verified
    }
}

/// Workspace that counts preparations and optionally fails them.
#[derive(Debug, Default)]
pub struct CountingWorkspace {
    failure: Option<String>,
    calls: AtomicUsize,
}

impl CountingWorkspace {
    pub fn ready() -> Self {
        Self::default()
    }

    pub fn broken(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workspace for CountingWorkspace {
    async fn prepare(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

/// Sink that records delivered messages.
#[derive(Debug)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    fail_remaining: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail_remaining: AtomicUsize::new(0),
            gate: watch::Sender::new(true),
        }
    }
}

impl RecordingSink {
    /// Reject the first `n` deliveries.
    pub fn failing_first(n: usize) -> Self {
        let sink = Self::default();
        sink.fail_remaining.store(n, Ordering::SeqCst);
        sink
    }

    /// Hold every delivery until [`RecordingSink::release`] is called.
    pub fn blocked() -> Self {
        let sink = Self::default();
        sink.gate.send_replace(false);
        sink
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("messages lock").clone()
    }

    /// Wait until at least `count` messages arrived or `timeout` elapsed; returns what arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.messages();
            if messages.len() >= count || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, text: &str) -> Result<()> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| anyhow!("sink gate dropped"))?;
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("sink unavailable"));
        }
        self.messages
            .lock()
            .expect("messages lock")
            .push(text.to_string());
        Ok(())
    }
}

/// Poll `store` until task `id` reaches `status`.
pub async fn wait_for_status(
    store: &dyn TaskStore,
    id: &str,
    status: TaskStatus,
    timeout: Duration,
) -> Result<Task> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = store.get(id).await?;
        if task.status == status {
            return Ok(task);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "task {id} still {} after {:?}, wanted {status}",
                task.status,
                timeout
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Temporary bare remote plus a seeded clone with one commit on `main`.
pub struct TestRemote {
    temp: TempDir,
}

impl TestRemote {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let remote = Self { temp };
        let bare = remote.bare_path();
        let seed = remote.seed_path();
        std::fs::create_dir_all(&bare).context("create bare dir")?;
        std::fs::create_dir_all(&seed).context("create seed dir")?;

        git(&bare, &["init", "--bare", "--quiet"])?;
        git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"])?;

        git(&seed, &["init", "--quiet"])?;
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(&seed, &["config", "user.email", "dispatcher@example.com"])?;
        git(&seed, &["config", "user.name", "Dispatcher Test"])?;
        git(&seed, &["config", "commit.gpgsign", "false"])?;
        git(&seed, &["remote", "add", "origin", &remote.url()])?;
        remote.commit("initial commit")?;
        git(&seed, &["push", "--quiet", "-u", "origin", "main"])?;
        Ok(remote)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn bare_path(&self) -> PathBuf {
        self.temp.path().join("remote.git")
    }

    /// Checkout that pushes to the bare remote as `origin`.
    pub fn seed_path(&self) -> PathBuf {
        self.temp.path().join("seed")
    }

    pub fn url(&self) -> String {
        self.bare_path().display().to_string()
    }

    /// Commit an empty change in the seed checkout without pushing; returns its sha.
    pub fn commit(&self, message: &str) -> Result<String> {
        let seed = self.seed_path();
        git(&seed, &["commit", "--quiet", "--allow-empty", "-m", message])?;
        git(&seed, &["rev-parse", "HEAD"])
    }

    /// Commit and push to `origin/<branch>`; returns the sha.
    pub fn commit_and_push(&self, message: &str, branch: &str) -> Result<String> {
        let sha = self.commit(message)?;
        git(
            &self.seed_path(),
            &["push", "--quiet", "origin", &format!("HEAD:refs/heads/{branch}")],
        )?;
        Ok(sha)
    }

    pub fn remove_bare(&self) -> Result<()> {
        std::fs::remove_dir_all(self.bare_path()).context("remove bare remote")
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
