//! Per-task pipeline: mark in progress, run the agent, interpret its output,
//! verify the pushed commit, and record the final status.
//!
//! Every dequeued task ends `done` or `stuck`. Errors and panics raised while
//! the pipeline runs are caught here and recorded as `stuck`; clearing the
//! executor's current task is the caller's job (see `executor`).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::core::directive::{PushTarget, build_directive};
use crate::core::outcome;
use crate::core::redact::Redactor;
use crate::core::types::{RunRecord, SubprocessResult, Task, TaskStatus, TaskUpdate};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::notify::Notifier;
use crate::io::task_store::TaskStore;
use crate::io::verifier::RemoteVerifier;

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Agent succeeded; `commit` is the reported hash, `verified` whether it is on the remote.
    Done {
        commit: Option<String>,
        verified: bool,
    },
    /// Agent could not start, exited non-zero, or timed out.
    Failed { error: String },
    /// Agent refused the task as unsafe.
    Flagged { reason: String },
    /// The pipeline itself errored or panicked.
    Crashed { error: String },
}

impl TaskOutcome {
    pub fn final_status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Done { .. } => TaskStatus::Done,
            _ => TaskStatus::Stuck,
        }
    }
}

/// Collaborators and settings shared by every pipeline run.
pub struct Pipeline {
    pub store: Arc<dyn TaskStore>,
    pub agent: Arc<dyn Agent>,
    pub verifier: Arc<dyn RemoteVerifier>,
    pub redactor: Arc<Redactor>,
    pub agent_timeout: Duration,
    pub target: PushTarget,
}

impl Pipeline {
    /// Drive `task` to a final status. Never fails and never unwinds.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub async fn run(&self, task: &Task, notifier: &Notifier) -> TaskOutcome {
        let caught = AssertUnwindSafe(self.execute(task, notifier))
            .catch_unwind()
            .await;
        let error = match caught {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => self.redactor.redact(&format!("{e:#}")),
            Err(panic) => self
                .redactor
                .redact(&format!("pipeline panicked: {}", panic_message(&*panic))),
        };

        error!(error = %error, "task pipeline aborted");
        self.record(task, TaskUpdate::status(TaskStatus::Stuck).with_notes(&error))
            .await;
        notifier.notify(format!("Task failed: {}\n{error}", task.title));
        TaskOutcome::Crashed { error }
    }

    async fn execute(&self, task: &Task, notifier: &Notifier) -> Result<TaskOutcome> {
        self.store
            .set_status(&task.id, &TaskUpdate::status(TaskStatus::InProgress))
            .await
            .context("mark task in_progress")?;
        notifier.notify(format!("Started task: {}", task.title));

        let directive = build_directive(task, &self.target).context("render directive")?;
        let result = self.invoke(directive).await;

        if !result.success {
            let error = self
                .redactor
                .redact(result.error.as_deref().unwrap_or("agent failed"));
            warn!(
                is_system_error = ?result.is_system_error,
                error = %error,
                "agent run failed"
            );
            self.record(task, TaskUpdate::status(TaskStatus::Stuck).with_notes(&error))
                .await;
            notifier.notify(format!("Task failed: {}\n{error}", task.title));
            return Ok(TaskOutcome::Failed { error });
        }

        if let Some(reason) = result.flagged.as_deref() {
            let reason = self.redactor.redact(reason);
            info!(reason = %reason, "agent flagged task");
            self.record(
                task,
                TaskUpdate::status(TaskStatus::Stuck).with_notes(format!("Flagged: {reason}")),
            )
            .await;
            notifier.notify(format!("Task flagged: {}\nReason: {reason}", task.title));
            return Ok(TaskOutcome::Flagged { reason });
        }

        let target = format!("{}/{}", self.target.remote, self.target.branch);
        let (verified, summary) = match result.commit_hash.as_deref() {
            Some(hash) => {
                let verified = self.verifier.is_on_remote(hash).await;
                let summary = if verified {
                    format!("Commit {hash} pushed to {target}.")
                } else {
                    format!("Commit {hash} could not be verified on {target}.")
                };
                (verified, summary)
            }
            None => (false, "No commit was made.".to_string()),
        };

        let update = TaskUpdate {
            status: TaskStatus::Done,
            notes: result.notes.as_deref().map(|notes| self.redactor.redact(notes)),
            run: Some(RunRecord {
                commit_ref: result.commit_hash.clone(),
                metrics: result.metrics.clone(),
            }),
        };
        self.record(task, update).await;
        info!(commit = ?result.commit_hash, verified, "task done");
        notifier.notify(format!("Task done: {}\n{summary}", task.title));

        Ok(TaskOutcome::Done {
            commit: result.commit_hash,
            verified,
        })
    }

    async fn invoke(&self, directive: String) -> SubprocessResult {
        let request = AgentRequest {
            directive,
            timeout: self.agent_timeout,
        };
        match self.agent.exec(&request).await {
            Ok(process) => {
                debug!(
                    exit_code = ?process.exit_code,
                    timed_out = process.timed_out,
                    stdout_bytes = process.stdout.len(),
                    stderr_bytes = process.stderr.len(),
                    "agent finished"
                );
                outcome::from_process(&process, self.agent_timeout)
            }
            Err(e) => outcome::spawn_failure(&self.redactor.redact(&format!("{e:#}"))),
        }
    }

    /// Final status writes are best effort: a store failure is logged, not propagated.
    async fn record(&self, task: &Task, update: TaskUpdate) {
        let status = update.status;
        if let Err(e) = self.store.set_status(&task.id, &update).await {
            warn!(
                status = %status,
                err = %self.redactor.redact(&e.to_string()),
                "failed to record task status"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
