//! Task executor: a single-worker state machine over the task store.
//!
//! States are `Stopped`, `Idle` (running, no current task) and `Busy`
//! (running, current task set). A poll loop checks the store on a fixed
//! interval; when idle it checks out the oldest queued task and spawns the
//! pipeline for it. `stop` only cancels future polls, an in-flight task is
//! always allowed to finish.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::core::directive::PushTarget;
use crate::core::redact::Redactor;
use crate::core::types::TaskRef;
use crate::idle::IdleWaiters;
use crate::io::agent::Agent;
use crate::io::config::DispatcherConfig;
use crate::io::notify::{NotificationSink, Notifier};
use crate::io::task_store::TaskStore;
use crate::io::verifier::RemoteVerifier;
use crate::io::workspace::Workspace;
use crate::pipeline::Pipeline;

/// Usage and environment errors returned by the lifecycle controls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor is already running")]
    AlreadyRunning,
    #[error("executor is not running")]
    NotRunning,
    #[error("environment setup failed: {0}")]
    Environment(String),
}

/// Snapshot returned by [`TaskExecutor::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorStatus {
    pub running: bool,
    pub current_task: Option<TaskRef>,
}

/// Timing and destination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    pub agent_timeout: Duration,
    pub notify_buffer: usize,
    pub target: PushTarget,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &DispatcherConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            agent_timeout: cfg.agent_timeout(),
            notify_buffer: cfg.notify_buffer,
            target: PushTarget {
                remote: cfg.repo.remote.clone(),
                branch: cfg.repo.branch.clone(),
            },
        }
    }
}

/// The executor's collaborators.
pub struct ExecutorParts {
    pub store: Arc<dyn TaskStore>,
    pub agent: Arc<dyn Agent>,
    pub verifier: Arc<dyn RemoteVerifier>,
    pub workspace: Arc<dyn Workspace>,
    pub redactor: Arc<Redactor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    /// `start` is preparing the environment.
    Starting,
    Running,
}

struct ExecutorState {
    lifecycle: Lifecycle,
    current_task: Option<TaskRef>,
    poller: Option<JoinHandle<()>>,
    notifier: Option<Notifier>,
    waiters: IdleWaiters,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    workspace: Arc<dyn Workspace>,
    redactor: Arc<Redactor>,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    notify_buffer: usize,
    state: Mutex<ExecutorState>,
    /// Held for the duration of one poll so concurrent polls cannot dequeue twice.
    poll_gate: tokio::sync::Mutex<()>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the executor. Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

impl TaskExecutor {
    pub fn new(parts: ExecutorParts, settings: ExecutorSettings) -> Self {
        let pipeline = Pipeline {
            store: Arc::clone(&parts.store),
            agent: parts.agent,
            verifier: parts.verifier,
            redactor: Arc::clone(&parts.redactor),
            agent_timeout: settings.agent_timeout,
            target: settings.target,
        };
        Self {
            inner: Arc::new(Inner {
                store: parts.store,
                workspace: parts.workspace,
                redactor: parts.redactor,
                pipeline: Arc::new(pipeline),
                poll_interval: settings.poll_interval,
                notify_buffer: settings.notify_buffer,
                state: Mutex::new(ExecutorState {
                    lifecycle: Lifecycle::Stopped,
                    current_task: None,
                    poller: None,
                    notifier: None,
                    waiters: IdleWaiters::default(),
                }),
                poll_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Prepare the environment, requeue stranded tasks, and begin polling.
    ///
    /// Fails with [`ExecutorError::AlreadyRunning`] unless stopped; an
    /// environment failure leaves the executor stopped.
    #[instrument(skip_all)]
    pub async fn start(&self, sink: Arc<dyn NotificationSink>) -> Result<String, ExecutorError> {
        {
            let mut state = self.inner.lock();
            if state.lifecycle != Lifecycle::Stopped {
                return Err(ExecutorError::AlreadyRunning);
            }
            state.lifecycle = Lifecycle::Starting;
        }
        let mut starting = StartingGuard {
            inner: &self.inner,
            armed: true,
        };

        if let Err(e) = self.inner.workspace.prepare().await {
            let message = self.inner.redactor.redact(&format!("{e:#}"));
            error!(err = %message, "environment preparation failed");
            return Err(ExecutorError::Environment(message));
        }

        let in_flight = self.inner.lock().current_task.is_some();
        if in_flight {
            debug!("task from a previous run still in flight, skipping stranded reset");
        } else {
            match self.inner.store.reset_stranded_in_progress().await {
                Ok(0) => {}
                Ok(count) => info!(count, "requeued stranded in_progress tasks"),
                Err(e) => warn!(
                    err = %self.inner.redactor.redact(&e.to_string()),
                    "failed to reset stranded tasks"
                ),
            }
        }

        let notifier = Notifier::spawn(
            sink,
            Arc::clone(&self.inner.redactor),
            self.inner.notify_buffer,
        );
        let every = self.inner.poll_interval;
        let mut state = self.inner.lock();
        starting.armed = false;
        state.lifecycle = Lifecycle::Running;
        state.notifier = Some(notifier);
        // The interval's first tick completes immediately, giving the initial poll.
        state.poller = Some(tokio::spawn(poll_loop(Arc::downgrade(&self.inner), every)));
        info!(poll_interval_secs = every.as_secs_f64(), "executor started");
        Ok(format!(
            "Executor started. Polling for tasks every {}s.",
            every.as_secs()
        ))
    }

    /// Cancel future polls. An in-flight task keeps running to completion.
    pub fn stop(&self) -> Result<String, ExecutorError> {
        let mut state = self.inner.lock();
        if state.lifecycle != Lifecycle::Running {
            return Err(ExecutorError::NotRunning);
        }
        state.lifecycle = Lifecycle::Stopped;
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        state.notifier = None;
        info!(busy = state.current_task.is_some(), "executor stopped");
        Ok(match &state.current_task {
            Some(task) => format!(
                "Executor stopped. Task \"{}\" is still running and will finish.",
                task.title
            ),
            None => "Executor stopped.".to_string(),
        })
    }

    pub fn status(&self) -> ExecutorStatus {
        let state = self.inner.lock();
        ExecutorStatus {
            running: state.lifecycle == Lifecycle::Running,
            current_task: state.current_task.clone(),
        }
    }

    /// Wait until no task is in flight or `timeout` elapses.
    ///
    /// Returns true if the executor was idle when this returned.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let (id, rx) = {
            let mut state = self.inner.lock();
            if state.current_task.is_none() {
                return true;
            }
            state.waiters.register()
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => true,
            Err(_) => {
                let mut state = self.inner.lock();
                state.waiters.cancel(id);
                debug!(timeout_secs = timeout.as_secs_f64(), "wait for idle timed out");
                state.current_task.is_none()
            }
        }
    }

    /// Check out the oldest queued task and start its pipeline.
    ///
    /// No-op while stopped, busy, or while another poll is in progress.
    /// Store errors are logged and swallowed.
    pub async fn poll_for_tasks(&self) {
        let Ok(_gate) = self.inner.poll_gate.try_lock() else {
            debug!("poll already in progress");
            return;
        };
        if !self.is_idle() {
            return;
        }

        let task = match self.inner.store.fetch_oldest_queued().await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    err = %self.inner.redactor.redact(&e.to_string()),
                    "task poll failed"
                );
                return;
            }
        };

        let mut state = self.inner.lock();
        if state.lifecycle != Lifecycle::Running || state.current_task.is_some() {
            debug!(task_id = %task.id, "executor changed state during poll, leaving task queued");
            return;
        }
        let Some(notifier) = state.notifier.clone() else {
            return;
        };
        state.current_task = Some(task.task_ref());
        info!(task_id = %task.id, title = %task.title, "dispatching task");

        let busy = BusyGuard {
            inner: Arc::clone(&self.inner),
        };
        let pipeline = Arc::clone(&self.inner.pipeline);
        tokio::spawn(async move {
            let _busy = busy;
            let outcome = pipeline.run(&task, &notifier).await;
            info!(
                task_id = %task.id,
                status = %outcome.final_status(),
                "task pipeline finished"
            );
        });
    }

    fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        state.lifecycle == Lifecycle::Running && state.current_task.is_none()
    }
}

async fn poll_loop(inner: Weak<Inner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let executor = TaskExecutor { inner };
        if AssertUnwindSafe(executor.poll_for_tasks())
            .catch_unwind()
            .await
            .is_err()
        {
            error!("task poll panicked");
        }
    }
}

/// Returns the executor to `Stopped` if `start` fails or is cancelled.
struct StartingGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().lifecycle = Lifecycle::Stopped;
        }
    }
}

/// Clears the current task and wakes idle waiters when the pipeline ends, on every path.
struct BusyGuard {
    inner: Arc<Inner>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let finished = state.current_task.take();
        let woken = state.waiters.resolve_all();
        debug!(task_id = ?finished.map(|task| task.id), woken, "executor idle");
    }
}
