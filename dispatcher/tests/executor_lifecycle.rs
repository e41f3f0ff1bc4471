//! End-to-end executor scenarios.
//!
//! Each test wires a `TaskExecutor` to an in-memory store, a scripted agent,
//! and recording verifier/sink, then drives it through `start`, polling, the
//! task pipeline, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatcher::core::directive::PushTarget;
use dispatcher::core::redact::Redactor;
use dispatcher::core::types::{NewTask, Task, TaskRef, TaskStatus, TaskUpdate};
use dispatcher::executor::{ExecutorError, ExecutorParts, ExecutorSettings, TaskExecutor};
use dispatcher::io::task_store::{MemoryTaskStore, StoreError, StoreResult, TaskStore};
use dispatcher::test_support::{
    CountingWorkspace, RecordingSink, RecordingVerifier, ScriptedAgent, ScriptedRun,
    failed_outcome, stdout_outcome, task, task_created_at, timed_out_outcome, wait_for_status,
};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(10);

struct Rig {
    executor: TaskExecutor,
    store: Arc<MemoryTaskStore>,
    agent: Arc<ScriptedAgent>,
    verifier: Arc<RecordingVerifier>,
    workspace: Arc<CountingWorkspace>,
    sink: Arc<RecordingSink>,
}

fn settings(poll_interval: Duration) -> ExecutorSettings {
    ExecutorSettings {
        poll_interval,
        agent_timeout: Duration::from_secs(60),
        notify_buffer: 32,
        target: PushTarget {
            remote: "origin".to_string(),
            branch: "main".to_string(),
        },
    }
}

/// Executor that polls once at start and then only hourly.
fn rig(tasks: Vec<Task>, runs: Vec<ScriptedRun>) -> Rig {
    rig_with(tasks, runs, CountingWorkspace::ready(), Duration::from_secs(3600))
}

fn rig_with(
    tasks: Vec<Task>,
    runs: Vec<ScriptedRun>,
    workspace: CountingWorkspace,
    poll_interval: Duration,
) -> Rig {
    let store = Arc::new(MemoryTaskStore::with_tasks(tasks));
    let agent = Arc::new(ScriptedAgent::new(runs));
    let verifier = Arc::new(RecordingVerifier::new(true));
    let workspace = Arc::new(workspace);
    let executor = TaskExecutor::new(
        ExecutorParts {
            store: store.clone(),
            agent: agent.clone(),
            verifier: verifier.clone(),
            workspace: workspace.clone(),
            redactor: Arc::new(Redactor::new(["sk-live-0123456789"])),
        },
        settings(poll_interval),
    );
    Rig {
        executor,
        store,
        agent,
        verifier,
        workspace,
        sink: Arc::new(RecordingSink::default()),
    }
}

impl Rig {
    async fn start(&self) {
        self.executor
            .start(self.sink.clone())
            .await
            .expect("start executor");
    }

    async fn settle(&self, id: &str, status: TaskStatus) -> Task {
        let task = wait_for_status(self.store.as_ref(), id, status, WAIT)
            .await
            .expect("task status");
        assert!(self.executor.wait_for_idle(WAIT).await, "executor idle");
        task
    }
}

#[tokio::test]
async fn verified_commit_marks_task_done() {
    let rig = rig(
        vec![task("t-1", "Fix login")],
        vec![ScriptedRun::Output(stdout_outcome(
            "working...\nCOMMIT_HASH_START\nabc1234\nCOMMIT_HASH_END\n",
        ))],
    );
    rig.start().await;

    let done = rig.settle("t-1", TaskStatus::Done).await;
    assert_eq!(done.commit_ref.as_deref(), Some("abc1234"));
    assert!(done.completed_at.is_some());
    assert_eq!(rig.verifier.calls(), vec!["abc1234"]);
    assert_eq!(rig.executor.status().current_task, None);
    assert!(rig.executor.status().running);

    let requests = rig.agent.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].directive.contains("Fix login"));
    assert!(requests[0].directive.contains("COMMIT_HASH_START"));
    assert_eq!(requests[0].timeout, Duration::from_secs(60));

    let messages = rig.sink.wait_for(2, WAIT).await;
    assert_eq!(
        messages,
        vec![
            "Started task: Fix login".to_string(),
            "Task done: Fix login\nCommit abc1234 pushed to origin/main.".to_string(),
        ]
    );
}

#[tokio::test]
async fn flagged_task_is_stuck_and_not_verified() {
    let rig = rig(
        vec![task("t-1", "Drop the users table")],
        vec![ScriptedRun::Output(stdout_outcome(
            "TASK_FLAGGED\nReason: deletes production data\nTASK_FLAGGED_END",
        ))],
    );
    rig.start().await;

    let stuck = rig.settle("t-1", TaskStatus::Stuck).await;
    assert_eq!(
        stuck.notes.as_deref(),
        Some("Flagged: deletes production data")
    );
    assert!(rig.verifier.calls().is_empty());
    let messages = rig.sink.wait_for(2, WAIT).await;
    assert_eq!(
        messages[1],
        "Task flagged: Drop the users table\nReason: deletes production data"
    );
}

#[tokio::test]
async fn timed_out_agent_marks_task_stuck() {
    let rig = rig(
        vec![task("t-1", "Refactor everything")],
        vec![ScriptedRun::Output(timed_out_outcome())],
    );
    rig.start().await;

    let stuck = rig.settle("t-1", TaskStatus::Stuck).await;
    let notes = stuck.notes.expect("error notes");
    assert!(notes.contains("timed out after 60s"), "notes: {notes}");
    assert!(rig.verifier.calls().is_empty());
}

#[tokio::test]
async fn failure_output_is_redacted_before_it_is_stored_or_sent() {
    let rig = rig(
        vec![task("t-1", "Deploy")],
        vec![ScriptedRun::Output(failed_outcome(
            2,
            "request with key sk-live-0123456789 rejected",
        ))],
    );
    rig.start().await;

    let stuck = rig.settle("t-1", TaskStatus::Stuck).await;
    let notes = stuck.notes.expect("error notes");
    assert!(notes.contains("status 2"));
    assert!(!notes.contains("sk-live-0123456789"));
    let messages = rig.sink.wait_for(2, WAIT).await;
    assert!(messages.iter().all(|m| !m.contains("sk-live-0123456789")));
}

#[tokio::test]
async fn second_start_fails_and_leaves_state_unchanged() {
    let rig = rig(Vec::new(), Vec::new());
    rig.start().await;
    let before = rig.executor.status();

    let err = rig.executor.start(rig.sink.clone()).await.unwrap_err();
    assert_eq!(err, ExecutorError::AlreadyRunning);
    assert_eq!(rig.executor.status(), before);
    assert_eq!(rig.workspace.calls(), 1);
}

#[tokio::test]
async fn stop_when_stopped_is_a_usage_error() {
    let rig = rig(Vec::new(), Vec::new());
    assert_eq!(rig.executor.stop(), Err(ExecutorError::NotRunning));

    rig.start().await;
    assert_eq!(rig.executor.stop().expect("stop"), "Executor stopped.");
    assert_eq!(rig.executor.stop(), Err(ExecutorError::NotRunning));

    // Stopped is re-enterable.
    rig.start().await;
    assert!(rig.executor.status().running);
}

#[tokio::test]
async fn environment_failure_keeps_executor_stopped() {
    let rig = rig_with(
        vec![task("t-1", "Fix login")],
        Vec::new(),
        CountingWorkspace::broken("repository not found"),
        Duration::from_secs(3600),
    );

    let err = rig.executor.start(rig.sink.clone()).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Environment(ref m) if m.contains("repository not found")));
    assert!(!rig.executor.status().running);
    assert_eq!(rig.store.fetch_count(), 0);
    assert_eq!(
        rig.store.get("t-1").await.expect("get").status,
        TaskStatus::Queued
    );
}

#[tokio::test]
async fn oldest_queued_task_runs_first() {
    let rig = rig(
        vec![
            task_created_at("newer", TaskStatus::Queued, 20),
            task_created_at("older", TaskStatus::Queued, 10),
        ],
        vec![ScriptedRun::Output(stdout_outcome("all done"))],
    );
    rig.start().await;

    rig.settle("older", TaskStatus::Done).await;
    assert_eq!(
        rig.store.get("newer").await.expect("get").status,
        TaskStatus::Queued
    );
    assert_eq!(rig.agent.requests().len(), 1);
}

#[tokio::test]
async fn poll_while_busy_does_not_query_the_store() {
    let gate = Arc::new(Notify::new());
    let rig = rig(
        vec![task("t-1", "Long task")],
        vec![ScriptedRun::Blocked(gate.clone(), stdout_outcome("done"))],
    );
    rig.start().await;
    wait_for_status(rig.store.as_ref(), "t-1", TaskStatus::InProgress, WAIT)
        .await
        .expect("in progress");

    let fetches = rig.store.fetch_count();
    let before = rig.executor.status();
    rig.executor.poll_for_tasks().await;
    assert_eq!(rig.store.fetch_count(), fetches);
    assert_eq!(rig.executor.status(), before);
    assert_eq!(
        before.current_task,
        Some(TaskRef {
            id: "t-1".to_string(),
            title: "Long task".to_string(),
        })
    );

    gate.notify_one();
    rig.settle("t-1", TaskStatus::Done).await;
}

#[tokio::test]
async fn stop_lets_in_flight_task_finish() {
    let gate = Arc::new(Notify::new());
    let rig = rig(
        vec![task("t-1", "Long task")],
        vec![ScriptedRun::Blocked(gate.clone(), stdout_outcome("done"))],
    );
    rig.start().await;
    wait_for_status(rig.store.as_ref(), "t-1", TaskStatus::InProgress, WAIT)
        .await
        .expect("in progress");

    let message = rig.executor.stop().expect("stop");
    assert!(message.contains("\"Long task\" is still running"), "{message}");
    assert!(!rig.executor.status().running);
    assert!(rig.executor.status().current_task.is_some());

    gate.notify_one();
    assert!(rig.executor.wait_for_idle(WAIT).await);
    assert_eq!(
        rig.store.get("t-1").await.expect("get").status,
        TaskStatus::Done
    );
    let messages = rig.sink.wait_for(2, WAIT).await;
    assert!(messages[1].starts_with("Task done: Long task"));
}

#[tokio::test]
async fn wait_for_idle_returns_immediately_without_a_task() {
    let rig = rig(Vec::new(), Vec::new());
    rig.start().await;
    let started = std::time::Instant::now();
    assert!(rig.executor.wait_for_idle(Duration::from_secs(3600)).await);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn wait_for_idle_gives_up_after_its_timeout() {
    let gate = Arc::new(Notify::new());
    let rig = rig(
        vec![task("t-1", "Never ends")],
        vec![ScriptedRun::Blocked(gate.clone(), stdout_outcome("done"))],
    );
    rig.start().await;
    wait_for_status(rig.store.as_ref(), "t-1", TaskStatus::InProgress, WAIT)
        .await
        .expect("in progress");

    let started = tokio::time::Instant::now();
    let idle = rig.executor.wait_for_idle(Duration::from_secs(30)).await;
    assert!(!idle);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(rig.executor.status().current_task.is_some());

    // The task still drains normally once released.
    gate.notify_one();
    assert!(rig.executor.wait_for_idle(WAIT).await);
}

#[tokio::test]
async fn concurrent_waiters_are_all_released() {
    let gate = Arc::new(Notify::new());
    let rig = rig(
        vec![task("t-1", "Long task")],
        vec![ScriptedRun::Blocked(gate.clone(), stdout_outcome("done"))],
    );
    rig.start().await;
    wait_for_status(rig.store.as_ref(), "t-1", TaskStatus::InProgress, WAIT)
        .await
        .expect("in progress");

    let (first, second) = tokio::join!(rig.executor.wait_for_idle(WAIT), async {
        let idle = rig.executor.wait_for_idle(WAIT);
        gate.notify_one();
        idle.await
    });
    assert!(first);
    assert!(second);
}

#[tokio::test]
async fn panicking_pipeline_marks_stuck_and_executor_keeps_going() {
    let rig = rig_with(
        vec![
            task_created_at("boom", TaskStatus::Queued, 1),
            task_created_at("next", TaskStatus::Queued, 2),
        ],
        vec![
            ScriptedRun::Panic("agent adapter bug".to_string()),
            ScriptedRun::Output(stdout_outcome("fine")),
        ],
        CountingWorkspace::ready(),
        Duration::from_millis(20),
    );
    rig.start().await;

    let stuck = wait_for_status(rig.store.as_ref(), "boom", TaskStatus::Stuck, WAIT)
        .await
        .expect("stuck");
    assert!(stuck.notes.expect("notes").contains("agent adapter bug"));
    rig.settle("next", TaskStatus::Done).await;
    assert!(rig.executor.status().running);
    assert_eq!(rig.executor.status().current_task, None);
}

#[tokio::test]
async fn start_requeues_stranded_tasks() {
    let rig = rig(
        vec![task_created_at("stranded", TaskStatus::InProgress, 1)],
        vec![ScriptedRun::Output(stdout_outcome("redone"))],
    );
    rig.start().await;

    rig.settle("stranded", TaskStatus::Done).await;
    assert_eq!(rig.agent.requests().len(), 1);
}

/// Store whose first `fetch_oldest_queued` calls fail.
struct FlakyStore {
    inner: MemoryTaskStore,
    failures: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn fetch_oldest_queued(&self) -> StoreResult<Option<Task>> {
        let failing = self
            .failures
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        if failing {
            return Err(StoreError::Other(anyhow::anyhow!("database unavailable")));
        }
        self.inner.fetch_oldest_queued().await
    }

    async fn set_status(&self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        self.inner.set_status(id, update).await
    }

    async fn reset_stranded_in_progress(&self) -> StoreResult<usize> {
        Err(StoreError::Other(anyhow::anyhow!("database unavailable")))
    }

    async fn insert(&self, task: NewTask) -> StoreResult<Task> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: &str) -> StoreResult<Task> {
        self.inner.get(id).await
    }

    async fn list(&self) -> StoreResult<Vec<Task>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn store_errors_during_polling_are_survived() {
    let store = Arc::new(FlakyStore {
        inner: MemoryTaskStore::with_tasks(vec![task("t-1", "Fix login")]),
        failures: std::sync::atomic::AtomicUsize::new(2),
    });
    let executor = TaskExecutor::new(
        ExecutorParts {
            store: store.clone(),
            agent: Arc::new(ScriptedAgent::new(vec![ScriptedRun::Output(
                stdout_outcome("ok"),
            )])),
            verifier: Arc::new(RecordingVerifier::new(true)),
            workspace: Arc::new(CountingWorkspace::ready()),
            redactor: Arc::new(Redactor::default()),
        },
        settings(Duration::from_millis(20)),
    );

    // Stranded reset fails too; start still succeeds.
    executor
        .start(Arc::new(RecordingSink::default()))
        .await
        .expect("start");
    wait_for_status(store.as_ref(), "t-1", TaskStatus::Done, WAIT)
        .await
        .expect("done after retries");
    assert!(executor.status().running);
}

/// Store that accepts the in-progress mark but rejects every final status write.
struct FinalWriteFailsStore {
    inner: MemoryTaskStore,
}

#[async_trait]
impl TaskStore for FinalWriteFailsStore {
    async fn fetch_oldest_queued(&self) -> StoreResult<Option<Task>> {
        self.inner.fetch_oldest_queued().await
    }

    async fn set_status(&self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        if update.status != TaskStatus::InProgress {
            return Err(StoreError::Other(anyhow::anyhow!("disk full")));
        }
        self.inner.set_status(id, update).await
    }

    async fn reset_stranded_in_progress(&self) -> StoreResult<usize> {
        self.inner.reset_stranded_in_progress().await
    }

    async fn insert(&self, task: NewTask) -> StoreResult<Task> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: &str) -> StoreResult<Task> {
        self.inner.get(id).await
    }

    async fn list(&self) -> StoreResult<Vec<Task>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn failed_final_write_still_frees_the_executor() {
    let store = Arc::new(FinalWriteFailsStore {
        inner: MemoryTaskStore::with_tasks(vec![
            task_created_at("t-1", TaskStatus::Queued, 1),
            task_created_at("t-2", TaskStatus::Queued, 2),
        ]),
    });
    let agent = Arc::new(ScriptedAgent::new(vec![
        ScriptedRun::Output(stdout_outcome("COMMIT_HASH_START none COMMIT_HASH_END")),
        ScriptedRun::Output(stdout_outcome("COMMIT_HASH_START none COMMIT_HASH_END")),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let executor = TaskExecutor::new(
        ExecutorParts {
            store: store.clone(),
            agent: agent.clone(),
            verifier: Arc::new(RecordingVerifier::new(true)),
            workspace: Arc::new(CountingWorkspace::ready()),
            redactor: Arc::new(Redactor::default()),
        },
        settings(Duration::from_millis(20)),
    );
    executor.start(sink.clone()).await.expect("start");

    let messages = sink.wait_for(4, WAIT).await;
    assert!(executor.wait_for_idle(WAIT).await, "executor idle");

    assert_eq!(messages.len(), 4, "messages: {messages:?}");
    assert!(messages[1].starts_with("Task done: "), "messages: {messages:?}");
    assert!(messages[3].starts_with("Task done: "), "messages: {messages:?}");
    assert_eq!(agent.requests().len(), 2);
    assert_eq!(executor.status().current_task, None);
    assert!(executor.status().running);
    // The final write was lost, so the task is left for the next start to requeue.
    assert_eq!(
        store.get("t-1").await.expect("get").status,
        TaskStatus::InProgress
    );
    executor.stop().expect("stop");
}
