//! Task store port plus file-backed and in-memory implementations.
//!
//! The executor only needs three operations (fetch the oldest queued task,
//! write a status, reset stranded tasks); the CLI additionally inserts and
//! lists. Each operation is a single atomic update of one document.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::types::{NewTask, Task, TaskStatus, TaskUpdate};

/// Errors surfaced by a task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistent task storage consumed by the executor.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The queued task with the earliest creation time, if any.
    async fn fetch_oldest_queued(&self) -> StoreResult<Option<Task>>;

    /// Atomically apply a status write to one task.
    async fn set_status(&self, id: &str, update: &TaskUpdate) -> StoreResult<()>;

    /// Move every `in_progress` task back to `queued`; returns how many moved.
    async fn reset_stranded_in_progress(&self) -> StoreResult<usize>;

    async fn insert(&self, task: NewTask) -> StoreResult<Task>;

    async fn get(&self, id: &str) -> StoreResult<Task>;

    /// All tasks in creation order.
    async fn list(&self) -> StoreResult<Vec<Task>>;
}

/// Serialized store document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBook {
    pub tasks: Vec<Task>,
}

impl TaskBook {
    fn oldest_queued(&self) -> Option<&Task> {
        // `min_by_key` keeps the first of equal keys, so ties fall back to insertion order.
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Queued)
            .min_by_key(|task| task.created_at)
    }

    fn apply(&mut self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        task.status = update.status;
        if let Some(notes) = &update.notes {
            task.notes = Some(notes.clone());
        }
        if let Some(run) = &update.run {
            task.commit_ref = run.commit_ref.clone();
            task.metrics = run.metrics.clone();
        }
        task.completed_at = update.status.is_terminal().then(Utc::now);
        Ok(())
    }

    fn reset_stranded(&mut self) -> usize {
        let mut count = 0;
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Queued;
                count += 1;
            }
        }
        count
    }

    fn insert(&mut self, new: NewTask) -> Task {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            notes: new.notes,
            area: new.area,
            status: new.status.unwrap_or(TaskStatus::Queued),
            commit_ref: None,
            metrics: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.tasks.push(task.clone());
        task
    }

    fn get(&self, id: &str) -> StoreResult<Task> {
        self.tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn sorted(&self) -> Vec<Task> {
        let mut tasks = self.tasks.clone();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }
}

/// Task store backed by a JSON file (`{"tasks": [...]}`), written atomically.
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> anyhow::Result<TaskBook> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("stat {}", self.path.display()))?
        {
            return Ok(TaskBook::default());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read task store {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse task store {}", self.path.display()))
    }

    async fn save(&self, book: &TaskBook) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow!("task store path missing parent {}", self.path.display()))?;
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut buf = serde_json::to_string_pretty(book).context("serialize task store")?;
        buf.push('\n');
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, buf)
            .await
            .with_context(|| format!("write temp task store {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("replace task store {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn fetch_oldest_queued(&self) -> StoreResult<Option<Task>> {
        let _guard = self.lock.lock().await;
        let book = self.load().await?;
        Ok(book.oldest_queued().cloned())
    }

    #[instrument(skip_all, fields(task_id = id, status = %update.status))]
    async fn set_status(&self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut book = self.load().await?;
        book.apply(id, update)?;
        self.save(&book).await?;
        debug!("task status written");
        Ok(())
    }

    async fn reset_stranded_in_progress(&self) -> StoreResult<usize> {
        let _guard = self.lock.lock().await;
        let mut book = self.load().await?;
        let count = book.reset_stranded();
        if count > 0 {
            self.save(&book).await?;
        }
        Ok(count)
    }

    async fn insert(&self, task: NewTask) -> StoreResult<Task> {
        let _guard = self.lock.lock().await;
        let mut book = self.load().await?;
        let task = book.insert(task);
        self.save(&book).await?;
        Ok(task)
    }

    async fn get(&self, id: &str) -> StoreResult<Task> {
        let _guard = self.lock.lock().await;
        self.load().await?.get(id)
    }

    async fn list(&self) -> StoreResult<Vec<Task>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.sorted())
    }
}

/// In-memory task store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    book: Mutex<TaskBook>,
    fetches: AtomicUsize,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing tasks (kept in the given order).
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            book: Mutex::new(TaskBook { tasks }),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of `fetch_oldest_queued` queries served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn fetch_oldest_queued(&self) -> StoreResult<Option<Task>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.book.lock().await.oldest_queued().cloned())
    }

    async fn set_status(&self, id: &str, update: &TaskUpdate) -> StoreResult<()> {
        self.book.lock().await.apply(id, update)
    }

    async fn reset_stranded_in_progress(&self) -> StoreResult<usize> {
        Ok(self.book.lock().await.reset_stranded())
    }

    async fn insert(&self, task: NewTask) -> StoreResult<Task> {
        Ok(self.book.lock().await.insert(task))
    }

    async fn get(&self, id: &str) -> StoreResult<Task> {
        self.book.lock().await.get(id)
    }

    async fn list(&self) -> StoreResult<Vec<Task>> {
        Ok(self.book.lock().await.sorted())
    }
}
