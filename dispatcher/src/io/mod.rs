//! Side-effecting adapters used by the executor: processes, git, the task store, notifications.

pub mod agent;
pub mod config;
pub mod git;
pub mod notify;
pub mod process;
pub mod task_store;
pub mod verifier;
pub mod workspace;
