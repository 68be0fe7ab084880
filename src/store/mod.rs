//! Work-item store contract and backends.
//!
//! All durable state lives behind [`WorkItemStore`]. Status mutations are
//! compare-and-swap: a transition only succeeds when the current status
//! matches the expected one, so two coordinators can never both claim a task.

mod beads;
mod memory;

pub use beads::BeadsStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::close_record::CloseRecord;
use crate::error::Result;
use crate::task::{Epic, Task, TaskSpec, TaskStatus};

/// Narrow API over the external work-item service.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Loads an epic with its member IDs and acceptance criteria.
    async fn epic(&self, epic_id: &str) -> Result<Epic>;

    /// All member tasks of an epic, in any status.
    async fn tasks(&self, epic_id: &str) -> Result<Vec<Task>>;

    /// Open member tasks whose dependencies are all closed.
    async fn ready(&self, epic_id: &str) -> Result<Vec<Task>>;

    /// Open member tasks with at least one unclosed dependency.
    async fn blocked(&self, epic_id: &str) -> Result<Vec<Task>>;

    /// Loads one task.
    async fn show(&self, task_id: &str) -> Result<Task>;

    /// Moves `task_id` from `expected` to `status`.
    ///
    /// Fails with [`Error::Conflict`](crate::error::Error::Conflict) when the
    /// current status is not `expected`.
    async fn update_status(&self, task_id: &str, expected: TaskStatus, status: TaskStatus) -> Result<()>;

    /// Closes a task with its record. Closing a closed task is a conflict.
    async fn close(&self, task_id: &str, record: &CloseRecord) -> Result<()>;

    /// Creates a task and returns its ID.
    async fn create(&self, spec: &TaskSpec) -> Result<String>;

    /// Makes `task_id` depend on `blocker_id`.
    ///
    /// Fails with [`Error::DependencyCycle`](crate::error::Error::DependencyCycle)
    /// if the edge would close a cycle. An existing edge is a no-op.
    async fn add_dependency(&self, task_id: &str, blocker_id: &str) -> Result<()>;

    /// Appends one line to the task's notes.
    async fn add_note(&self, task_id: &str, note: &str) -> Result<()>;

    /// Claims an open task for execution.
    async fn claim(&self, task_id: &str) -> Result<()> {
        self.update_status(task_id, TaskStatus::Open, TaskStatus::InProgress)
            .await
    }
}
