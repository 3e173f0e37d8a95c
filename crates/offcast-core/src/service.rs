//! Control and inspection traits implemented by the engine facade.

use crate::model::DownloadRequest;
use async_trait::async_trait;
use offcast_events::TaskSnapshot;

/// Lifecycle control surface for download tasks.
#[async_trait]
pub trait DownloadControl: Send + Sync {
    /// Admit a new task. Re-adding a known id is a no-op.
    async fn add(&self, request: DownloadRequest) -> anyhow::Result<()>;

    /// Raise the global pause flag; running fetches are cancelled.
    async fn pause_all(&self) -> anyhow::Result<()>;

    /// Clear the global pause flag and re-queue eligible stopped tasks.
    async fn resume_all(&self) -> anyhow::Result<()>;

    /// Stop one task with a caller-defined non-zero reason tag.
    async fn stop(&self, id: &str, reason: u32) -> anyhow::Result<()>;

    /// Clear one task's stop reason and re-queue it when runnable.
    async fn resume(&self, id: &str) -> anyhow::Result<()>;

    /// Remove a task and its stored bytes. Completes in two phases; the task
    /// reports a removing state until cleanup finishes.
    async fn remove(&self, id: &str) -> anyhow::Result<()>;

    /// Flip the environmental gate (connectivity, policy) that all tasks
    /// share. While unmet, nothing downloads.
    async fn set_requirements_met(&self, met: bool) -> anyhow::Result<()>;
}

/// Read-only inspection surface for download tasks.
#[async_trait]
pub trait DownloadInspector: Send + Sync {
    /// Snapshots of every known task.
    async fn list(&self) -> anyhow::Result<Vec<TaskSnapshot>>;

    /// Snapshot of one task, `None` when absent.
    async fn get(&self, id: &str) -> anyhow::Result<Option<TaskSnapshot>>;
}
