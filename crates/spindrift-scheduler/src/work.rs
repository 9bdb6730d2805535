//! The seam between the pool and whatever produces its work.

use async_trait::async_trait;

/// Work source driven by the [`crate::AutoscaledPool`].
///
/// The pool never calls `is_task_ready` or `is_finished` concurrently with
/// themselves; implementations may still be called from multiple tasks over
/// time and must be `Send + Sync`.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Perform one unit of work.
    async fn run_task(&self) -> anyhow::Result<()>;

    /// Is more work available right now?
    async fn is_task_ready(&self) -> anyhow::Result<bool>;

    /// Will no more work ever become available?
    async fn is_finished(&self) -> anyhow::Result<bool>;
}
