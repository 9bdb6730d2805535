//! Error types for the scheduler crate

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A user task failed. Only the first one is surfaced through `run()`.
    #[error("task failed: {source}")]
    Task {
        #[source]
        source: anyhow::Error,
    },

    /// A user predicate (`is_task_ready` / `is_finished`) failed.
    #[error("`{query}` query failed: {source}")]
    Predicate {
        query: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration rejected at construction time
    #[error("configuration error in `{field}`: {message}")]
    Config { field: &'static str, message: String },

    /// `pause` gave up waiting for in-flight tasks to drain
    #[error("timed out after {timeout:?} waiting for tasks to drain")]
    DrainTimeout { timeout: Duration },
}

impl SchedulerError {
    pub fn task(source: anyhow::Error) -> Self {
        Self::Task { source }
    }

    pub fn predicate(query: &'static str, source: anyhow::Error) -> Self {
        Self::Predicate { query, source }
    }

    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }
}
