//! Executors for running handler bodies off the I/O tasks.
//!
//! The dispatcher hands every application handler invocation to an
//! [`Executor`] so that slow handlers never stall a channel's reader.

use std::fmt;

/// Unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// An executor refused a task (queue full, shut down)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task rejected: {reason}")]
pub struct RejectedTask {
    /// Why the task was refused
    pub reason: &'static str,
}

impl RejectedTask {
    /// Create a rejection with a static reason
    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

/// Runs submitted tasks
pub trait Executor: Send + Sync {
    /// Submit `task` for execution.
    ///
    /// # Errors
    /// Returns `RejectedTask` if the executor cannot accept more work.
    fn execute(&self, task: Task) -> Result<(), RejectedTask>;
}

/// Runs each task inline on the submitting thread.
///
/// Suitable for handlers that are cheap and never block.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        task();
        Ok(())
    }
}

/// Runs tasks on a tokio runtime's blocking pool
#[derive(Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Use the given runtime
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on, if any
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| Self { handle })
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) -> Result<(), RejectedTask> {
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}

impl fmt::Debug for TokioExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioExecutor").finish_non_exhaustive()
    }
}
