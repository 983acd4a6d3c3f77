//! Executor abstraction
//!
//! TigerStyle: Worker scheduling goes through one trait so tests can run
//! the same inbox code deterministically.
//!
//! Inbox workers and spawn-strategy instances are plain blocking closures.
//! `TokioExecutor` runs them on tokio's blocking pool, `InlineExecutor` on
//! the submitting thread, and `ManualExecutor` queues them until a test
//! decides to run them.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::{Error, Result};

/// A unit of work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs worker tasks
pub trait Executor: Send + Sync + fmt::Debug {
    /// Submit a task; it may run before this call returns
    fn execute(&self, task: Task);

    /// Executor name for logging
    fn name(&self) -> &'static str;
}

// =============================================================================
// TokioExecutor
// =============================================================================

/// Executor backed by tokio's blocking thread pool
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Create an executor for the given runtime handle
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create an executor for the runtime this thread belongs to
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| Error::IllegalState {
            reason: format!("no tokio runtime on this thread: {}", e),
        })?;
        Ok(Self::new(handle))
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        // Workers hold actor locks and may block on Block-policy offers,
        // so they never run on the async worker threads.
        drop(self.handle.spawn_blocking(task));
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}

// =============================================================================
// InlineExecutor
// =============================================================================

/// Executor that runs each task on the submitting thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

// =============================================================================
// ManualExecutor
// =============================================================================

/// Executor that holds tasks until `run_pending` is called
#[derive(Default)]
pub struct ManualExecutor {
    tasks: Mutex<VecDeque<Task>>,
}

impl ManualExecutor {
    /// Create an empty executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run
    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run the tasks queued right now, returning how many ran
    ///
    /// Tasks submitted while running are left for the next call.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Task> = self.tasks.lock().drain(..).collect();
        let count = batch.len();
        for task in batch {
            task();
        }
        count
    }

    /// Run tasks until none remain, bounded by `rounds_max` passes
    pub fn run_until_idle(&self, rounds_max: usize) -> usize {
        let mut total = 0;
        for _ in 0..rounds_max {
            let ran = self.run_pending();
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}
