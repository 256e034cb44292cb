//! Where changeset executions run.

use anyhow::Result;
use felis_core::{ChangesetId, Outcome, TaskId};
use tokio::runtime::Handle;

use crate::task::TaskHandle;

pub type Job = Box<dyn FnOnce() -> Result<Outcome> + Send + 'static>;

pub trait Dispatch: Send + Sync {
    /// Start `job` and return without waiting for it.
    fn run(&self, task: TaskId, changeset: ChangesetId, job: Job) -> TaskHandle;
}

/// Runs jobs on the tokio blocking pool, since hooks wait on processes.
pub struct TokioDispatch {
    runtime: Handle,
}

impl TokioDispatch {
    pub fn new(runtime: Handle) -> Self {
        TokioDispatch { runtime }
    }

    /// Dispatch onto the runtime of the calling task.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Dispatch for TokioDispatch {
    fn run(&self, task: TaskId, changeset: ChangesetId, job: Job) -> TaskHandle {
        let (handle, completion) = TaskHandle::new(task, changeset);
        self.runtime.spawn_blocking(move || completion.complete(job()));
        handle
    }
}

/// Runs each job to completion before returning. Makes a sweep deterministic.
#[derive(Default)]
pub struct InlineDispatch;

impl Dispatch for InlineDispatch {
    fn run(&self, task: TaskId, changeset: ChangesetId, job: Job) -> TaskHandle {
        let (handle, completion) = TaskHandle::new(task, changeset);
        completion.complete(job());
        handle
    }
}
