//! Handles on changeset executions running in the background, [`TaskHandle`].
use std::sync::Arc;

use anyhow::{anyhow, Result};
use felis_core::{ChangesetId, Outcome, TaskId};
use tokio::sync::watch;

type Slot = Option<Result<Outcome, Arc<anyhow::Error>>>;

/// Observes one background execution. Cloning shares the observation.
///
/// Only the scheduler holds these; the stored changeset is what other
/// processes see.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    changeset: ChangesetId,
    receiver: watch::Receiver<Slot>,
}

/// The producing side of a [`TaskHandle`]. Dropping it without completing
/// makes the task finish with an error.
pub struct TaskCompletion {
    sender: watch::Sender<Slot>,
}

impl TaskHandle {
    pub fn new(id: TaskId, changeset: ChangesetId) -> (TaskHandle, TaskCompletion) {
        let (sender, receiver) = watch::channel(None);
        (
            TaskHandle {
                id,
                changeset,
                receiver,
            },
            TaskCompletion { sender },
        )
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn changeset(&self) -> ChangesetId {
        self.changeset
    }

    pub fn is_finished(&self) -> bool {
        self.receiver.borrow().is_some() || self.receiver.has_changed().is_err()
    }

    /// The outcome, once finished.
    pub fn outcome(&self) -> Option<Result<Outcome>> {
        if let Some(result) = self.receiver.borrow().as_ref() {
            return Some(clone_result(result));
        }
        if self.receiver.has_changed().is_err() {
            return Some(Err(abandoned(self.id)));
        }
        None
    }

    /// Wait for the execution to finish.
    pub async fn wait(&self) -> Result<Outcome> {
        let mut receiver = self.receiver.clone();
        let result = match receiver.wait_for(Option::is_some).await {
            Ok(slot) => match slot.as_ref() {
                Some(result) => clone_result(result),
                None => Err(abandoned(self.id)),
            },
            Err(_) => Err(abandoned(self.id)),
        };
        result
    }
}

impl TaskCompletion {
    pub fn complete(self, result: Result<Outcome>) {
        // nobody watching is fine
        let _ = self.sender.send(Some(result.map_err(Arc::new)));
    }
}

fn clone_result(result: &Result<Outcome, Arc<anyhow::Error>>) -> Result<Outcome> {
    match result {
        Ok(outcome) => Ok(*outcome),
        Err(e) => Err(anyhow!("{:#}", e)),
    }
}

fn abandoned(id: TaskId) -> anyhow::Error {
    anyhow!("task {} ended without reporting an outcome", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (TaskHandle, TaskCompletion) {
        TaskHandle::new(TaskId::new(1), ChangesetId::new(7))
    }

    #[tokio::test]
    async fn completed() {
        let (handle, completion) = handle();
        assert!(!handle.is_finished());
        assert!(handle.outcome().is_none());
        let waiter = handle.clone();
        let waiting = tokio::spawn(async move { waiter.wait().await });
        completion.complete(Ok(Outcome::Committed));
        assert_eq!(waiting.await.unwrap().unwrap(), Outcome::Committed);
        assert!(handle.is_finished());
        assert_eq!(handle.outcome().unwrap().unwrap(), Outcome::Committed);
    }

    #[tokio::test]
    async fn failed() {
        let (handle, completion) = handle();
        completion.complete(Err(anyhow!("boom")));
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn abandoned_completion() {
        let (handle, completion) = handle();
        drop(completion);
        assert!(handle.is_finished());
        assert!(handle.wait().await.is_err());
    }
}
