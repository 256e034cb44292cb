use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use anyhow::{bail, Result};
use felis_core::{Changeset, ChangesetId, ChangesetState, FieldMap, Outcome};

use crate::{context::HookContext, exec::CommandRunner, ledger::Ledger, registry::HookFn};

/// Carries out one changeset: finds its hook, runs it and records the outcome.
pub struct Executor {
    ledger: Arc<Ledger>,
    runner: Arc<dyn CommandRunner>,
}

impl Executor {
    pub fn new(ledger: Arc<Ledger>, runner: Arc<dyn CommandRunner>) -> Self {
        Executor { ledger, runner }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn execute(&self, id: ChangesetId) -> Result<Outcome> {
        let span = tracing::info_span!("changeset", id = %id);
        let _enter = span.enter();

        let Some(cs) = self.ledger.store().changeset(id) else {
            bail!("changeset {} does not exist", id);
        };
        match cs.state() {
            ChangesetState::Committed => return Ok(Outcome::Committed),
            ChangesetState::RolledBack => return Ok(Outcome::RolledBack),
            ChangesetState::Pending | ChangesetState::Running => {}
        }

        let hook = self
            .ledger
            .registry()
            .hook(&cs.entity_kind, cs.change_kind, cs.field.as_deref())
            .map(|h| h.handler.clone());
        let Some(handler) = hook else {
            tracing::debug!("no hook, committing");
            return self.ledger.finish(id, true);
        };

        tracing::info!(
            task = cs.task_name().unwrap_or_default(),
            entity = %cs.entity_kind,
            "running"
        );
        let writes = match catch_unwind(AssertUnwindSafe(|| self.run_hook(&cs, &handler))) {
            Ok(Ok(writes)) => Some(writes),
            Ok(Err(e)) => {
                tracing::error!("{:#}", e);
                None
            }
            Err(panic) => {
                tracing::error!("hook panicked: {}", panic_message(panic.as_ref()));
                None
            }
        };

        let outcome = self.ledger.finish(id, writes.is_some())?;
        tracing::info!(?outcome, "finished");
        if let (Outcome::Committed, Some(writes)) = (outcome, writes) {
            self.write_back(&cs, writes);
        }
        Ok(outcome)
    }

    fn run_hook(&self, cs: &Changeset, handler: &HookFn) -> Result<FieldMap> {
        let snapshot = self.ledger.snapshot(cs);
        let mut ctx = HookContext::new(&self.ledger, self.runner.as_ref(), cs, snapshot)?;
        handler(&mut ctx)?;
        Ok(ctx.into_writes())
    }

    /// Fields set by a committed hook go through the ordinary update path,
    /// which may record the next changeset.
    fn write_back(&self, cs: &Changeset, writes: FieldMap) {
        if writes.is_empty() {
            return;
        }
        let Some(subject) = cs.subject() else {
            return;
        };
        if self.ledger.store().resource(subject).is_none() {
            tracing::warn!("resource {} is gone, dropping writes {:?}", subject, writes);
            return;
        }
        if let Err(e) = self.ledger.update(subject, writes, cs.author.as_deref()) {
            tracing::error!("could not write back hook results: {:#}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
