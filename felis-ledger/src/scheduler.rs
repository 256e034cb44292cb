//! The sweep that moves pending changesets into execution.
//!
//! A sweep considers pending changesets by priority, highest first, then by
//! creation order. Each one either starts, waits for an unresolved
//! dependency, is rolled back because a dependency was rolled back, or is
//! deferred because its resource is busy. Finally, changesets running for
//! longer than the staleness threshold are rolled back.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{Arc, Mutex, TryLockError},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use felis_core::{ChangesetFilter, ChangesetId, ChangesetState, ResourceId};
use tokio::time::MissedTickBehavior;

use crate::{
    dispatch::Dispatch, executor::Executor, ledger::Ledger, store::lock, task::TaskHandle,
};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub interval: Duration,
    /// Running changesets older than this are rolled back.
    pub stale_after: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub started: Vec<ChangesetId>,
    pub waiting: Vec<ChangesetId>,
    pub cascaded: Vec<ChangesetId>,
    pub deferred: Vec<ChangesetId>,
    pub reaped: Vec<ChangesetId>,
    /// Another sweep was in progress; this one did nothing.
    pub superseded: bool,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        self.started.is_empty()
            && self.waiting.is_empty()
            && self.cascaded.is_empty()
            && self.deferred.is_empty()
            && self.reaped.is_empty()
    }
}

pub struct Scheduler {
    ledger: Arc<Ledger>,
    executor: Arc<Executor>,
    dispatch: Arc<dyn Dispatch>,
    options: SchedulerOptions,
    sweeping: Mutex<()>,
    handles: Mutex<BTreeMap<ChangesetId, TaskHandle>>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<Executor>,
        dispatch: Arc<dyn Dispatch>,
        options: SchedulerOptions,
    ) -> Self {
        Scheduler {
            ledger: executor.ledger().clone(),
            executor,
            dispatch,
            options,
            sweeping: Mutex::new(()),
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Executions started by this scheduler that have not finished yet.
    pub fn in_flight(&self) -> Vec<TaskHandle> {
        let mut handles = lock(&self.handles);
        handles.retain(|_, h| !h.is_finished());
        handles.values().cloned().collect()
    }

    /// Run one sweep. Errors are logged, not returned.
    pub fn sweep(&self) -> SweepReport {
        let _sweeping = match self.sweeping.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("a sweep is already in progress");
                return SweepReport {
                    superseded: true,
                    ..Default::default()
                };
            }
        };
        let span = tracing::info_span!("sweep");
        let _enter = span.enter();

        let mut report = SweepReport::default();
        if let Err(e) = self.start_pending(&mut report) {
            tracing::error!("sweep failed: {:#}", e);
        }
        if let Err(e) = self.reap_stale(&mut report) {
            tracing::error!("reaping stale changesets failed: {:#}", e);
        }
        if !report.is_idle() {
            tracing::debug!(?report, "sweep done");
        }
        report
    }

    fn start_pending(&self, report: &mut SweepReport) -> Result<()> {
        let store = self.ledger.store();
        let mut pending: Vec<_> = store
            .changesets(&ChangesetFilter::in_state(ChangesetState::Pending))
            .into_iter()
            .filter(|cs| cs.is_pending())
            .collect();
        pending.sort_by_key(|cs| (Reverse(cs.priority), cs.id));

        let mut busy: BTreeSet<ResourceId> = store
            .changesets(&ChangesetFilter::in_state(ChangesetState::Running))
            .iter()
            .filter_map(|cs| cs.subject())
            .collect();

        for cs in pending {
            // earlier iterations may have changed it
            let Some(cs) = store.changeset(cs.id).filter(|cs| cs.is_pending()) else {
                continue;
            };
            let dependencies: Vec<_> = cs
                .dependencies
                .iter()
                .map(|dep| (*dep, store.changeset(*dep)))
                .collect();

            if let Some((dep, _)) = dependencies
                .iter()
                .find(|(_, d)| d.as_ref().is_some_and(|d| !d.is_resolved()))
            {
                tracing::debug!(changeset = %cs.id, "waiting for {}", dep);
                report.waiting.push(cs.id);
                continue;
            }
            if let Some((dep, _)) = dependencies.iter().find(|(_, d)| {
                d.as_ref()
                    .map_or(true, |d| d.state() == ChangesetState::RolledBack)
            }) {
                let reason = format!("its dependency {} was rolled back", dep);
                if self.ledger.abort(cs.id, &reason)? {
                    report.cascaded.push(cs.id);
                }
                continue;
            }
            let Some(subject) = cs.subject() else {
                self.ledger.abort(cs.id, "it has no resource")?;
                report.cascaded.push(cs.id);
                continue;
            };
            if busy.contains(&subject) {
                tracing::debug!(
                    changeset = %cs.id,
                    "deferred, another changeset of {} is running",
                    subject
                );
                report.deferred.push(cs.id);
                continue;
            }

            let task = store.next_task_id()?;
            if self.ledger.claim(cs.id, task)?.is_none() {
                continue;
            }
            busy.insert(subject);
            tracing::info!(changeset = %cs.id, %task, "starting");
            let executor = self.executor.clone();
            let id = cs.id;
            let handle = self
                .dispatch
                .run(task, id, Box::new(move || executor.execute(id)));
            lock(&self.handles).insert(id, handle);
            report.started.push(id);
        }
        Ok(())
    }

    fn reap_stale(&self, report: &mut SweepReport) -> Result<()> {
        let threshold = chrono::Duration::from_std(self.options.stale_after)?;
        let cutoff = Utc::now() - threshold;
        for cs in self
            .ledger
            .store()
            .changesets(&ChangesetFilter::in_state(ChangesetState::Running))
        {
            if cs.started.is_some_and(|started| started < cutoff)
                && self.ledger.abort(cs.id, "it has been running for too long")?
            {
                lock(&self.handles).remove(&cs.id);
                report.reaped.push(cs.id);
            }
        }
        Ok(())
    }

    /// Sweep on every tick of the interval and whenever the ledger records
    /// work, until `shutdown` completes.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let mut tick = tokio::time::interval(self.options.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = self.ledger.wake();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {}
                _ = wake.notified() => {}
            }
            let scheduler = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || scheduler.sweep()).await {
                tracing::error!("sweep task failed: {}", e);
            }
        }
        tracing::info!("scheduler stopped");
    }
}
