//! The only write path for managed resources. Every create, update and delete
//! is recorded as one or more changesets.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use chrono::Utc;
use felis_core::{
    changeset::NO_SIDE_EFFECT,
    error::ValidationError,
    fields::{changed_fields, merged, subset},
    ChangeKind, Changeset, ChangesetFilter, ChangesetId, ChangesetState, FieldMap, NewChangeset,
    Outcome, ResourceId, TaskId,
};
use tokio::sync::Notify;

use crate::{
    cache::{Snapshot, SnapshotCache},
    registry::{Registry, Resolver},
    store::{lock, Mutation, ResourceRecord, Store},
};

pub struct Ledger {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    cache: SnapshotCache,
    /// Serializes read-diff-write sequences.
    write: Mutex<()>,
    wake: Arc<Notify>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>) -> Self {
        Ledger {
            store,
            registry,
            cache: SnapshotCache::default(),
            write: Mutex::new(()),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolver(&self) -> Resolver<'_> {
        self.registry.resolver(self.store.as_ref())
    }

    /// Notified whenever a changeset is recorded that the scheduler has to run.
    pub fn wake(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn resource(&self, id: ResourceId) -> Result<ResourceRecord> {
        self.resolver().record(id)
    }

    /// Changesets matching `filter`, in creation order.
    pub fn feed(&self, filter: &ChangesetFilter) -> Vec<Changeset> {
        self.store.changesets(filter)
    }

    pub fn snapshot(&self, cs: &Changeset) -> Snapshot {
        self.cache.snapshot(self.store.as_ref(), cs)
    }

    /// The fields of `cs`'s resource as carried out so far: the stored record
    /// with every newer changeset that has not run yet undone. Changes that
    /// ran before `cs` are included, whenever they were recorded.
    pub fn acting_fields(&self, cs: &Changeset) -> Option<FieldMap> {
        let subject = cs.subject()?;
        let live = self.store.resource(subject).map(|r| r.fields);
        let unexecuted: Vec<Changeset> = self
            .store
            .changesets(&ChangesetFilter::for_entity(subject))
            .into_iter()
            .filter(|later| later.id > cs.id && later.state() == ChangesetState::Pending)
            .collect();
        if live.is_none() && unexecuted.is_empty() {
            return None;
        }
        let mut fields = live.unwrap_or_default();
        for undo in unexecuted.iter().rev() {
            if let Some(old_values) = &undo.old_values {
                fields = merged(&fields, old_values);
            }
        }
        if fields.is_empty() {
            return None;
        }
        fields.insert("id".to_string(), subject.num().into());
        Some(fields)
    }

    fn record_changeset(&self, new: NewChangeset, snapshot: Snapshot) -> Result<Changeset> {
        let cs = self.store.insert_changeset(new)?;
        self.cache.record(cs.id, snapshot);
        tracing::debug!(
            changeset = %cs.id,
            kind = %cs.change_kind,
            entity = %cs.entity_kind,
            field = cs.field.as_deref().unwrap_or(""),
            priority = cs.priority,
            "recorded changeset"
        );
        if cs.is_pending() {
            self.wake.notify_one();
        }
        Ok(cs)
    }

    /// Unresolved changesets of `entity` with a priority above `priority`.
    fn blocking(&self, entity: ResourceId, priority: u16) -> BTreeSet<ChangesetId> {
        self.store
            .changesets(&ChangesetFilter::for_entity(entity))
            .into_iter()
            .filter(|cs| !cs.is_resolved() && cs.priority > priority)
            .map(|cs| cs.id)
            .collect()
    }

    pub fn create(
        &self,
        kind: &str,
        mut fields: FieldMap,
        author: Option<&str>,
    ) -> Result<(ResourceId, Changeset)> {
        let _write = lock(&self.write);
        let resolver = self.resolver();
        let resource_kind = self.registry.kind(kind)?;
        fields.remove("id");
        resource_kind.validate(&mut fields, &resolver)?;
        resolver.check_relations(kind, &fields)?;

        let record = ResourceRecord {
            id: self.store.next_resource_id()?,
            kind: resource_kind.name().to_string(),
            fields,
        };
        self.store.put_resource(&record)?;
        tracing::info!(resource = %record.id, kind, "created resource");

        let cs = self.record_changeset(
            NewChangeset {
                entity_kind: record.kind.clone(),
                entity_ref: Some(record.id),
                change_kind: ChangeKind::Create,
                field: None,
                old_values: None,
                priority: self.registry.priority(kind, ChangeKind::Create, None),
                dependencies: BTreeSet::new(),
                author: author.map(str::to_string),
            },
            Snapshot {
                old: None,
                new: Some(record.snapshot()),
            },
        )?;
        Ok((record.id, cs))
    }

    /// Apply `changes` on top of the resource's fields. Returns the changesets
    /// recorded, none when nothing changed.
    pub fn update(
        &self,
        id: ResourceId,
        mut changes: FieldMap,
        author: Option<&str>,
    ) -> Result<Vec<Changeset>> {
        let _write = lock(&self.write);
        let resolver = self.resolver();
        let before = resolver.record(id)?;
        let resource_kind = self.registry.kind(&before.kind)?;
        if let Some(new_id) = changes.remove("id") {
            if new_id != serde_json::Value::from(id.num()) {
                bail!(ValidationError::new(format!(
                    "the id of resource {} cannot change",
                    id
                )));
            }
        }
        let mut fields = merged(&before.fields, &changes);
        resource_kind.validate(&mut fields, &resolver)?;
        resolver.check_relations(&before.kind, &fields)?;

        let changed = changed_fields(&before.fields, &fields);
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        let after = ResourceRecord {
            fields,
            ..before.clone()
        };
        self.store.put_resource(&after)?;
        tracing::info!(
            resource = %id,
            kind = %before.kind,
            fields = ?changed,
            "updated resource"
        );

        let snapshot = Snapshot {
            old: Some(before.snapshot()),
            new: Some(after.snapshot()),
        };
        let (plain, mut hooked): (Vec<_>, Vec<_>) = changed
            .into_iter()
            .map(|field| {
                let priority = self
                    .registry
                    .priority(&before.kind, ChangeKind::Update, Some(&field));
                (priority, field)
            })
            .partition(|(priority, _)| *priority == NO_SIDE_EFFECT);
        hooked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut recorded = Vec::new();
        if !plain.is_empty() {
            let names: Vec<String> = plain.into_iter().map(|(_, f)| f).collect();
            recorded.push(self.record_changeset(
                NewChangeset {
                    entity_kind: before.kind.clone(),
                    entity_ref: Some(id),
                    change_kind: ChangeKind::Update,
                    field: None,
                    old_values: Some(subset(&before.fields, &names)),
                    priority: NO_SIDE_EFFECT,
                    dependencies: BTreeSet::new(),
                    author: author.map(str::to_string),
                },
                snapshot.clone(),
            )?);
        }
        for (priority, field) in hooked {
            let dependencies = self.blocking(id, priority);
            recorded.push(self.record_changeset(
                NewChangeset {
                    entity_kind: before.kind.clone(),
                    entity_ref: Some(id),
                    change_kind: ChangeKind::Update,
                    old_values: Some(subset(&before.fields, [&field])),
                    field: Some(field),
                    priority,
                    dependencies,
                    author: author.map(str::to_string),
                },
                snapshot.clone(),
            )?);
        }
        Ok(recorded)
    }

    pub fn delete(&self, id: ResourceId, author: Option<&str>) -> Result<Changeset> {
        let _write = lock(&self.write);
        let resolver = self.resolver();
        let record = resolver.record(id)?;
        let dependents = resolver.dependents(id);
        if !dependents.is_empty() {
            bail!(ValidationError::new(format!(
                "{} {} is still used by {}",
                record.kind,
                id,
                dependents
                    .iter()
                    .map(|r| format!("{} {}", r.kind, r.id))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let priority = self.registry.priority(&record.kind, ChangeKind::Delete, None);
        let dependencies = self.blocking(id, priority);
        self.store.remove_resource(id)?;
        tracing::info!(resource = %id, kind = %record.kind, "deleted resource");
        self.record_changeset(
            NewChangeset {
                entity_kind: record.kind.clone(),
                entity_ref: None,
                change_kind: ChangeKind::Delete,
                field: None,
                old_values: Some(record.snapshot()),
                priority,
                dependencies,
                author: author.map(str::to_string),
            },
            Snapshot {
                old: Some(record.snapshot()),
                new: None,
            },
        )
    }

    /// Undo the effect of `cs` on the records, without recording changesets or
    /// running hooks, and mark it rolled back. The caller persists `cs`.
    fn revert(&self, cs: &mut Changeset) -> Result<()> {
        match cs.change_kind {
            ChangeKind::Create => {
                if let Some(id) = cs.entity_ref.take() {
                    if self.store.resource(id).is_some() {
                        self.store.remove_resource(id)?;
                    }
                }
            }
            ChangeKind::Update => {
                let (Some(id), Some(old_values)) = (cs.entity_ref, cs.old_values.as_ref()) else {
                    bail!(ValidationError::new(format!(
                        "changeset {} cannot be reverted",
                        cs.id
                    )));
                };
                match self.store.resource(id) {
                    Some(mut record) => {
                        for (field, value) in old_values {
                            record.fields.insert(field.clone(), value.clone());
                        }
                        self.store.put_resource(&record)?;
                    }
                    None => tracing::warn!(
                        changeset = %cs.id,
                        "resource {} is gone, nothing to revert",
                        id
                    ),
                }
            }
            ChangeKind::Delete => {
                tracing::warn!(
                    changeset = %cs.id,
                    "a deletion cannot be rolled back; the record stays deleted"
                );
            }
        }
        cs.rolledback = Some(Utc::now());
        self.cache.forget(cs.id);
        Ok(())
    }

    /// Claim a pending changeset for execution under `task`.
    /// Returns `None` when it is no longer pending.
    pub fn claim(&self, id: ChangesetId, task: TaskId) -> Result<Option<Changeset>> {
        let _write = lock(&self.write);
        let mut claimed = None;
        self.store.transact(&mut |state| {
            let Some(cs) = state.changesets.get(&id) else {
                return Ok(Vec::new());
            };
            if !cs.is_pending() {
                return Ok(Vec::new());
            }
            let mut cs = cs.clone();
            cs.started = Some(Utc::now());
            cs.task_handle = Some(task);
            claimed = Some(cs.clone());
            Ok(vec![Mutation::PutChangeset(cs)])
        })?;
        Ok(claimed)
    }

    /// Record the outcome of a changeset run. When it failed, its effect is
    /// reverted first. A changeset that was terminated meanwhile is left as
    /// it is, and its recorded outcome is returned.
    pub fn finish(&self, id: ChangesetId, succeeded: bool) -> Result<Outcome> {
        let _write = lock(&self.write);
        let Some(mut cs) = self.store.changeset(id) else {
            bail!("changeset {} does not exist", id);
        };
        match cs.state() {
            ChangesetState::Committed => {
                tracing::warn!(changeset = %id, "already committed, leaving it");
                return Ok(Outcome::Committed);
            }
            ChangesetState::RolledBack => {
                tracing::warn!(changeset = %id, "already rolled back, leaving it");
                return Ok(Outcome::RolledBack);
            }
            ChangesetState::Pending | ChangesetState::Running => {}
        }
        let outcome = if succeeded {
            cs.committed = Some(Utc::now());
            Outcome::Committed
        } else {
            self.revert(&mut cs)?;
            Outcome::RolledBack
        };
        self.store.put_changeset(&cs)?;
        Ok(outcome)
    }

    /// Roll back an unresolved changeset without running its hook.
    /// Returns false when it was already terminated.
    pub fn abort(&self, id: ChangesetId, reason: &str) -> Result<bool> {
        let _write = lock(&self.write);
        let Some(mut cs) = self.store.changeset(id) else {
            bail!("changeset {} does not exist", id);
        };
        if cs.is_resolved() {
            return Ok(false);
        }
        tracing::warn!(changeset = %id, "rolling back: {}", reason);
        self.revert(&mut cs)?;
        self.store.put_changeset(&cs)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::{HookTable, Relation, ResourceKind},
        store::MemoryStore,
    };
    use serde_json::{json, Value};

    struct Dataset {
        hooks: HookTable,
    }
    impl ResourceKind for Dataset {
        fn name(&self) -> &'static str {
            "dataset"
        }
        fn hooks(&self) -> &HookTable {
            &self.hooks
        }
        fn relations(&self) -> &[Relation] {
            &[Relation {
                field: "parent",
                alias: "parent",
                protects: true,
            }]
        }
        fn validate(&self, fields: &mut FieldMap, _resolver: &Resolver<'_>) -> Result<()> {
            if !fields.get("name").is_some_and(Value::is_string) {
                bail!(ValidationError::new("name is required"));
            }
            Ok(())
        }
    }

    fn ledger() -> Ledger {
        let hooks = HookTable::new()
            .on_create(None, |_| Ok(()))
            .on_delete(None, |_| Ok(()))
            .on_update("name", Some(80), |_| Ok(()))
            .on_update("quota", Some(20), |_| Ok(()));
        Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Registry::new().register(Dataset { hooks })),
        )
    }

    fn fields(v: Value) -> FieldMap {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_create_records_one_changeset() {
        let ledger = ledger();
        let (id, cs) = ledger
            .create("dataset", fields(json!({"name": "data"})), Some("admin"))
            .unwrap();
        assert_eq!(cs.change_kind, ChangeKind::Create);
        assert_eq!(cs.entity_ref, Some(id));
        assert_eq!(cs.old_values, None);
        assert_eq!(cs.priority, 100);
        assert_eq!(cs.author.as_deref(), Some("admin"));
        assert_eq!(ledger.feed(&ChangesetFilter::default()), vec![cs]);
        assert_eq!(ledger.resource(id).unwrap().fields["name"], json!("data"));
    }

    #[test]
    fn test_create_validates() {
        let ledger = ledger();
        assert!(ledger.create("dataset", FieldMap::new(), None).is_err());
        assert!(ledger.create("pool", fields(json!({"name": "x"})), None).is_err());
        assert!(ledger
            .create("dataset", fields(json!({"name": "x", "parent": 42})), None)
            .is_err());
        assert!(ledger.feed(&ChangesetFilter::default()).is_empty());
    }

    #[test]
    fn test_update_single_hooked_field() {
        let ledger = ledger();
        let (id, _) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        let recorded = ledger
            .update(id, fields(json!({"quota": 2147483648u64})), None)
            .unwrap();
        assert_eq!(recorded.len(), 1);
        let cs = &recorded[0];
        assert_eq!(cs.field.as_deref(), Some("quota"));
        assert_eq!(cs.old_values, Some(fields(json!({"quota": null}))));
        assert_eq!(cs.priority, 20);
        // the pending CREATE outranks it
        assert_eq!(cs.dependencies.len(), 1);
    }

    #[test]
    fn test_update_plain_fields_commit_immediately() {
        let ledger = ledger();
        let (id, _) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        let recorded = ledger
            .update(id, fields(json!({"description": "scratch", "owner": "ops"})), None)
            .unwrap();
        assert_eq!(recorded.len(), 1);
        let cs = &recorded[0];
        assert_eq!(cs.field, None);
        assert_eq!(cs.priority, 0);
        assert!(cs.committed.is_some());
        assert!(cs.started.is_none());
        assert_eq!(
            cs.old_values,
            Some(fields(json!({"description": null, "owner": null})))
        );
    }

    #[test]
    fn test_update_orders_and_links_hooked_fields() {
        let ledger = ledger();
        let (id, create) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        let recorded = ledger
            .update(id, fields(json!({"quota": 1024, "name": "scratch"})), None)
            .unwrap();
        assert_eq!(recorded.len(), 2);
        let (name, quota) = (&recorded[0], &recorded[1]);
        assert_eq!(name.field.as_deref(), Some("name"));
        assert_eq!(quota.field.as_deref(), Some("quota"));
        assert_eq!(name.dependencies, [create.id].into_iter().collect());
        assert_eq!(quota.dependencies, [create.id, name.id].into_iter().collect());
    }

    #[test]
    fn test_update_without_change() {
        let ledger = ledger();
        let (id, _) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        assert!(ledger
            .update(id, fields(json!({"name": "data"})), None)
            .unwrap()
            .is_empty());
        assert!(ledger.update(id, fields(json!({"id": 77})), None).is_err());
    }

    #[test]
    fn test_delete_keeps_snapshot() {
        let ledger = ledger();
        let (id, _) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        let cs = ledger.delete(id, None).unwrap();
        assert_eq!(cs.entity_ref, None);
        assert_eq!(cs.subject(), Some(id));
        assert_eq!(cs.priority, 90);
        let old = cs.old_values.unwrap();
        assert_eq!(old["name"], json!("data"));
        assert_eq!(old["id"], json!(id.num()));
        assert!(ledger.resource(id).is_err());
    }

    #[test]
    fn test_delete_refused_while_referenced() {
        let ledger = ledger();
        let (parent, _) = ledger.create("dataset", fields(json!({"name": "tank"})), None).unwrap();
        let (child, _) = ledger
            .create("dataset", fields(json!({"name": "data", "parent": parent.num()})), None)
            .unwrap();
        let err = ledger.delete(parent, None).unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        ledger.delete(child, None).unwrap();
        ledger.delete(parent, None).unwrap();
    }

    #[test]
    fn test_rollback_create_removes_resource() {
        let ledger = ledger();
        let (id, cs) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        assert_eq!(ledger.finish(cs.id, false).unwrap(), Outcome::RolledBack);
        assert!(ledger.resource(id).is_err());
        let cs = ledger.store().changeset(cs.id).unwrap();
        assert_eq!(cs.entity_ref, None);
        assert!(cs.rolledback.is_some());
    }

    #[test]
    fn test_rollback_update_restores_field_only() {
        let ledger = ledger();
        let (id, _) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        let recorded = ledger
            .update(id, fields(json!({"name": "scratch", "quota": 5})), None)
            .unwrap();
        let quota = recorded.iter().find(|cs| cs.field.as_deref() == Some("quota")).unwrap();
        ledger.finish(quota.id, false).unwrap();
        let record = ledger.resource(id).unwrap();
        assert_eq!(record.fields["quota"], Value::Null);
        assert_eq!(record.fields["name"], json!("scratch"));
        // no changeset for the revert itself
        assert_eq!(ledger.feed(&ChangesetFilter::for_entity(id)).len(), 3);
    }

    #[test]
    fn test_acting_fields_leave_out_changes_not_run_yet() {
        let ledger = ledger();
        let (id, create) = ledger.create("dataset", fields(json!({"name": "a"})), None).unwrap();
        let to_b = ledger.update(id, fields(json!({"name": "b"})), None).unwrap().remove(0);
        let to_c = ledger.update(id, fields(json!({"name": "c"})), None).unwrap().remove(0);
        let quota = ledger.update(id, fields(json!({"quota": 5})), None).unwrap().remove(0);

        let acting = ledger.acting_fields(&create).unwrap();
        assert_eq!(acting["name"], json!("a"));
        assert_eq!(acting["quota"], Value::Null);
        assert_eq!(acting["id"], json!(id.num()));
        ledger.finish(create.id, true).unwrap();

        assert_eq!(ledger.acting_fields(&to_b).unwrap()["name"], json!("b"));
        ledger.finish(to_b.id, true).unwrap();

        // the quota change ran before the second rename
        ledger.finish(quota.id, true).unwrap();
        let acting = ledger.acting_fields(&to_c).unwrap();
        assert_eq!(acting["name"], json!("c"));
        assert_eq!(acting["quota"], json!(5));
    }

    #[test]
    fn test_finish_leaves_terminated_changesets() {
        let ledger = ledger();
        let (id, cs) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        assert!(ledger.abort(cs.id, "stale").unwrap());
        assert!(!ledger.abort(cs.id, "stale").unwrap());
        assert_eq!(ledger.finish(cs.id, true).unwrap(), Outcome::RolledBack);
        let stored = ledger.store().changeset(cs.id).unwrap();
        assert!(stored.committed.is_none());
        assert!(ledger.resource(id).is_err());
    }

    #[test]
    fn test_claim_only_pending() {
        let ledger = ledger();
        let (_, cs) = ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        let task = ledger.store().next_task_id().unwrap();
        let claimed = ledger.claim(cs.id, task).unwrap().unwrap();
        assert!(claimed.is_running());
        assert_eq!(claimed.task_handle, Some(task));
        assert!(ledger.claim(cs.id, task).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wakes_scheduler() {
        let ledger = ledger();
        let wake = ledger.wake();
        ledger.create("dataset", fields(json!({"name": "data"})), None).unwrap();
        // the permit is stored until someone waits
        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();
    }
}
