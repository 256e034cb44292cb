//! The authoritative record store for resources and changesets.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::{anyhow, Result};
use chrono::Utc;
use felis_core::{
    ids::Ids, Changeset, ChangesetFilter, ChangesetId, FieldMap, NewChangeset, ResourceId, TaskId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A managed resource as stored: identity, kind and fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub kind: String,
    pub fields: FieldMap,
}
impl ResourceRecord {
    /// The fields including the identity under `id`, as kept in DELETE changesets.
    pub fn snapshot(&self) -> FieldMap {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::from(self.id.num()));
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequences {
    pub resources: Ids,
    pub changesets: Ids,
    pub tasks: Ids,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    pub changesets: BTreeMap<ChangesetId, Changeset>,
    pub sequences: Sequences,
}

/// One durable change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PutResource(ResourceRecord),
    RemoveResource(ResourceId),
    PutChangeset(Changeset),
    Sequences(Sequences),
}

impl StoreState {
    pub fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutResource(record) => {
                self.resources.insert(record.id, record);
            }
            Mutation::RemoveResource(id) => {
                self.resources.remove(&id);
            }
            Mutation::PutChangeset(cs) => {
                self.changesets.insert(cs.id, cs);
            }
            Mutation::Sequences(sequences) => {
                self.sequences = sequences;
            }
        }
    }
}

/// Storage for resources and changesets.
///
/// Implementations provide a consistent read view and an atomic
/// read-modify-write step; everything else is derived from those.
pub trait Store: Send + Sync {
    fn read(&self, f: &mut dyn FnMut(&StoreState));

    /// Compute mutations from the current state and make them durable, as one step.
    /// Nothing is written when `f` fails.
    fn transact(&self, f: &mut dyn FnMut(&StoreState) -> Result<Vec<Mutation>>) -> Result<()>;

    fn resource(&self, id: ResourceId) -> Option<ResourceRecord> {
        let mut out = None;
        self.read(&mut |s| out = s.resources.get(&id).cloned());
        out
    }

    /// All resources, or those of one kind, in id order.
    fn resources(&self, kind: Option<&str>) -> Vec<ResourceRecord> {
        let mut out = Vec::new();
        self.read(&mut |s| {
            out = s
                .resources
                .values()
                .filter(|r| kind.map_or(true, |k| r.kind == k))
                .cloned()
                .collect()
        });
        out
    }

    fn changeset(&self, id: ChangesetId) -> Option<Changeset> {
        let mut out = None;
        self.read(&mut |s| out = s.changesets.get(&id).cloned());
        out
    }

    /// Matching changesets in creation order.
    fn changesets(&self, filter: &ChangesetFilter) -> Vec<Changeset> {
        let mut out = Vec::new();
        self.read(&mut |s| {
            out = s
                .changesets
                .values()
                .filter(|cs| filter.matches(cs))
                .cloned()
                .collect()
        });
        out
    }

    fn next_resource_id(&self) -> Result<ResourceId> {
        let mut id = None;
        self.transact(&mut |s| {
            let mut sequences = s.sequences.clone();
            id = Some(sequences.resources.next());
            Ok(vec![Mutation::Sequences(sequences)])
        })?;
        id.ok_or_else(|| anyhow!("no resource id was allocated"))
    }

    fn next_task_id(&self) -> Result<TaskId> {
        let mut id = None;
        self.transact(&mut |s| {
            let mut sequences = s.sequences.clone();
            id = Some(sequences.tasks.next());
            Ok(vec![Mutation::Sequences(sequences)])
        })?;
        id.ok_or_else(|| anyhow!("no task id was allocated"))
    }

    fn put_resource(&self, record: &ResourceRecord) -> Result<()> {
        self.transact(&mut |_| Ok(vec![Mutation::PutResource(record.clone())]))
    }

    fn remove_resource(&self, id: ResourceId) -> Result<()> {
        self.transact(&mut |_| Ok(vec![Mutation::RemoveResource(id)]))
    }

    /// Assign an id and creation time, and record the changeset.
    fn insert_changeset(&self, new: NewChangeset) -> Result<Changeset> {
        let mut out = None;
        self.transact(&mut |s| {
            let mut sequences = s.sequences.clone();
            let cs = new.clone().into_changeset(sequences.changesets.next(), Utc::now());
            cs.validate()?;
            out = Some(cs.clone());
            Ok(vec![Mutation::Sequences(sequences), Mutation::PutChangeset(cs)])
        })?;
        out.ok_or_else(|| anyhow!("no changeset was recorded"))
    }

    fn put_changeset(&self, cs: &Changeset) -> Result<()> {
        cs.validate()?;
        self.transact(&mut |_| Ok(vec![Mutation::PutChangeset(cs.clone())]))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // mutations are applied after they are computed, so a poisoned state is still whole
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn read(&self, f: &mut dyn FnMut(&StoreState)) {
        f(&lock(&self.state))
    }

    fn transact(&self, f: &mut dyn FnMut(&StoreState) -> Result<Vec<Mutation>>) -> Result<()> {
        let mut state = lock(&self.state);
        for mutation in f(&state)? {
            state.apply(mutation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use felis_core::{ChangeKind, ChangesetState};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn record(store: &MemoryStore, kind: &str, name: &str) -> ResourceRecord {
        let record = ResourceRecord {
            id: store.next_resource_id().unwrap(),
            kind: kind.to_string(),
            fields: [("name".to_string(), json!(name))].into_iter().collect(),
        };
        store.put_resource(&record).unwrap();
        record
    }

    fn new_changeset(entity: ResourceId, priority: u16) -> NewChangeset {
        NewChangeset {
            entity_kind: "filesystem".to_string(),
            entity_ref: Some(entity),
            change_kind: ChangeKind::Create,
            field: None,
            old_values: None,
            priority,
            dependencies: BTreeSet::new(),
            author: None,
        }
    }

    #[test]
    fn test_resources() {
        let store = MemoryStore::new();
        let a = record(&store, "filesystem", "data");
        let b = record(&store, "jail", "www");
        assert_ne!(a.id, b.id);
        assert_eq!(store.resource(a.id), Some(a.clone()));
        assert_eq!(store.resources(Some("jail")), vec![b.clone()]);
        assert_eq!(store.resources(None).len(), 2);
        store.remove_resource(a.id).unwrap();
        assert_eq!(store.resource(a.id), None);
        // ids are never reused
        let c = record(&store, "filesystem", "data");
        assert!(c.id > b.id);
    }

    #[test]
    fn test_snapshot_carries_id() {
        let store = MemoryStore::new();
        let a = record(&store, "filesystem", "data");
        assert_eq!(a.snapshot()["id"], json!(a.id.num()));
        assert_eq!(a.snapshot()["name"], json!("data"));
    }

    #[test]
    fn test_changesets_in_creation_order() {
        let store = MemoryStore::new();
        let a = record(&store, "filesystem", "data");
        let first = store.insert_changeset(new_changeset(a.id, 100)).unwrap();
        let second = store.insert_changeset(new_changeset(a.id, 0)).unwrap();
        assert!(first.id < second.id);
        assert_eq!(second.state(), ChangesetState::Committed);
        let all = store.changesets(&ChangesetFilter::for_entity(a.id));
        assert_eq!(all, vec![first.clone(), second]);
        let pending = store.changesets(&ChangesetFilter::in_state(ChangesetState::Pending));
        assert_eq!(pending, vec![first]);
    }

    #[test]
    fn test_invalid_changeset_is_not_written() {
        let store = MemoryStore::new();
        let a = record(&store, "filesystem", "data");
        let mut bad = new_changeset(a.id, 100);
        bad.old_values = Some(FieldMap::new());
        assert!(store.insert_changeset(bad).is_err());
        assert!(store.changesets(&ChangesetFilter::default()).is_empty());

        let mut cs = store.insert_changeset(new_changeset(a.id, 100)).unwrap();
        cs.committed = Some(Utc::now());
        cs.rolledback = Some(Utc::now());
        assert!(store.put_changeset(&cs).is_err());
        assert_eq!(store.changeset(cs.id).unwrap().state(), ChangesetState::Pending);
    }

    #[test]
    fn test_task_ids() {
        let store = MemoryStore::new();
        let t1 = store.next_task_id().unwrap();
        let t2 = store.next_task_id().unwrap();
        assert!(t1 < t2);
    }
}
