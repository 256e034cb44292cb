//! Field values before and after a changeset.
//!
//! The ledger records what it knows when it creates a changeset. Entries lost
//! to eviction are reconstructed from later changesets of the same resource
//! and, failing that, from the live resource.

use std::{collections::BTreeMap, sync::Mutex};

use felis_core::{fields::merged, ChangeKind, Changeset, ChangesetFilter, ChangesetId, FieldMap};

use crate::store::{lock, Store};

/// How many later changesets to inspect when reconstructing `new`.
const LOOKAHEAD: usize = 3;
const DEFAULT_CAPACITY: usize = 4096;

/// Fields of a resource around one changeset. `None` means the resource did
/// not exist on that side (before a CREATE, after a DELETE).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub old: Option<FieldMap>,
    pub new: Option<FieldMap>,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    old: Option<Option<FieldMap>>,
    new: Option<Option<FieldMap>>,
}

pub struct SnapshotCache {
    entries: Mutex<BTreeMap<ChangesetId, Entry>>,
    capacity: usize,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SnapshotCache {
    pub fn with_capacity(capacity: usize) -> Self {
        SnapshotCache {
            entries: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Remember both sides of a changeset.
    pub fn record(&self, id: ChangesetId, snapshot: Snapshot) {
        self.store_entry(id, |entry| {
            entry.old = Some(snapshot.old);
            entry.new = Some(snapshot.new);
        });
    }

    /// Every insertion goes through here; evicts the oldest entries beyond capacity.
    fn store_entry(&self, id: ChangesetId, fill: impl FnOnce(&mut Entry)) {
        let mut entries = lock(&self.entries);
        fill(entries.entry(id).or_default());
        while entries.len() > self.capacity {
            entries.pop_first();
        }
    }

    pub fn forget(&self, id: ChangesetId) {
        lock(&self.entries).remove(&id);
    }

    fn cached_new(&self, id: ChangesetId) -> Option<Option<FieldMap>> {
        lock(&self.entries).get(&id).and_then(|e| e.new.clone())
    }

    fn cached_old(&self, id: ChangesetId) -> Option<Option<FieldMap>> {
        lock(&self.entries).get(&id).and_then(|e| e.old.clone())
    }

    fn remember_new(&self, id: ChangesetId, new: Option<FieldMap>) {
        self.store_entry(id, |entry| entry.new = Some(new));
    }

    fn remember_old(&self, id: ChangesetId, old: Option<FieldMap>) {
        self.store_entry(id, |entry| entry.old = Some(old));
    }

    /// Fields after `cs` was applied.
    pub fn new_values(&self, store: &dyn Store, cs: &Changeset) -> Option<FieldMap> {
        if let Some(new) = self.cached_new(cs.id) {
            return new;
        }
        if cs.change_kind == ChangeKind::Delete {
            return None;
        }
        let subject = cs.subject()?;
        let later: Vec<Changeset> = store
            .changesets(&ChangesetFilter::for_entity(subject))
            .into_iter()
            .filter(|c| c.id > cs.id)
            .take(LOOKAHEAD)
            .collect();
        for (hop, next) in later.iter().enumerate() {
            if let Some(base) = self.cached_new(next.id) {
                // undo the later changes, newest first
                let mut new = base.unwrap_or_default();
                for undo in later[..=hop].iter().rev() {
                    if let Some(old_values) = &undo.old_values {
                        new = merged(&new, old_values);
                    }
                }
                new.insert("id".to_string(), subject.num().into());
                self.remember_new(cs.id, Some(new.clone()));
                return Some(new);
            }
        }
        // too far from anything cached
        store.resource(subject).map(|r| r.snapshot())
    }

    /// Fields before `cs` was applied.
    pub fn old_values(&self, store: &dyn Store, cs: &Changeset) -> Option<FieldMap> {
        if let Some(old) = self.cached_old(cs.id) {
            return old;
        }
        match cs.change_kind {
            ChangeKind::Create => None,
            ChangeKind::Delete => cs.old_values.clone(),
            ChangeKind::Update => {
                let old_values = cs.old_values.clone().unwrap_or_default();
                let old = match self.new_values(store, cs) {
                    Some(new) => merged(&new, &old_values),
                    None => old_values,
                };
                self.remember_old(cs.id, Some(old.clone()));
                Some(old)
            }
        }
    }

    pub fn snapshot(&self, store: &dyn Store, cs: &Changeset) -> Snapshot {
        Snapshot {
            old: self.old_values(store, cs),
            new: self.new_values(store, cs),
        }
    }
}
