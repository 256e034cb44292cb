use std::{
    fmt::Display,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

pub type IdNum = u64;

/// A unique identifier for a record.
/// The type parameter T is used to check that the id is only used for the kind of record it was created for.
/// This is a compile-time check only; on the wire an id is a bare number.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T> {
    id: IdNum,
    #[serde(skip)]
    phantom: std::marker::PhantomData<T>,
}
impl<T> Id<T> {
    pub fn new(id: IdNum) -> Self {
        Id {
            id,
            phantom: std::marker::PhantomData,
        }
    }
    pub fn num(&self) -> IdNum {
        self.id
    }
}
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Id<T> {}
impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Id<T> {}
impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.id)
    }
}
impl<T> std::str::FromStr for Id<T> {
    type Err = std::num::ParseIntError;

    /// Accepts both `12` and `#12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('#').parse().map(Id::new)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType;
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetType;
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskType;

pub type ResourceId = Id<ResourceType>;
pub type ChangesetId = Id<ChangesetType>;
/// Opaque reference to a background execution of a changeset.
pub type TaskId = Id<TaskType>;

/// A monotonic id allocator. Ids start at 1; 0 is never handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ids {
    counter: IdNum,
}
impl Default for Ids {
    fn default() -> Self {
        Self::new()
    }
}
impl Ids {
    pub fn new() -> Self {
        Ids { counter: 0 }
    }
    pub fn next<T>(&mut self) -> Id<T> {
        self.counter += 1;
        Id::new(self.counter)
    }
    /// Make sure ids handed out later are greater than `seen`.
    pub fn observe<T>(&mut self, seen: Id<T>) {
        self.counter = self.counter.max(seen.num());
    }
    pub fn last(&self) -> IdNum {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        let mut ids = Ids::new();
        let id1: ResourceId = ids.next();
        let id2: ResourceId = ids.next();
        assert_ne!(id1, id2);
        assert_eq!(id1.num() + 1, id2.num());
        assert_eq!(id1.num(), 1);
    }

    #[test]
    fn test_ids_observe() {
        let mut ids = Ids::new();
        ids.observe(ChangesetId::new(41));
        let next: ChangesetId = ids.next();
        assert_eq!(next.num(), 42);
        // observing an older id does not move the counter back
        ids.observe(ChangesetId::new(3));
        assert_eq!(ids.last(), 42);
    }

    #[test]
    fn test_id_json_is_a_bare_number() {
        let id = ResourceId::new(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        let back: ResourceId = serde_json::from_str("7").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_id_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ResourceId::new(3), "three");
        let s = serde_json::to_string(&map).unwrap();
        assert_eq!(s, r#"{"3":"three"}"#);
        let back: std::collections::BTreeMap<ResourceId, String> =
            serde_json::from_str(&s).unwrap();
        assert_eq!(back.get(&ResourceId::new(3)).unwrap(), "three");
    }

    #[test]
    fn test_id_parse() {
        assert_eq!("#5".parse::<ResourceId>().unwrap(), ResourceId::new(5));
        assert_eq!("5".parse::<ResourceId>().unwrap(), ResourceId::new(5));
        assert!("five".parse::<ResourceId>().is_err());
    }
}
