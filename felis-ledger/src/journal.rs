//! The journal file: an append-only sequence of JSON patch events that, applied
//! in order, produce the store's state document.
//!
//! ```json
//! {"_type": "felisState", "resources": {...}, "changesets": {...}, "sequences": {...}}
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use json_patch::{jsonptr::PointerBuf, AddOperation, Patch, PatchOperation, RemoveOperation};
use serde_json::{de::IoRead, Deserializer as JsonDeserializer, StreamDeserializer};
use std::{
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use crate::{
    monitor::WaitMonitor,
    store::{lock, Mutation, Store, StoreState},
};

const STATE_TYPE: &str = "felisState";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: serde_json::Value,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// The validated first event, handed out before the rest of the stream
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let deserializer = JsonDeserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    bail!("Expected initial state event with index 0, got {}", index);
                }
                ev
            }
            Some(Err(e)) => bail!(
                "Journal invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("Journal invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<'a, R: io::Read> Iterator for StateEventStream<'a, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

pub fn apply_state_event(state: &mut serde_json::Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

/// Apply all events, checking that their indices are consecutive.
/// Returns the index the next event must carry.
pub fn apply_state_events(
    state: &mut serde_json::Value,
    events: impl Iterator<Item = Result<StateEvent>>,
) -> Result<u64> {
    let mut next_index = 0;
    for event in events {
        let event = event?;
        if event.index != next_index {
            bail!(
                "Journal invalid: expected event {}, found event {}",
                next_index,
                event.index
            );
        }
        apply_state_event(state, &event)?;
        next_index += 1;
    }
    Ok(next_index)
}

/// Turn a replayed state document into the store's state.
fn load_document(mut document: serde_json::Value) -> Result<StoreState> {
    match document
        .as_object_mut()
        .and_then(|o| o.remove("_type"))
        .as_ref()
        .and_then(serde_json::Value::as_str)
    {
        Some(STATE_TYPE) => {}
        Some(other) => bail!(
            "unexpected _type in felis journal: expected '{}', got '{}'",
            STATE_TYPE,
            other
        ),
        None => bail!("felis journal has no _type"),
    }
    Ok(serde_json::from_value(document)?)
}

/// Write access to a journal file.
pub struct StateHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
}
impl StateHandle {
    pub fn open<P: AsRef<Path>>(name: P, create_new: bool) -> Result<StateHandle> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(name)?;
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        let mut handle = StateHandle {
            file,
            locking,
            expected_size: None,
        };
        if create_new {
            handle.append(&[&Self::init_event()?])?;
        }
        Ok(handle)
    }
    fn init_event() -> Result<StateEvent> {
        let mut value = serde_json::to_value(StoreState::default())?;
        if let Some(o) = value.as_object_mut() {
            o.insert("_type".to_string(), STATE_TYPE.into());
        }
        Ok(StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: serde_json::json!({}),
            },
            patch: Patch(vec![PatchOperation::Add(AddOperation {
                path: PointerBuf::root(),
                value,
            })]),
        })
    }
    fn lock_write(
        locking: &mut fd_lock::RwLock<Arc<File>>,
    ) -> Result<fd_lock::RwLockWriteGuard<'_, Arc<File>>> {
        let lock_wait_mon = WaitMonitor::new("Waiting for journal write lock".to_owned());
        let lock = locking.write()?;
        lock_wait_mon.done();
        Ok(lock)
    }
    pub fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        let lock_guard = Self::lock_write(&mut self.locking)?;
        let pos = self.file.seek(io::SeekFrom::End(0))?;
        match self.expected_size {
            None => self.expected_size = Some(pos),
            Some(expected_size) => {
                if pos != expected_size {
                    tracing::error!(
                        "Detected concurrent writing. Foreign bytes: [{}..{})",
                        expected_size,
                        pos
                    );
                    tracing::error!("CRITICAL: another process is writing this journal; its changes and ours may interleave and require manual repair");
                }
            }
        }
        let mut writer = io::BufWriter::new(self.file.clone());

        for event in events {
            // pretty, so that the journal stays readable for operators
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        self.expected_size = Some(self.file.stream_position()?);

        drop(lock_guard);
        Ok(())
    }
}

fn pointer(collection: &str, key: impl ToString) -> PointerBuf {
    let key = key.to_string();
    PointerBuf::from_tokens([collection, key.as_str()])
}

fn patch_operation(mutation: &Mutation) -> Result<PatchOperation> {
    Ok(match mutation {
        Mutation::PutResource(record) => PatchOperation::Add(AddOperation {
            path: pointer("resources", record.id.num()),
            value: serde_json::to_value(record)?,
        }),
        Mutation::RemoveResource(id) => PatchOperation::Remove(RemoveOperation {
            path: pointer("resources", id.num()),
        }),
        Mutation::PutChangeset(cs) => PatchOperation::Add(AddOperation {
            path: pointer("changesets", cs.id.num()),
            value: serde_json::to_value(cs)?,
        }),
        Mutation::Sequences(sequences) => PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["sequences"]),
            value: serde_json::to_value(sequences)?,
        }),
    })
}

struct Journal {
    state: StoreState,
    handle: StateHandle,
    next_index: u64,
}

/// A store backed by a journal file. The whole state is kept in memory; every
/// mutation is appended to the file before it is applied.
pub struct JournalStore {
    journal: Mutex<Journal>,
}

impl JournalStore {
    /// Open the journal at `path`, creating it when it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<JournalStore> {
        let path = path.as_ref();
        let journal = match File::open(path) {
            Ok(file) => {
                let stream = StateEventStream::open_from_reader(io::BufReader::new(file))
                    .with_context(|| format!("Could not read journal {}", path.display()))?;
                let mut document = serde_json::Value::Null;
                let next_index = apply_state_events(&mut document, stream)
                    .with_context(|| format!("Could not replay journal {}", path.display()))?;
                let state = load_document(document)
                    .with_context(|| format!("Could not load journal {}", path.display()))?;
                tracing::debug!(
                    events = next_index,
                    resources = state.resources.len(),
                    changesets = state.changesets.len(),
                    "replayed journal"
                );
                Journal {
                    state,
                    handle: StateHandle::open(path, false)?,
                    next_index,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Journal {
                state: StoreState::default(),
                handle: StateHandle::open(path, true)
                    .with_context(|| format!("Could not create journal {}", path.display()))?,
                next_index: 1,
            },
            Err(e) => bail!("Could not open journal {}: {}", path.display(), e),
        };
        Ok(JournalStore {
            journal: Mutex::new(journal),
        })
    }
}

impl Store for JournalStore {
    fn read(&self, f: &mut dyn FnMut(&StoreState)) {
        f(&lock(&self.journal).state)
    }

    fn transact(&self, f: &mut dyn FnMut(&StoreState) -> Result<Vec<Mutation>>) -> Result<()> {
        let mut journal = lock(&self.journal);
        let mutations = f(&journal.state)?;
        if mutations.is_empty() {
            return Ok(());
        }
        let event = StateEvent {
            index: journal.next_index,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: serde_json::json!({}),
            },
            patch: Patch(
                mutations
                    .iter()
                    .map(patch_operation)
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        journal.handle.append(&[&event])?;
        journal.next_index += 1;
        for mutation in mutations {
            journal.state.apply(mutation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResourceRecord;
    use felis_core::{ChangeKind, ChangesetFilter, NewChangeset};
    use serde_json::json;
    use std::collections::BTreeSet;

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2026-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": {
                    "_type": "felisState",
                    "resources": {},
                    "changesets": {},
                    "sequences": { "resources": 0, "changesets": 0, "tasks": 0 }
                },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2026-03-04T07:41:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "id": 1, "kind": "filesystem", "fields": { "name": "data" } },
                "path": "/resources/1"
            },
            { "op": "add", "value": { "resources": 1, "changesets": 0, "tasks": 0 }, "path": "/sequences" }
        ]
    }
"#;

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(
            events[0].as_ref().unwrap().meta.time,
            "2026-03-04T07:40:00Z"
        );
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let mut state = json!({});
        let next = apply_state_events(&mut state, stream).unwrap();
        assert_eq!(next, 2);
        let state = load_document(state).unwrap();
        let record = &state.resources[&felis_core::ResourceId::new(1)];
        assert_eq!(record.fields["name"], json!("data"));
        assert_eq!(state.sequences.resources.last(), 1);
    }

    #[test]
    fn test_open_state_stream_invalid_index() {
        let input = r#"{"index":1,"meta":{"time":"2026-06-04T07:40:00Z"},"patch":[]}"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn test_open_state_stream_invalid_json() {
        let input = r#"{"index":0,"meta":{"time":"2026-06-04T07:40:00Z"},"patch":[]"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn test_open_state_stream_empty() {
        assert!(StateEventStream::open_from_reader("".as_bytes()).is_err());
    }

    #[test]
    fn test_events_out_of_order() {
        let input = r#"{"index":0,"meta":{"time":"2026-06-04T07:40:00Z"},"patch":[]}
{"index":2,"meta":{"time":"2026-06-04T07:40:00Z"},"patch":[]}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let mut state = json!({});
        assert!(apply_state_events(&mut state, stream).is_err());
    }

    #[test]
    fn test_wrong_document_type() {
        let value = json!({
            "_type": "otherState",
            "resources": {},
            "changesets": {},
            "sequences": { "resources": 0, "changesets": 0, "tasks": 0 }
        });
        assert!(load_document(value).is_err());
        assert!(load_document(json!({"resources": {}})).is_err());
    }

    #[test]
    fn test_journal_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("felis.json");
        let (record, cs) = {
            let store = JournalStore::open(&path).unwrap();
            let record = ResourceRecord {
                id: store.next_resource_id().unwrap(),
                kind: "filesystem".to_string(),
                fields: [("name".to_string(), json!("data"))].into_iter().collect(),
            };
            store.put_resource(&record).unwrap();
            let cs = store
                .insert_changeset(NewChangeset {
                    entity_kind: "filesystem".to_string(),
                    entity_ref: Some(record.id),
                    change_kind: ChangeKind::Create,
                    field: None,
                    old_values: None,
                    priority: 100,
                    dependencies: BTreeSet::new(),
                    author: Some("admin".to_string()),
                })
                .unwrap();
            let gone = ResourceRecord {
                id: store.next_resource_id().unwrap(),
                kind: "filesystem".to_string(),
                fields: Default::default(),
            };
            store.put_resource(&gone).unwrap();
            store.remove_resource(gone.id).unwrap();
            (record, cs)
        };

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.resource(record.id), Some(record.clone()));
        assert_eq!(store.resources(None).len(), 1);
        assert_eq!(store.changesets(&ChangesetFilter::default()), vec![cs]);
        // sequences survive, so ids are not reused
        assert!(store.next_resource_id().unwrap().num() > record.id.num() + 1);
    }

    #[test]
    fn test_failed_transaction_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("felis.json");
        let store = JournalStore::open(&path).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        assert!(store
            .transact(&mut |_| bail!("refused"))
            .is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_concurrent_writers_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("felis.json");
        let mut a = StateHandle::open(&path, true).unwrap();
        let mut b = StateHandle::open(&path, false).unwrap();
        let event = StateEvent {
            index: 1,
            meta: StateEventMeta {
                time: "2026-03-04T07:41:00Z".to_owned(),
                other_fields: json!({}),
            },
            patch: Patch(vec![]),
        };
        b.append(&[&event]).unwrap();
        // a notices foreign bytes but still appends
        a.append(&[&event]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("\"index\": 1").count(), 2);
    }
}
