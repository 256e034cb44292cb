use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ValidationError,
    fields::FieldMap,
    ids::{ChangesetId, ResourceId, TaskId},
};

/// Priority of a change without side effects. Such changesets commit when they are recorded.
pub const NO_SIDE_EFFECT: u16 = 0;
pub const DEFAULT_CREATE_PRIORITY: u16 = 100;
pub const DEFAULT_UPDATE_PRIORITY: u16 = 50;
pub const DEFAULT_DELETE_PRIORITY: u16 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}
impl ChangeKind {
    pub fn default_priority(self) -> u16 {
        match self {
            ChangeKind::Create => DEFAULT_CREATE_PRIORITY,
            ChangeKind::Update => DEFAULT_UPDATE_PRIORITY,
            ChangeKind::Delete => DEFAULT_DELETE_PRIORITY,
        }
    }
}
impl Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeKind::Create => "CREATE",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        })
    }
}
impl FromStr for ChangeKind {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(ChangeKind::Create),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            _ => Err(ValidationError::new(format!("unknown change kind `{}'", s))),
        }
    }
}

/// Where a changeset is in its lifecycle. Derived from the timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetState {
    Pending,
    Running,
    Committed,
    RolledBack,
}
impl Display for ChangesetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangesetState::Pending => "pending",
            ChangesetState::Running => "running",
            ChangesetState::Committed => "committed",
            ChangesetState::RolledBack => "rolled_back",
        })
    }
}
impl FromStr for ChangesetState {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetState::Pending),
            "running" => Ok(ChangesetState::Running),
            "committed" => Ok(ChangesetState::Committed),
            "rolled_back" | "rolledback" => Ok(ChangesetState::RolledBack),
            _ => Err(ValidationError::new(format!(
                "unknown changeset state `{}'",
                s
            ))),
        }
    }
}

/// How a changeset terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// One recorded mutation of a managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: ChangesetId,
    pub entity_kind: String,
    /// Unset for DELETE, and for a CREATE that was rolled back.
    pub entity_ref: Option<ResourceId>,
    pub change_kind: ChangeKind,
    pub field: Option<String>,
    pub old_values: Option<FieldMap>,
    pub priority: u16,
    #[serde(default)]
    pub dependencies: BTreeSet<ChangesetId>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub committed: Option<DateTime<Utc>>,
    pub rolledback: Option<DateTime<Utc>>,
    pub task_handle: Option<TaskId>,
    pub author: Option<String>,
}

impl Changeset {
    pub fn is_resolved(&self) -> bool {
        self.committed.is_some() || self.rolledback.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && !self.is_resolved()
    }

    /// Waiting for the scheduler.
    pub fn is_pending(&self) -> bool {
        self.priority > NO_SIDE_EFFECT && self.started.is_none() && !self.is_resolved()
    }

    pub fn state(&self) -> ChangesetState {
        if self.rolledback.is_some() {
            ChangesetState::RolledBack
        } else if self.committed.is_some() {
            ChangesetState::Committed
        } else if self.started.is_some() {
            ChangesetState::Running
        } else {
            ChangesetState::Pending
        }
    }

    /// The resource this changeset is about. For DELETE this is the former
    /// identity kept in `old_values`.
    pub fn subject(&self) -> Option<ResourceId> {
        self.entity_ref.or_else(|| {
            self.old_values
                .as_ref()
                .and_then(|old| old.get("id"))
                .and_then(Value::as_u64)
                .map(ResourceId::new)
        })
    }

    /// Name of the hook that carries out this changeset, if any.
    pub fn task_name(&self) -> Option<String> {
        match (self.change_kind, &self.field) {
            (ChangeKind::Create, _) => Some("create".to_string()),
            (ChangeKind::Delete, _) => Some("delete".to_string()),
            (ChangeKind::Update, Some(field)) => Some(format!("update_{}", field)),
            (ChangeKind::Update, None) => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |msg: &str| Err(ValidationError::new(format!("changeset {}: {}", self.id, msg)));
        if self.committed.is_some() && self.rolledback.is_some() {
            return fail("both committed and rolled back");
        }
        if self.field.is_some() && self.change_kind != ChangeKind::Update {
            return fail("only an UPDATE can name a field");
        }
        match self.change_kind {
            ChangeKind::Create => {
                if self.old_values.is_some() {
                    return fail("CREATE carries old values");
                }
                if self.entity_ref.is_none() && self.rolledback.is_none() {
                    return fail("CREATE without a resource");
                }
            }
            ChangeKind::Update => {
                if self.old_values.is_none() {
                    return fail("UPDATE without old values");
                }
                if self.entity_ref.is_none() {
                    return fail("UPDATE without a resource");
                }
            }
            ChangeKind::Delete => {
                if self.entity_ref.is_some() {
                    return fail("DELETE still refers to a resource");
                }
                if self.subject().is_none() {
                    return fail("DELETE without the former resource id");
                }
            }
        }
        Ok(())
    }
}

/// A changeset as requested by the ledger. The store assigns `id` and `created`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChangeset {
    pub entity_kind: String,
    pub entity_ref: Option<ResourceId>,
    pub change_kind: ChangeKind,
    pub field: Option<String>,
    pub old_values: Option<FieldMap>,
    pub priority: u16,
    pub dependencies: BTreeSet<ChangesetId>,
    pub author: Option<String>,
}

impl NewChangeset {
    pub fn into_changeset(self, id: ChangesetId, created: DateTime<Utc>) -> Changeset {
        Changeset {
            id,
            entity_kind: self.entity_kind,
            entity_ref: self.entity_ref,
            change_kind: self.change_kind,
            field: self.field,
            old_values: self.old_values,
            priority: self.priority,
            dependencies: self.dependencies,
            created,
            started: None,
            // nothing to run
            committed: if self.priority == NO_SIDE_EFFECT {
                Some(created)
            } else {
                None
            },
            rolledback: None,
            task_handle: None,
            author: self.author,
        }
    }
}

/// Selection for the changeset feed. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesetFilter {
    pub entity: Option<ResourceId>,
    pub entity_kind: Option<String>,
    pub change_kind: Option<ChangeKind>,
    pub author: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub state: Option<ChangesetState>,
}

impl ChangesetFilter {
    pub fn for_entity(entity: ResourceId) -> Self {
        ChangesetFilter {
            entity: Some(entity),
            ..Default::default()
        }
    }

    pub fn in_state(state: ChangesetState) -> Self {
        ChangesetFilter {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn matches(&self, cs: &Changeset) -> bool {
        self.entity.map_or(true, |e| cs.subject() == Some(e))
            && self.entity_kind.as_ref().map_or(true, |k| &cs.entity_kind == k)
            && self.change_kind.map_or(true, |k| cs.change_kind == k)
            && self
                .author
                .as_ref()
                .map_or(true, |a| cs.author.as_ref() == Some(a))
            && self.since.map_or(true, |t| cs.created >= t)
            && self.until.map_or(true, |t| cs.created < t)
            && self.state.map_or(true, |s| cs.state() == s)
    }
}
