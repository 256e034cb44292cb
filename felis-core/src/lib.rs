//! Types shared by the ledger, the scheduler and the resource kinds.

pub mod changeset;
pub mod error;
pub mod fields;
pub mod fsm;
pub mod ids;
pub mod template;

pub use changeset::{ChangeKind, Changeset, ChangesetFilter, ChangesetState, NewChangeset, Outcome};
pub use fields::FieldMap;
pub use ids::{ChangesetId, ResourceId, TaskId};
