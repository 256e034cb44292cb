//! The changeset ledger and everything that drives changesets to completion:
//! the record store, the hook registry, the executor and the scheduler loop.

pub mod cache;
pub mod context;
pub mod dispatch;
pub mod exec;
pub mod executor;
pub mod journal;
pub mod ledger;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use context::HookContext;
pub use ledger::Ledger;
pub use registry::{HookTable, Registry, Relation, ResourceKind, Resolver};
pub use store::{ResourceRecord, Store};
