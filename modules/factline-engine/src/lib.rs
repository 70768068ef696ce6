//! Event-sourcing database engine over SQLite.
//!
//! Every state change is appended to the version-ordered event log, then
//! turned into per-entity mutations by pluggable reducers, applied inside
//! savepoint-scoped transactions, and post-processed by derivers. Events
//! apply strictly in version order, exactly once; readers on the
//! read-only connection observe committed state only, never a
//! half-applied event.
//!
//! The pipeline per event: preprocess → reduce → apply → bump metadata
//! version → derive → persist the outcome back onto the queue row. Any
//! phase may fail without losing progress: the version always advances
//! and the failure is recorded on the stored event.

mod db;
pub mod engine;
pub mod error;
mod metadata;
pub mod migrate;
pub mod traits;

pub use engine::{EntityDef, EntityReader, Esdb, EsdbOptions, Notification, NotificationKind};
pub use error::{EsdbError, Result};
pub use migrate::{Migration, MigrationContext};
pub use traits::{Capabilities, EntityModel, Reduction};

pub use factline_events::{ErrorMap, Event, EventQueue, MutationSet, ResultMap};
