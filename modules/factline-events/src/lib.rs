//! Version-ordered event log backed by SQLite.
//!
//! Every state change enters the system as an [`Event`] appended here. The
//! queue assigns strictly increasing versions, supports point and tail
//! lookups with optional long-polling, and lets the apply engine rewrite a
//! stored row exactly once with the finalized outcome.
//!
//! The queue knows nothing about reducers or entities. Consumers provide
//! opaque JSON payloads.

pub mod queue;
pub mod types;

pub use queue::EventQueue;
pub use types::{ErrorMap, Event, MutationSet, ResultMap};
