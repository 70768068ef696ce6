//! Default keyed-upsert entity for the event-sourcing engine.
//!
//! [`KeyedModel`] stores one JSON document per id and implements the
//! standard action policy (set/insert/update/save/remove) as a reducer,
//! with id assignment in the preprocessing stage so replays of a stored
//! event always reuse the same id. [`KeyedStore`] is the matching write
//! surface: it dispatches events instead of writing rows, so every change
//! flows through the log.

pub mod entity;
pub mod store;

pub use entity::{Action, KeyedAction, KeyedModel};
pub use store::KeyedStore;
