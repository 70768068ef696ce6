//! Core types for the event log. Domain-agnostic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutations actually applied, keyed by entity name.
pub type ResultMap = BTreeMap<String, MutationSet>;

/// Failure descriptions, keyed by phase bucket or entity name.
///
/// Reducer failures use the entity name as key; engine-phase failures use
/// the reserved keys `_preprocess`, `_apply` and `_derive`.
pub type ErrorMap = BTreeMap<String, serde_json::Value>;

/// One externally-caused fact, immutable once finalized.
///
/// Created by [`EventQueue::add`](crate::EventQueue::add) with an assigned
/// version and empty outcome, rewritten exactly once by the apply engine
/// with the final `result`/`error`/`failed_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Version: strictly increasing, unique, assigned at append time.
    pub v: i64,
    /// Routing tag selecting preprocessor/reducer handling.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload; shape is defined by the entity that handles the type.
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
    /// Per-entity mutations that were applied. Absent if nothing changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,
    /// Per-phase/per-entity failures. The version still advances past an
    /// errored event; the error is the durable record of what went wrong.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMap>,
    /// Mutations that were computed but rolled back, kept for diagnosis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_result: Option<ResultMap>,
}

impl Event {
    /// Whether any phase recorded a failure for this event.
    pub fn is_err(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// The applied mutation set for one entity, if any.
    pub fn result_for(&self, entity: &str) -> Option<&MutationSet> {
        self.result.as_ref()?.get(entity)
    }
}

/// A reducer's declared intent for one entity: exactly one shape per entity
/// per event. Serializes as `{"set":[..]}`, `{"ins":[..]}`, `{"upd":[..]}`
/// or `{"rm":[..]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationSet {
    /// Full replacements; insert when missing. Idempotent under re-apply.
    Set(Vec<serde_json::Value>),
    /// Strict inserts.
    Ins(Vec<serde_json::Value>),
    /// Shallow merges into existing documents.
    Upd(Vec<serde_json::Value>),
    /// Removals by id.
    Rm(Vec<serde_json::Value>),
}
