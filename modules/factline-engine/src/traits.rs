//! The per-entity contract the engine drives.
//!
//! An entity owns its own row storage and is touched by the engine only
//! through this narrow surface: `exists`/`get` for reads,
//! `apply_changes` for declared mutations, and the optional
//! preprocess/reduce/derive hooks selected by its capability set.

use anyhow::Result;
use async_trait::async_trait;
use factline_events::{Event, MutationSet, ResultMap};
use sqlx::SqliteConnection;

/// Explicit capability tags, checked once at registration.
///
/// An entity must declare at least one hook or registration fails fast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub preprocessor: bool,
    pub reducer: bool,
    pub deriver: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        preprocessor: false,
        reducer: false,
        deriver: false,
    };

    pub fn any(&self) -> bool {
        self.preprocessor || self.reducer || self.deriver
    }

    pub fn preprocessor(mut self) -> Self {
        self.preprocessor = true;
        self
    }

    pub fn reducer(mut self) -> Self {
        self.reducer = true;
        self
    }

    pub fn deriver(mut self) -> Self {
        self.deriver = true;
        self
    }
}

/// A reducer's verdict for one entity and one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// Nothing to do for this event.
    NoChange,
    /// Apply this mutation set if every other entity also reduced cleanly.
    Mutate(MutationSet),
    /// Domain failure (e.g. conflicting insert). Poisons the whole event:
    /// no entity's mutations are applied, the version still advances.
    Fail(serde_json::Value),
}

/// One pluggable entity. All storage access goes through the connection the
/// engine hands in, so reads during reduce observe the committed pre-event
/// snapshot and writes during apply/derive join the engine's savepoints.
#[async_trait]
pub trait EntityModel: Send + Sync {
    /// Create tables/indexes. Called once at startup, before migrations.
    async fn setup(&self, conn: &mut SqliteConnection) -> Result<()>;

    async fn exists(&self, conn: &mut SqliteConnection, id: &serde_json::Value) -> Result<bool>;

    async fn get(
        &self,
        conn: &mut SqliteConnection,
        id: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>>;

    /// Apply a declared mutation set. Must be idempotent-safe for the
    /// `Set` shape: re-applying the same `Set` yields the same state.
    async fn apply_changes(
        &self,
        conn: &mut SqliteConnection,
        changes: &MutationSet,
    ) -> Result<()>;

    fn capabilities(&self) -> Capabilities;

    /// Rewrite the event before reduction (e.g. assign ids). Return `None`
    /// to leave it untouched. A replacement must keep the original version
    /// and a non-empty type; `Err` aborts the chain, attributed to this
    /// entity.
    async fn preprocess(
        &self,
        _conn: &mut SqliteConnection,
        _event: &Event,
    ) -> Result<Option<Event>> {
        Ok(None)
    }

    /// Compute this entity's mutation set from the committed pre-event
    /// state and the (possibly rewritten) event.
    async fn reduce(&self, _conn: &mut SqliteConnection, _event: &Event) -> Result<Reduction> {
        Ok(Reduction::NoChange)
    }

    /// Post-apply hook for secondary derived state. Runs inside its own
    /// savepoint; a failure rolls back derived state only.
    async fn derive(
        &self,
        _conn: &mut SqliteConnection,
        _event: &Event,
        _result: &ResultMap,
    ) -> Result<()> {
        Ok(())
    }
}
