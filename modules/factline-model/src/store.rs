//! KeyedStore — the event-dispatching write surface for a [`KeyedModel`].
//!
//! Nothing here touches entity rows. Every call appends an event and
//! waits for the engine to handle it, then decodes the finalized outcome.

use anyhow::anyhow;
use factline_engine::{Esdb, Result};
use factline_events::{Event, MutationSet};
use serde_json::Value;

use crate::entity::{Action, KeyedAction};

/// Write handle for one keyed entity.
#[derive(Clone)]
pub struct KeyedStore {
    esdb: Esdb,
    name: String,
    event_type: String,
}

impl KeyedStore {
    pub fn new(esdb: Esdb, name: impl Into<String>) -> Self {
        let name = name.into();
        let event_type = format!("es:{name}");
        Self {
            esdb,
            name,
            event_type,
        }
    }

    /// Replace the document, inserting when missing. Returns the stored
    /// document (with its assigned id).
    pub async fn set(&self, doc: Value) -> Result<Value> {
        let event = self.write(Action::Set, None, Some(doc)).await?;
        self.stored_doc(&event).await
    }

    /// Strict insert; fails with an `EEXIST` event error if the id is
    /// taken.
    pub async fn insert(&self, doc: Value) -> Result<Value> {
        let event = self.write(Action::Insert, None, Some(doc)).await?;
        self.stored_doc(&event).await
    }

    /// Shallow-merge into an existing document; fails with `ENOENT` if it
    /// does not exist. Returns the merged document.
    pub async fn update(&self, doc: Value) -> Result<Value> {
        if doc.get("id").filter(|v| !v.is_null()).is_none() {
            return Err(anyhow!("{}: update requires an id", self.name).into());
        }
        let event = self.write(Action::Update, None, Some(doc)).await?;
        self.stored_doc(&event).await
    }

    /// Upsert: merge when present, insert when missing.
    pub async fn save(&self, doc: Value) -> Result<Value> {
        let event = self.write(Action::Save, None, Some(doc)).await?;
        self.stored_doc(&event).await
    }

    /// Remove by id. A no-op (still a logged event) when already gone.
    pub async fn remove(&self, id: Value) -> Result<bool> {
        self.write(Action::Remove, Some(id), None).await?;
        Ok(true)
    }

    async fn write(&self, action: Action, id: Option<Value>, doc: Option<Value>) -> Result<Event> {
        let payload = KeyedAction { action, id, doc };
        self.esdb
            .dispatch(&self.event_type, serde_json::to_value(&payload)?)
            .await
    }

    /// The document as stored after the event applied. `Set`/`Ins`
    /// mutations carry it whole; `Upd` is a patch, so read the merged
    /// state back.
    async fn stored_doc(&self, event: &Event) -> Result<Value> {
        match event.result_for(&self.name) {
            Some(MutationSet::Set(docs)) | Some(MutationSet::Ins(docs)) => docs
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("{}: empty mutation set", self.name).into()),
            Some(MutationSet::Upd(_)) => {
                let payload: KeyedAction = serde_json::from_value(event.data.clone())?;
                let id = payload
                    .id
                    .ok_or_else(|| anyhow!("{}: stored event has no id", self.name))?;
                self.esdb
                    .reader(&self.name)?
                    .get(&id)
                    .await?
                    .ok_or_else(|| anyhow!("{}: updated document vanished", self.name).into())
            }
            _ => Err(anyhow!("{}: event recorded no mutation", self.name).into()),
        }
    }
}
