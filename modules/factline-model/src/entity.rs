//! KeyedModel — one JSON document per id, driven by the standard action
//! policy.
//!
//! Events carry type `es:{name}` and a [`KeyedAction`] payload. The id is
//! assigned by the preprocessor for every action except `remove`, so the
//! stored (rewritten) event replays to the identical id.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use factline_engine::{Capabilities, EntityModel, Reduction};
use factline_events::{Event, MutationSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqliteConnection;

/// What to do with the addressed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Replace, inserting when missing.
    Set,
    /// Strict insert; fails `EEXIST` when the id is taken.
    Insert,
    /// Shallow merge; fails `ENOENT` when the id is missing.
    Update,
    /// Upsert: merge when present, insert when missing.
    Save,
    /// Delete; a no-op when the id is already gone.
    Remove,
}

/// Payload shape for `es:{name}` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedAction {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// The default entity: a `(id TEXT PRIMARY KEY, doc TEXT)` table.
pub struct KeyedModel {
    name: String,
    event_type: String,
}

impl KeyedModel {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let event_type = format!("es:{name}");
        Self { name, event_type }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The routing tag this model's preprocessor/reducer answer to.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Next free integer id. Recomputed from the table, so a rebuild from
    /// version 1 assigns the same sequence again.
    async fn next_id(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(&format!(
            r#"SELECT COALESCE(MAX(CAST(id AS INTEGER)), 0) + 1 FROM "{}""#,
            self.name
        ))
        .fetch_one(conn)
        .await?;
        Ok(row.0)
    }

    async fn exists_key(&self, conn: &mut SqliteConnection, key: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>(&format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE id = ?"#,
            self.name
        ))
        .bind(key)
        .fetch_one(conn)
        .await?;
        Ok(row.0 > 0)
    }

    fn parse(&self, event: &Event) -> Result<KeyedAction> {
        serde_json::from_value(event.data.clone())
            .map_err(|e| anyhow!("{}: bad action payload: {e}", self.name))
    }
}

#[async_trait]
impl EntityModel for KeyedModel {
    async fn setup(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (id TEXT PRIMARY KEY, doc TEXT NOT NULL)"#,
            self.name
        ))
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn exists(&self, conn: &mut SqliteConnection, id: &Value) -> Result<bool> {
        self.exists_key(conn, &id_key(id)?).await
    }

    async fn get(&self, conn: &mut SqliteConnection, id: &Value) -> Result<Option<Value>> {
        let row = sqlx::query_as::<_, (String,)>(&format!(
            r#"SELECT doc FROM "{}" WHERE id = ?"#,
            self.name
        ))
        .bind(id_key(id)?)
        .fetch_optional(conn)
        .await?;
        row.map(|r| serde_json::from_str(&r.0).map_err(Into::into))
            .transpose()
    }

    async fn apply_changes(&self, conn: &mut SqliteConnection, changes: &MutationSet) -> Result<()> {
        match changes {
            MutationSet::Set(docs) => {
                for doc in docs {
                    sqlx::query(&format!(
                        r#"
                        INSERT INTO "{}" (id, doc) VALUES (?, ?)
                        ON CONFLICT (id) DO UPDATE SET doc = excluded.doc
                        "#,
                        self.name
                    ))
                    .bind(doc_key(doc)?)
                    .bind(serde_json::to_string(doc)?)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            MutationSet::Ins(docs) => {
                for doc in docs {
                    sqlx::query(&format!(
                        r#"INSERT INTO "{}" (id, doc) VALUES (?, ?)"#,
                        self.name
                    ))
                    .bind(doc_key(doc)?)
                    .bind(serde_json::to_string(doc)?)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            MutationSet::Upd(docs) => {
                for patch in docs {
                    let key = doc_key(patch)?;
                    let existing = sqlx::query_as::<_, (String,)>(&format!(
                        r#"SELECT doc FROM "{}" WHERE id = ?"#,
                        self.name
                    ))
                    .bind(&key)
                    .fetch_optional(&mut *conn)
                    .await?;
                    let Some((raw,)) = existing else {
                        bail!("{}: no document {key} to update", self.name);
                    };
                    let mut doc: Value = serde_json::from_str(&raw)?;
                    shallow_merge(&mut doc, patch);
                    sqlx::query(&format!(r#"UPDATE "{}" SET doc = ? WHERE id = ?"#, self.name))
                        .bind(serde_json::to_string(&doc)?)
                        .bind(&key)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            MutationSet::Rm(ids) => {
                for id in ids {
                    sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id = ?"#, self.name))
                        .bind(id_key(id)?)
                        .execute(&mut *conn)
                        .await?;
                }
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.preprocessor().reducer()
    }

    /// Assign the id up front so it lands in the stored event.
    async fn preprocess(
        &self,
        conn: &mut SqliteConnection,
        event: &Event,
    ) -> Result<Option<Event>> {
        if event.event_type != self.event_type {
            return Ok(None);
        }
        let mut payload = self.parse(event)?;
        if payload.action == Action::Remove {
            return Ok(None);
        }
        let doc = payload
            .doc
            .as_ref()
            .ok_or_else(|| anyhow!("{}: {:?} requires a document", self.name, payload.action))?;

        // Always recompute: a replayed event must get the same id back.
        let id = match doc.get("id").filter(|v| !v.is_null()) {
            Some(id) => id.clone(),
            None => json!(self.next_id(conn).await?),
        };
        payload.id = Some(id);

        let mut rewritten = event.clone();
        rewritten.data = serde_json::to_value(&payload)?;
        Ok(Some(rewritten))
    }

    async fn reduce(&self, conn: &mut SqliteConnection, event: &Event) -> Result<Reduction> {
        if event.event_type != self.event_type {
            return Ok(Reduction::NoChange);
        }
        let payload = self.parse(event)?;
        let id = payload
            .id
            .clone()
            .or_else(|| payload.doc.as_ref()?.get("id").cloned())
            .filter(|v| !v.is_null())
            .ok_or_else(|| anyhow!("{}: no id specified", self.name))?;

        if payload.action == Action::Remove {
            return Ok(if self.exists(conn, &id).await? {
                Reduction::Mutate(MutationSet::Rm(vec![id]))
            } else {
                Reduction::NoChange
            });
        }

        let mut doc = payload
            .doc
            .ok_or_else(|| anyhow!("{}: {:?} requires a document", self.name, payload.action))?;
        if doc.get("id").filter(|v| !v.is_null()).is_none() {
            let obj = doc
                .as_object_mut()
                .ok_or_else(|| anyhow!("{}: document must be an object", self.name))?;
            obj.insert("id".to_string(), id.clone());
        }

        let exists = self.exists(conn, &id).await?;
        Ok(match payload.action {
            Action::Set if exists => Reduction::Mutate(MutationSet::Set(vec![doc])),
            Action::Set => Reduction::Mutate(MutationSet::Ins(vec![doc])),
            Action::Insert if exists => Reduction::Fail(json!("EEXIST")),
            Action::Insert => Reduction::Mutate(MutationSet::Ins(vec![doc])),
            Action::Update if exists => Reduction::Mutate(MutationSet::Upd(vec![doc])),
            Action::Update => Reduction::Fail(json!("ENOENT")),
            Action::Save if exists => Reduction::Mutate(MutationSet::Upd(vec![doc])),
            Action::Save => Reduction::Mutate(MutationSet::Ins(vec![doc])),
            Action::Remove => unreachable!("handled above"),
        })
    }
}

/// Storage key for an id value. Strings and integers only; anything else
/// has no stable text form.
fn id_key(id: &Value) -> Result<String> {
    match id {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => bail!("unsupported id type: {other}"),
    }
}

fn doc_key(doc: &Value) -> Result<String> {
    let id = doc
        .get("id")
        .filter(|v| !v.is_null())
        .ok_or_else(|| anyhow!("document has no id: {doc}"))?;
    id_key(id)
}

fn shallow_merge(base: &mut Value, patch: &Value) {
    let (Some(base), Some(patch)) = (base.as_object_mut(), patch.as_object()) else {
        return;
    };
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_payload_round_trips() {
        let payload = KeyedAction {
            action: Action::Insert,
            id: Some(json!(3)),
            doc: Some(json!({ "id": 3, "name": "ada" })),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["action"], json!("insert"));
        let back: KeyedAction = serde_json::from_value(value).unwrap();
        assert_eq!(back.action, Action::Insert);
        assert_eq!(back.id, Some(json!(3)));
    }

    #[test]
    fn shallow_merge_overwrites_top_level_keys_only() {
        let mut base = json!({ "id": 1, "name": "a", "tags": { "x": 1 } });
        shallow_merge(&mut base, &json!({ "name": "b", "tags": { "y": 2 } }));
        assert_eq!(base, json!({ "id": 1, "name": "b", "tags": { "y": 2 } }));
    }

    #[test]
    fn id_keys_are_stable_for_strings_and_integers() {
        assert_eq!(id_key(&json!("count")).unwrap(), "count");
        assert_eq!(id_key(&json!(42)).unwrap(), "42");
        assert!(id_key(&json!([1])).is_err());
    }
}
