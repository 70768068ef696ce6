//! EventQueue — append-only, version-ordered log over a SQLite table.
//!
//! Version assignment happens inside the INSERT statement, so it is
//! serialized by SQLite's write lock: versions are gap-free and strictly
//! increasing from 1 no matter how many logical callers append at once.
//!
//! Change notifications in SQLite are connection-local, so `get_next` pairs
//! an in-process wake signal with a bounded poll interval as the
//! cross-process fallback.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::Notify;
use tracing::debug;

use crate::types::Event;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Append-only event log. The single source of truth for ordering.
#[derive(Clone)]
pub struct EventQueue {
    pool: SqlitePool,
    wake: Arc<Notify>,
    cancel: Arc<Notify>,
    poll_interval: Duration,
}

impl EventQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            wake: Arc::new(Notify::new()),
            cancel: Arc::new(Notify::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often `get_next` re-checks the table for rows written by other
    /// processes sharing the same file.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create the queue table if it does not exist.
    pub async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                v             INTEGER PRIMARY KEY,
                type          TEXT    NOT NULL,
                ts            TEXT    NOT NULL,
                data          TEXT    NOT NULL,
                result        TEXT,
                error         TEXT,
                failed_result TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Durably append a new event with the next version number.
    ///
    /// `ts` defaults to now. Returns the stored event including its
    /// assigned `v`.
    pub async fn add(
        &self,
        event_type: &str,
        data: serde_json::Value,
        ts: Option<DateTime<Utc>>,
    ) -> Result<Event> {
        let ts = ts.unwrap_or_else(Utc::now);
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO queue (v, type, ts, data)
            VALUES ((SELECT COALESCE(MAX(v), 0) + 1 FROM queue), ?, ?, ?)
            RETURNING v, type, ts, data, result, error, failed_result
            "#,
        )
        .bind(event_type)
        .bind(ts)
        .bind(json_text(&data)?)
        .fetch_one(&self.pool)
        .await?;

        debug!(v = event.v, r#type = %event.event_type, "appended event");
        // In-process nudge for long-pollers; other processes rely on the
        // poll interval.
        self.wake.notify_waiters();
        Ok(event)
    }

    /// Exact lookup by version.
    pub async fn get(&self, v: i64) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, Event>(
            "SELECT v, type, ts, data, result, error, failed_result FROM queue WHERE v = ?",
        )
        .bind(v)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// First event with `v > after_v`.
    ///
    /// When none exists and `wait_if_empty` is set, suspends until a new
    /// row appears or [`cancel`](Self::cancel) is called; otherwise returns
    /// `None` immediately.
    pub async fn get_next(&self, after_v: i64, wait_if_empty: bool) -> Result<Option<Event>> {
        loop {
            // Arm both signals before querying so an append or cancel that
            // lands between the query and the select is not lost.
            let mut woken = pin!(self.wake.notified());
            let mut cancelled = pin!(self.cancel.notified());
            woken.as_mut().enable();
            cancelled.as_mut().enable();

            let row = sqlx::query_as::<_, Event>(
                r#"
                SELECT v, type, ts, data, result, error, failed_result
                FROM queue
                WHERE v > ?
                ORDER BY v ASC
                LIMIT 1
                "#,
            )
            .bind(after_v)
            .fetch_optional(&self.pool)
            .await?;

            if row.is_some() {
                return Ok(row);
            }
            if !wait_if_empty {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut woken => {}
                _ = &mut cancelled => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Overwrite the stored row for `event.v` with the finalized outcome.
    ///
    /// Also rewrites type/ts/data: a preprocessor may have reshaped the
    /// event, and the stored row must match what was actually reduced so
    /// replays are stable.
    pub async fn set(&self, event: &Event) -> Result<()> {
        set_with(event, &self.pool).await
    }

    /// Like [`set`](Self::set), but on a caller-held connection. Used when
    /// the queue shares its connection with the read-write store so the
    /// rewrite joins the apply transaction instead of deadlocking on it.
    pub async fn set_on(&self, conn: &mut sqlx::SqliteConnection, event: &Event) -> Result<()> {
        set_with(event, &mut *conn).await
    }

    /// Highest stored version, or 0 if the queue is empty.
    pub async fn latest_version(&self) -> Result<i64> {
        let row = sqlx::query_as::<_, (Option<i64>,)>("SELECT MAX(v) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }

    /// Release every in-flight `get_next` long-poll with `None`.
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    /// Cancel long-polls and close the underlying pool.
    pub async fn close(&self) {
        self.cancel();
        self.pool.close().await;
    }
}

async fn set_with<'e, E>(event: &Event, executor: E) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE queue
        SET type = ?, ts = ?, data = ?, result = ?, error = ?, failed_result = ?
        WHERE v = ?
        "#,
    )
    .bind(&event.event_type)
    .bind(event.ts)
    .bind(json_text(&event.data)?)
    .bind(opt_json_text(&event.result)?)
    .bind(opt_json_text(&event.error)?)
    .bind(opt_json_text(&event.failed_result)?)
    .bind(event.v)
    .execute(executor)
    .await?;
    Ok(())
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json_text<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(|v| json_text(v)).transpose()
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, SqliteRow> for Event {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let data: String = row.try_get("data")?;
        Ok(Event {
            v: row.try_get("v")?,
            event_type: row.try_get("type")?,
            ts: row.try_get("ts")?,
            data: decode_json("data", &data)?,
            result: decode_json_opt(row, "result")?,
            error: decode_json_opt(row, "error")?,
            failed_result: decode_json_opt(row, "failed_result")?,
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> std::result::Result<T, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn decode_json_opt<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> std::result::Result<Option<T>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| decode_json(column, &s)).transpose()
}
