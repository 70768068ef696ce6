//! Per-entity schema/data migrations.
//!
//! Migrations are keyed by a monotonically ordered identifier (date-based
//! by convention), run exactly once per entity before the poll loop starts
//! servicing events, and may append follow-up events to the queue (e.g. to
//! move historical rows into the log).

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use factline_events::EventQueue;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::traits::EntityModel;

/// One migration step for one entity.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Ordering identifier, e.g. `"2024060100"`. Also the once-only marker.
    fn key(&self) -> &str;

    async fn up(&self, ctx: &MigrationContext<'_>) -> Result<()>;
}

/// Handles available to a running migration.
///
/// Acquire connections from `rw` briefly and release them before touching
/// the queue: when queue and store share one file they share one
/// connection, and holding it across `queue.add` would self-deadlock.
pub struct MigrationContext<'a> {
    pub rw: &'a SqlitePool,
    pub queue: &'a EventQueue,
    pub entity: &'a str,
    pub model: &'a dyn EntityModel,
}

pub(crate) async fn setup(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            entity     TEXT NOT NULL,
            key        TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            PRIMARY KEY (entity, key)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Run this entity's pending migrations in key order.
pub(crate) async fn run_pending(
    ctx: &MigrationContext<'_>,
    migrations: &[std::sync::Arc<dyn Migration>],
) -> crate::error::Result<()> {
    let mut pending: Vec<_> = migrations.iter().collect();
    pending.sort_by(|a, b| a.key().cmp(b.key()));

    for migration in pending {
        let done = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM _migrations WHERE entity = ? AND key = ?",
        )
        .bind(ctx.entity)
        .bind(migration.key())
        .fetch_one(ctx.rw)
        .await?;
        if done.0 > 0 {
            continue;
        }

        info!(entity = ctx.entity, key = migration.key(), "running migration");
        migration.up(ctx).await?;

        sqlx::query("INSERT INTO _migrations (entity, key, applied_at) VALUES (?, ?, ?)")
            .bind(ctx.entity)
            .bind(migration.key())
            .bind(Utc::now())
            .execute(ctx.rw)
            .await?;
    }
    Ok(())
}
