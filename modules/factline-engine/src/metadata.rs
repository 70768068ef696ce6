//! The reserved metadata entity: one row tracking the latest
//! durably-applied version.
//!
//! The bump happens in the same commit unit as the queue row rewrite, so
//! "current version" and "queue has an outcome for that version" never
//! diverge.

use sqlx::sqlite::SqlitePool;

pub(crate) const VERSION_ID: &str = "version";

pub(crate) async fn setup(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            id TEXT    PRIMARY KEY,
            v  INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// The tracked version, or 0 when no event was ever applied.
pub(crate) async fn get_version<'e, E>(executor: E) -> Result<i64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query_as::<_, (i64,)>("SELECT v FROM metadata WHERE id = ?")
        .bind(VERSION_ID)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|r| r.0).unwrap_or(0))
}

pub(crate) async fn set_version(
    conn: &mut sqlx::SqliteConnection,
    v: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO metadata (id, v) VALUES (?, ?)
        ON CONFLICT (id) DO UPDATE SET v = excluded.v
        "#,
    )
    .bind(VERSION_ID)
    .bind(v)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
