//! Connection management for the store pair.
//!
//! The read-write pool is capped at one connection: SQLite has a single
//! writer, and the one-connection pool is also the sharing unit for the
//! "queue and store on the same file" fast path (two writer connections on
//! one file can deadlock against each other's transactions).

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn base_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
}

/// The single read-write connection for a file-backed store.
pub(crate) async fn writer_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect_with(base_options(path).create_if_missing(true))
        .await
}

/// Read-only connections that observe committed state only. Opened after
/// the writer has created the file and run setup.
pub(crate) async fn reader_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(base_options(path).read_only(true))
        .await
}

/// One shared in-memory database. Every new `:memory:` connection is a
/// different database, so the pool is pinned to a single never-reaped
/// connection and serves all three roles (queue, read-write, read-only).
pub(crate) async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(SqliteConnectOptions::new().in_memory(true))
        .await
}

/// Best-effort file identity check for the shared-connection fast path.
pub(crate) fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
