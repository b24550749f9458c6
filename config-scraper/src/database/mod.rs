//! SQLite persistence for config items, changes, job history and sources.
//!
//! Timestamps are stored as epoch milliseconds (see [`time`]).

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Upper bound on pooled connections; SQLite serializes writers anyway.
const MAX_POOL_SIZE: u32 = 8;

/// Writers wait this long for the lock before SQLITE_BUSY surfaces.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pragmas applied to every new connection.
///
/// Change bursts from watches produce many small writes, so checkpoints are
/// frequent and temp b-trees stay in memory.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    "PRAGMA temp_store = MEMORY",
    "PRAGMA cache_size = -16000",
];

async fn apply_pragmas(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(*pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true))
}

/// One connection per core for readers plus one for the history flusher,
/// capped at [`MAX_POOL_SIZE`].
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    (cores + 1).min(MAX_POOL_SIZE)
}

/// Open a WAL-mode SQLite pool with `max_connections` connections.
///
/// `sqlite::memory:` databases are private to a connection, so callers that
/// use one must pass `max_connections = 1`.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_pragmas(conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    tracing::info!(max_connections, "Database pool initialized");
    Ok(pool)
}

pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_pool_size()).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    tracing::info!("Applying database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// A migrated in-memory database with a single connection.
pub async fn memory_pool() -> crate::Result<DbPool> {
    let pool = init_pool_with_size("sqlite::memory:", 1).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
