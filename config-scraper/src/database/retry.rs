//! Retrying writes that hit a locked SQLite database.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 10;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2_000;

fn mentions_lock(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6), however sqlx surfaced it.
pub fn is_busy(err: &Error) -> bool {
    match err {
        Error::DatabaseSqlx(sqlx::Error::Database(db)) => {
            matches!(db.code().as_deref(), Some("5") | Some("6")) || mentions_lock(db.message())
        }
        Error::DatabaseSqlx(other) => mentions_lock(&other.to_string()),
        Error::Database(msg) => mentions_lock(msg),
        _ => false,
    }
}

/// Capped exponential delay with up to 25% jitter.
fn busy_delay(attempt: u32) -> Duration {
    let exp = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying while SQLite reports the database as busy.
pub async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = busy_delay(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    ?delay,
                    "SQLite busy, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
