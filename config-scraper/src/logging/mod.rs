//! Logging setup with a reloadable filter and optional daily log files.

use chrono::{DateTime, Local, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "config_scraper=info,sqlx=warn";

/// Prefix of the daily rolled log files.
const LOG_FILE_PREFIX: &str = "config-scraper.log";

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Runtime control over the installed subscriber.
pub struct LoggingHandle {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `config_scraper=debug,sqlx=warn`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::Other(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Delete rolled log files older than `retention`, at startup and then daily.
    ///
    /// Does nothing when logging only to the console.
    pub fn start_retention_cleanup(self: &Arc<Self>, retention: Duration, cancel: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match cleanup_old_logs(&log_dir, retention, Utc::now()).await {
                            Ok(0) => {}
                            Ok(deleted) => info!(deleted, "Removed expired log files"),
                            Err(e) => warn!(error = %e, dir = %log_dir.display(), "Log retention sweep failed"),
                        }
                    }
                }
            }
            debug!("Log retention sweep stopped");
        });
    }
}

/// Day a rolled file covers, from its `config-scraper.log.YYYY-MM-DD` name.
fn rolled_file_date(path: &Path) -> Option<NaiveDate> {
    let suffix = path
        .file_name()?
        .to_str()?
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Delete rolled files whose day ended more than `retention` before `now`.
///
/// Files that do not look like rolled logs are left alone. Returns how many
/// files were removed.
async fn cleanup_old_logs(
    log_dir: &Path,
    retention: Duration,
    now: DateTime<Utc>,
) -> std::io::Result<usize> {
    let Some(cutoff) = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .map(|t| t.date_naive())
    else {
        return Ok(0);
    };

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let expired = rolled_file_date(&path).is_some_and(|day| day < cutoff);
        if !expired || !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove log file"),
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// Console output is always on. With a `log_dir`, logs are also written to a
/// daily rolled file there; keep the returned guard alive for the process
/// lifetime or buffered lines are lost.
pub fn init_logging(
    log_dir: Option<&str>,
) -> crate::Result<(Arc<LoggingHandle>, Option<WorkerGuard>)> {
    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let log_path = log_dir.map(PathBuf::from);
    let (file_layer, guard) = match &log_path {
        Some(path) => {
            std::fs::create_dir_all(path)?;
            let file_appender = tracing_appender::rolling::daily(path, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    let handle = Arc::new(LoggingHandle {
        handle: filter_handle,
        log_dir: log_path,
    });

    Ok((handle, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("config_scraper=info"));
        assert!(DEFAULT_LOG_FILTER.contains("sqlx=warn"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_rolled_file_date() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(
            rolled_file_date(Path::new("/var/log/config-scraper.log.2026-03-01")),
            Some(day)
        );
        assert_eq!(rolled_file_date(Path::new("config-scraper.log")), None);
        assert_eq!(rolled_file_date(Path::new("notes.2026-03-01")), None);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_rolled_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let old = (now - chrono::Duration::days(30)).format("%Y-%m-%d");
        let today = now.format("%Y-%m-%d");

        let old_file = dir.path().join(format!("{LOG_FILE_PREFIX}.{old}"));
        let new_file = dir.path().join(format!("{LOG_FILE_PREFIX}.{today}"));
        let other_file = dir.path().join(format!("notes.{old}"));
        for path in [&old_file, &new_file, &other_file] {
            std::fs::write(path, "line\n").unwrap();
        }

        let week = Duration::from_secs(7 * 86_400);
        let removed = cleanup_old_logs(dir.path(), week, now).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!old_file.exists());
        assert!(new_file.exists());
        assert!(other_file.exists());
    }
}
