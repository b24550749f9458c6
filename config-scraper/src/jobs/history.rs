//! Run history for scheduled jobs.
//!
//! Every invocation produces one [`JobHistory`]. Records are handed to a
//! [`HistoryRecorder`], which writes them from a background task so a slow
//! database never delays the job that produced them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::database::repositories::JobHistoryRepository;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Success,
    /// Finished with some successes and some errors.
    Warning,
    Failed,
    /// Not executed because another run held the guard.
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Statuses counted against the failure side of a [`Retention`].
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Warning)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "WARNING" => Ok(Self::Warning),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(Error::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// How many finished runs of one job are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub success: u32,
    pub failed: u32,
}

impl Retention {
    pub const FEW: Self = Self { success: 3, failed: 3 };
    pub const BALANCED: Self = Self { success: 3, failed: 6 };
    pub const SHORT: Self = Self { success: 1, failed: 1 };
    pub const FAILED_ONLY: Self = Self { success: 0, failed: 3 };
}

/// One job invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: String,
    pub job_name: String,
    /// Scrape source the run belongs to, empty for global jobs.
    pub resource_id: String,
    pub status: JobStatus,
    pub success_count: i64,
    pub errors: Vec<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobHistory {
    pub fn start(
        job_name: impl Into<String>,
        resource_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: job_name.into(),
            resource_id: resource_id.into(),
            status: JobStatus::Running,
            success_count: 0,
            errors: Vec::new(),
            details: serde_json::Map::new(),
            started_at,
            finished_at: None,
        }
    }

    /// A run that never executed because the job was already in flight.
    pub fn skipped(job_name: impl Into<String>, resource_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut history = Self::start(job_name, resource_id, at);
        history.status = JobStatus::Skipped;
        history.finished_at = Some(at);
        history
    }

    pub fn add_error(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
    }

    pub fn add_success(&mut self) {
        self.success_count += 1;
    }

    pub fn add_successes(&mut self, n: i64) {
        self.success_count += n;
    }

    /// Attach a structured detail. Values that fail to serialize are recorded as errors.
    pub fn add_details(&mut self, key: impl Into<String>, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.details.insert(key.into(), v);
            }
            Err(e) => self.add_error(format!("details: {e}")),
        }
    }

    /// Close the run; the status follows from the recorded counts.
    pub fn finish(&mut self, at: DateTime<Utc>) {
        if self.status == JobStatus::Skipped {
            return;
        }
        self.status = match (self.errors.is_empty(), self.success_count > 0) {
            (true, _) => JobStatus::Success,
            (false, true) => JobStatus::Warning,
            (false, false) => JobStatus::Failed,
        };
        self.finished_at = Some(at);
    }

    pub fn duration(&self) -> Duration {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
            .unwrap_or_default()
    }
}

enum RecorderMessage {
    Record(JobHistory, Retention),
    Flush(oneshot::Sender<()>),
}

/// Configuration for the history recorder.
#[derive(Debug, Clone)]
pub struct HistoryRecorderConfig {
    pub max_buffer_size: usize,
    pub flush_interval: Duration,
}

impl Default for HistoryRecorderConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 64,
            flush_interval: Duration::from_secs(2),
        }
    }
}

/// Append-only, non-blocking sink for [`JobHistory`] records.
pub struct HistoryRecorder {
    sender: mpsc::Sender<RecorderMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryRecorder {
    pub fn new(repo: Arc<dyn JobHistoryRepository>, config: HistoryRecorderConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_buffer_size * 4);
        let handle = tokio::spawn(Self::run_flush_loop(receiver, repo, config));
        Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a finished run. Never waits; a full buffer drops the record.
    pub fn record(&self, history: JobHistory, retention: Retention) {
        if let Err(e) = self.sender.try_send(RecorderMessage::Record(history, retention)) {
            let history = match e {
                mpsc::error::TrySendError::Full(RecorderMessage::Record(h, _))
                | mpsc::error::TrySendError::Closed(RecorderMessage::Record(h, _)) => Some(h),
                _ => None,
            };
            if let Some(h) = history {
                warn!(job = %h.job_name, status = %h.status, "Job history buffer unavailable, dropping record");
            }
        }
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(RecorderMessage::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush and stop the background writer.
    pub async fn close(&self) {
        self.flush().await;
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    async fn run_flush_loop(
        mut receiver: mpsc::Receiver<RecorderMessage>,
        repo: Arc<dyn JobHistoryRepository>,
        config: HistoryRecorderConfig,
    ) {
        let mut buffer: Vec<(JobHistory, Retention)> = Vec::with_capacity(config.max_buffer_size);
        let mut flush_timer = interval(config.flush_interval);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = receiver.recv() => match msg {
                    Some(RecorderMessage::Record(history, retention)) => {
                        buffer.push((history, retention));
                        if buffer.len() >= config.max_buffer_size {
                            Self::write(repo.as_ref(), std::mem::take(&mut buffer)).await;
                        }
                    }
                    Some(RecorderMessage::Flush(done)) => {
                        Self::write(repo.as_ref(), std::mem::take(&mut buffer)).await;
                        let _ = done.send(());
                    }
                    None => {
                        Self::write(repo.as_ref(), std::mem::take(&mut buffer)).await;
                        break;
                    }
                },
                _ = flush_timer.tick() => {
                    if !buffer.is_empty() {
                        Self::write(repo.as_ref(), std::mem::take(&mut buffer)).await;
                    }
                }
            }
        }
    }

    async fn write(repo: &dyn JobHistoryRepository, batch: Vec<(JobHistory, Retention)>) {
        if batch.is_empty() {
            return;
        }
        debug!(records = batch.len(), "Writing job history");
        for (history, retention) in batch {
            if let Err(e) = repo.insert(&history).await {
                warn!(job = %history.job_name, error = %e, "Failed to write job history");
                continue;
            }
            if let Err(e) = repo
                .prune(&history.job_name, &history.resource_id, retention)
                .await
            {
                warn!(job = %history.job_name, error = %e, "Failed to prune job history");
            }
        }
    }
}

impl Drop for HistoryRecorder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use crate::database::repositories::SqlxJobHistoryRepository;

    #[test]
    fn test_finish_derives_status() {
        let now = Utc::now();

        let mut ok = JobHistory::start("scrape", "s1", now);
        ok.add_successes(3);
        ok.finish(now);
        assert_eq!(ok.status, JobStatus::Success);

        let mut partial = JobHistory::start("scrape", "s1", now);
        partial.add_successes(2);
        partial.add_error("item pod-3: constraint failed");
        partial.finish(now);
        assert_eq!(partial.status, JobStatus::Warning);

        let mut failed = JobHistory::start("scrape", "s1", now);
        failed.add_error("unauthorized");
        failed.finish(now);
        assert_eq!(failed.status, JobStatus::Failed);

        let mut skipped = JobHistory::skipped("scrape", "s1", now);
        skipped.finish(now);
        assert_eq!(skipped.status, JobStatus::Skipped);
    }

    #[test]
    fn test_details_are_structured() {
        let mut history = JobHistory::start("scrape", "s1", Utc::now());
        history.add_details("scrape_summary", serde_json::json!({"Pod": {"added": 2}}));
        assert_eq!(history.details["scrape_summary"]["Pod"]["added"], 2);
    }

    #[tokio::test]
    async fn test_recorder_writes_and_prunes() {
        let pool = memory_pool().await.unwrap();
        let repo = Arc::new(SqlxJobHistoryRepository::new(pool));
        let recorder = HistoryRecorder::new(repo.clone(), HistoryRecorderConfig::default());

        let start = Utc::now();
        for i in 0..5 {
            let mut h = JobHistory::start("scrape", "s1", start + chrono::Duration::seconds(i));
            h.add_success();
            h.finish(start + chrono::Duration::seconds(i));
            recorder.record(h, Retention::SHORT);
        }
        recorder.flush().await;

        let rows = repo.list("scrape", "s1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].started_at.timestamp(), (start + chrono::Duration::seconds(4)).timestamp());
    }
}
