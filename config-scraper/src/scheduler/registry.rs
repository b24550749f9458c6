//! Registry of scheduled cron entries.
//!
//! Each entry owns a task that sleeps until the job's next fire time and then
//! hands the job to the executor on a fresh task, so a slow run never delays
//! the next tick (the singleton guard skips the overlap instead).

use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::clock::SharedClock;
use crate::jobs::{Job, JobExecutor};

struct CronEntry {
    job: Job,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct JobRegistry {
    entries: DashMap<String, CronEntry>,
    executor: JobExecutor,
    clock: SharedClock,
    cancel: CancellationToken,
}

impl JobRegistry {
    pub fn new(executor: JobExecutor, clock: SharedClock, cancel: CancellationToken) -> Self {
        Self {
            entries: DashMap::new(),
            executor,
            clock,
            cancel,
        }
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    /// Start `job`, replacing any entry under the same key.
    ///
    /// A job whose schedule never fires is not registered; any previous entry
    /// under its key is still removed. Returns whether an entry is now running.
    pub fn schedule(&self, job: Job) -> bool {
        self.unschedule(&job.key);
        if job.schedule.is_never() {
            debug!(job = %job.key, "Schedule never fires, not registering");
            return false;
        }

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(cron_loop(
            job.clone(),
            self.executor.clone(),
            self.clock.clone(),
            cancel.clone(),
        ));
        info!(job = %job.key, schedule = %job.schedule.expr(), "Scheduled job");
        self.entries.insert(
            job.key.clone(),
            CronEntry {
                job,
                cancel,
                handle,
            },
        );
        true
    }

    /// Stop and remove the entry under `key`. In-flight runs finish on their own.
    pub fn unschedule(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(job = key, "Unscheduled job");
                true
            }
            None => false,
        }
    }

    /// The job registered under `key`.
    pub fn get(&self, key: &str) -> Option<Job> {
        self.entries.get(key).map(|e| e.job.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop every entry and wait for the cron loops to exit.
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.cancel.cancel();
                handles.push(entry.handle);
            }
        }
        futures::future::join_all(handles).await;
    }
}

async fn cron_loop(job: Job, executor: JobExecutor, clock: SharedClock, cancel: CancellationToken) {
    if job.run_on_start {
        spawn_run(&job, &executor, &cancel);
    }

    loop {
        let now = clock.now();
        let Some(next) = job.schedule.next_after(now) else {
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        trace!(job = %job.key, ?wait, "Waiting for next run");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        spawn_run(&job, &executor, &cancel);
    }
    trace!(job = %job.key, "Cron loop stopped");
}

fn spawn_run(job: &Job, executor: &JobExecutor, cancel: &CancellationToken) {
    let job = job.clone();
    let executor = executor.clone();
    let cancel = cancel.child_token();
    tokio::spawn(async move {
        executor.execute(&job, cancel).await;
    });
}
