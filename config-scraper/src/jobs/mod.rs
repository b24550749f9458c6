//! Job plumbing: the singleton guard, run history and job execution.

pub mod guard;
pub mod history;
pub mod job;

pub use guard::{GuardPermit, SingletonGuard};
pub use history::{HistoryRecorder, HistoryRecorderConfig, JobHistory, JobStatus, Retention};
pub use job::{Job, JobExecutor, JobFn, JobRuntime};
