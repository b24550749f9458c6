//! Event-driven ingestion: watch loops feed a bounded queue that the
//! incremental consumer drains on a fast interval.

pub mod consumer;
pub mod queue;
pub mod resolved;
pub mod supervisor;

pub use consumer::{ConsumeReport, ConsumerConfig, IncrementalConsumer};
pub use queue::{QueueSender, WatchQueue};
pub use resolved::ResolvedItems;
pub use supervisor::{Backoff, SupervisorStats, WatchState, WatchSupervisor};
