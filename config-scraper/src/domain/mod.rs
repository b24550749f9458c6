//! Domain types shared by the engine.

pub mod duration;
pub mod resource;
pub mod retry_policy;
pub mod source;

pub use duration::{format_duration, parse_duration};
pub use resource::{
    ChangeRecord, ConfigItem, DeleteReason, ObjectRef, ObservedChange, QueueItem,
    QueueOperation, Resource,
};
pub use retry_policy::RetryPolicy;
pub use source::{
    ChangeRetention, ChangeRetentionRule, KEEP_STALE_ITEMS, NEVER_SCHEDULE, RetentionSpec, ScrapeSource,
    SourceSpec, StaleTimeout, WatchKind,
};
