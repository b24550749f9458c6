//! Repository layer: one trait per table with an SQLx implementation.

pub mod change;
pub mod config_item;
pub mod job_history;
pub mod source;

pub use change::{ChangeRepository, SqlxChangeRepository};
pub use config_item::{ConfigItemRepository, SqlxConfigItemRepository, UpsertOutcome};
pub use job_history::{JobHistoryRepository, SqlxJobHistoryRepository};
pub use source::{SourceRepository, SqlxSourceRepository};
