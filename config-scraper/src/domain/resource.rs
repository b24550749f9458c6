//! Scraped resources and the queue items that carry them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A lightweight reference to another object, e.g. the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A change observed on a resource by a scraper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedChange {
    /// Change kind, e.g. `diff`, `BackOff`, `Pulled`.
    pub change_type: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ObservedChange {
    pub fn new(change_type: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            change_type: change_type.into(),
            summary: None,
            details,
        }
    }
}

/// A normalized resource as produced by a scraper or a watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Stable identity of the resource in its external system.
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Set for observation objects (events) that describe another object.
    #[serde(default)]
    pub involved: Option<ObjectRef>,
    #[serde(default)]
    pub changes: Vec<ObservedChange>,
}

impl Resource {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: String::new(),
            namespace: None,
            config,
            involved: None,
            changes: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_change(mut self, change: ObservedChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn observing(mut self, target: ObjectRef) -> Self {
        self.involved = Some(target);
        self
    }

    /// Whether this object only describes another object.
    pub fn is_observation(&self) -> bool {
        self.involved.is_some()
    }

    pub fn as_ref(&self) -> ObjectRef {
        ObjectRef {
            id: self.id.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// What happened to a watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    Upsert,
    Delete,
    /// A delayed second delivery of an item whose dependency was unknown.
    Redeliver,
}

impl QueueOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::Redeliver => "redeliver",
        }
    }
}

/// One observed mutation of an external resource.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub resource: Resource,
    pub operation: QueueOperation,
    pub enqueued_at: DateTime<Utc>,
    /// How many times this item has been redelivered.
    pub redeliveries: u32,
}

impl QueueItem {
    pub fn new(resource: Resource, operation: QueueOperation, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            resource,
            operation,
            enqueued_at,
            redeliveries: 0,
        }
    }

    pub fn upsert(resource: Resource, enqueued_at: DateTime<Utc>) -> Self {
        Self::new(resource, QueueOperation::Upsert, enqueued_at)
    }

    pub fn delete(resource: Resource, enqueued_at: DateTime<Utc>) -> Self {
        Self::new(resource, QueueOperation::Delete, enqueued_at)
    }

    /// The same resource, marked for redelivery.
    pub fn into_redelivery(self) -> Self {
        Self {
            operation: QueueOperation::Redeliver,
            redeliveries: self.redeliveries + 1,
            ..self
        }
    }

    pub fn id(&self) -> &str {
        &self.resource.id
    }
}

/// Why a config item was marked deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// Not re-observed within the source's stale timeout.
    Stale,
    /// A watch reported the resource as deleted.
    DeleteEvent,
    /// The scraper marked the resource deleted from one of its attributes.
    FromAttribute,
    /// Removed by an operator.
    Manual,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::DeleteEvent => "delete_event",
            Self::FromAttribute => "from_attribute",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeleteReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stale" => Ok(Self::Stale),
            "delete_event" => Ok(Self::DeleteEvent),
            "from_attribute" => Ok(Self::FromAttribute),
            "manual" => Ok(Self::Manual),
            other => Err(Error::validation(format!("unknown delete reason '{other}'"))),
        }
    }
}

/// A persisted resource record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub id: String,
    pub source_id: String,
    pub kind: String,
    pub name: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub delete_reason: Option<DeleteReason>,
}

impl ConfigItem {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A persisted change row, possibly standing for several collapsed observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub config_id: String,
    pub change_type: String,
    pub summary: Option<String>,
    /// Latest observed payload.
    pub details: serde_json::Value,
    pub count: i64,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}
