//! Scrape source definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration::parse_duration;
use crate::{Error, Result};

/// Schedule sentinel meaning "disable without deleting".
pub const NEVER_SCHEDULE: &str = "@never";

/// Stale timeout sentinel that disables reclaiming.
pub const KEEP_STALE_ITEMS: &str = "keep";

/// A resource type to watch for event-driven updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKind {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
}

impl WatchKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_version.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}/{}", self.api_version, self.kind)
        }
    }
}

/// How long an unobserved resource lives before it is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTimeout {
    /// Never reclaim resources of this source.
    Keep,
    After(Duration),
}

/// Retention rule for one change type of a source.
///
/// At least one of `age` and `count` must be set; a row matching either is
/// deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRetention {
    /// Change type the rule applies to.
    pub name: String,
    /// Rows first observed longer ago than this are deleted (e.g. `7d`).
    #[serde(default)]
    pub age: Option<String>,
    /// Only this many of the newest rows are kept.
    #[serde(default)]
    pub count: Option<u32>,
}

/// A [`ChangeRetention`] with its age parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRetentionRule {
    pub change_type: String,
    pub max_age: Option<Duration>,
    pub keep_latest: Option<u32>,
}

impl ChangeRetention {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_age(mut self, age: impl Into<String>) -> Self {
        self.age = Some(age.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn rule(&self) -> Result<ChangeRetentionRule> {
        let change_type = self.name.trim();
        if change_type.is_empty() {
            return Err(Error::validation("change retention needs a change type"));
        }
        let max_age = match self.age.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(age) => Some(parse_duration(age)?),
        };
        let keep_latest = self.count.filter(|n| *n > 0);
        if max_age.is_none() && keep_latest.is_none() {
            return Err(Error::validation(format!(
                "change retention for '{change_type}' needs an age or a count"
            )));
        }
        Ok(ChangeRetentionRule {
            change_type: change_type.to_string(),
            max_age,
            keep_latest,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionSpec {
    #[serde(default)]
    pub changes: Vec<ChangeRetention>,
}

/// The declarative part of a scrape source.
///
/// Any difference here between the running job and a fresh definition forces
/// the job to be torn down and rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Cron expression, `@every <duration>`, a descriptor such as `@hourly`,
    /// or `@never`. Empty means the engine default.
    #[serde(default)]
    pub schedule: String,
    /// Source-specific parameters handed to the scraper untouched.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Resource kinds to watch. Empty means the source is not event-driven.
    #[serde(default)]
    pub watch: Vec<WatchKind>,
    /// Window in which repeated changes of the same kind collapse (e.g. `1h`).
    #[serde(default)]
    pub dedup_window: Option<String>,
    /// Timeout after which unobserved resources are reclaimed, or `keep`.
    #[serde(default)]
    pub stale_timeout: Option<String>,
    /// Free-form feature flags (`disable`, `watch.disable`, `runNow`).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub retention: RetentionSpec,
}

impl SourceSpec {
    fn property_on(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
    }
}

/// A configured external system to inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSource {
    pub id: String,
    pub name: String,
    /// Scraper type, e.g. `kubernetes`, `aws`, `http`.
    pub source_type: String,
    /// Monotonic configuration version from the control plane.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub spec: SourceSpec,
    /// Set when the control plane has deleted the source.
    #[serde(default)]
    pub deleted: bool,
}

impl ScrapeSource {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_type: source_type.into(),
            version: 0,
            spec: SourceSpec::default(),
            deleted: false,
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.spec.schedule = schedule.into();
        self
    }

    pub fn with_watch(mut self, watch: Vec<WatchKind>) -> Self {
        self.spec.watch = watch;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.spec.stale_timeout = Some(timeout.into());
        self
    }

    pub fn with_dedup_window(mut self, window: impl Into<String>) -> Self {
        self.spec.dedup_window = Some(window.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_change_retention(mut self, rule: ChangeRetention) -> Self {
        self.spec.retention.changes.push(rule);
        self
    }

    /// Parsed change retention rules.
    pub fn change_retention_rules(&self) -> Result<Vec<ChangeRetentionRule>> {
        self.spec
            .retention
            .changes
            .iter()
            .map(|r| {
                r.rule()
                    .map_err(|e| Error::config(format!("source {}: {e}", self.id)))
            })
            .collect()
    }

    /// Whether the source should have no scheduled jobs at all.
    pub fn is_unscheduled(&self) -> bool {
        self.deleted || self.spec.schedule.trim() == NEVER_SCHEDULE
    }

    pub fn is_disabled(&self) -> bool {
        self.spec.property_on("disable")
    }

    pub fn watch_disabled(&self) -> bool {
        self.spec.property_on("watch.disable")
    }

    pub fn run_on_schedule(&self) -> bool {
        self.spec.property_on("runNow")
    }

    /// Whether the source has event-driven watches.
    pub fn is_event_driven(&self) -> bool {
        !self.spec.watch.is_empty() && !self.watch_disabled()
    }

    /// Watched kinds, deduplicated and sorted.
    pub fn watch_kinds(&self) -> Vec<WatchKind> {
        let mut kinds = self.spec.watch.clone();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Effective dedup window.
    pub fn dedup_window(&self, default: Duration) -> Result<Duration> {
        match self.spec.dedup_window.as_deref().map(str::trim) {
            None | Some("") => Ok(default),
            Some(value) => parse_duration(value).map_err(|e| {
                Error::config(format!("source {}: dedup window: {e}", self.id))
            }),
        }
    }

    /// Effective stale timeout.
    pub fn stale_timeout(&self, default: Duration) -> Result<StaleTimeout> {
        match self.spec.stale_timeout.as_deref().map(str::trim) {
            None | Some("") => Ok(StaleTimeout::After(default)),
            Some(KEEP_STALE_ITEMS) => Ok(StaleTimeout::Keep),
            Some(value) => parse_duration(value)
                .map(StaleTimeout::After)
                .map_err(|e| Error::config(format!("source {}: stale timeout: {e}", self.id))),
        }
    }

    /// Check everything that can be checked without touching the source.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("scrape source id must not be empty"));
        }
        if self.source_type.trim().is_empty() {
            return Err(Error::validation(format!(
                "scrape source {} has no type",
                self.id
            )));
        }
        self.dedup_window(Duration::from_secs(1))?;
        self.stale_timeout(Duration::from_secs(1))?;
        self.change_retention_rules()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_schedule_and_deleted_are_unscheduled() {
        let source = ScrapeSource::new("s1", "cluster", "kubernetes");
        assert!(!source.is_unscheduled());
        assert!(source.clone().with_schedule("@never").is_unscheduled());

        let mut deleted = source;
        deleted.deleted = true;
        assert!(deleted.is_unscheduled());
    }

    #[test]
    fn test_stale_timeout_parsing() {
        let default = Duration::from_secs(86_400);
        let source = ScrapeSource::new("s1", "cluster", "kubernetes");
        assert_eq!(
            source.stale_timeout(default).unwrap(),
            StaleTimeout::After(default)
        );
        assert_eq!(
            source.clone().with_stale_timeout("keep").stale_timeout(default).unwrap(),
            StaleTimeout::Keep
        );
        assert_eq!(
            source.clone().with_stale_timeout("2h").stale_timeout(default).unwrap(),
            StaleTimeout::After(Duration::from_secs(7_200))
        );
        assert!(source.with_stale_timeout("two hours").validate().is_err());
    }

    #[test]
    fn test_watch_kinds_dedup_and_flags() {
        let source = ScrapeSource::new("s1", "cluster", "kubernetes").with_watch(vec![
            WatchKind::new("v1", "Pod"),
            WatchKind::new("apps/v1", "Deployment"),
            WatchKind::new("v1", "Pod"),
        ]);
        assert_eq!(source.watch_kinds().len(), 2);
        assert!(source.is_event_driven());
        assert!(!source.with_property("watch.disable", "true").is_event_driven());
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let source: ScrapeSource = serde_json::from_str(
            r#"{"id":"a","name":"aws-prod","source_type":"aws","spec":{"schedule":"@every 5m"}}"#,
        )
        .unwrap();
        assert_eq!(source.spec.schedule, "@every 5m");
        assert!(source.spec.watch.is_empty());
        assert!(!source.deleted);
    }

    #[test]
    fn test_change_retention_rules() {
        let source = ScrapeSource::new("s1", "cluster", "kubernetes")
            .with_change_retention(ChangeRetention::new("diff").with_age("7d"))
            .with_change_retention(ChangeRetention::new("BackOff").with_count(10));
        let rules = source.change_retention_rules().unwrap();
        assert_eq!(rules[0].max_age, Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(rules[0].keep_latest, None);
        assert_eq!(rules[1].keep_latest, Some(10));

        let empty = source.clone().with_change_retention(ChangeRetention::new("Pulled").with_count(0));
        assert!(empty.validate().unwrap_err().is_configuration());
        let unnamed = source.with_change_retention(ChangeRetention::new(" ").with_age("1h"));
        assert!(unnamed.validate().is_err());
    }
}
