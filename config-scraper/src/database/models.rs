//! Row types and their conversions to domain types.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::{from_ms, opt_from_ms};
use crate::Result;
use crate::domain::{ChangeRecord, ConfigItem, DeleteReason, ScrapeSource, SourceSpec};

/// `scrape_sources` row. `spec` is the JSON encoded [`SourceSpec`].
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScrapeSourceDbModel {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub version: i64,
    pub spec: String,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ScrapeSourceDbModel {
    pub fn from_domain(source: &ScrapeSource, now_ms: i64) -> Result<Self> {
        Ok(Self {
            id: source.id.clone(),
            name: source.name.clone(),
            source_type: source.source_type.clone(),
            version: source.version,
            spec: serde_json::to_string(&source.spec)?,
            deleted: source.deleted,
            created_at: now_ms,
            updated_at: now_ms,
        })
    }

    pub fn into_domain(self) -> Result<ScrapeSource> {
        let spec: SourceSpec = serde_json::from_str(&self.spec)?;
        Ok(ScrapeSource {
            id: self.id,
            name: self.name,
            source_type: self.source_type,
            version: self.version,
            spec,
            deleted: self.deleted,
        })
    }
}

/// `config_items` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConfigItemDbModel {
    pub id: String,
    pub source_id: String,
    pub kind: String,
    pub name: String,
    /// JSON encoded resource payload.
    pub config: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub delete_reason: Option<String>,
}

impl ConfigItemDbModel {
    pub fn into_domain(self) -> Result<ConfigItem> {
        let delete_reason = self
            .delete_reason
            .as_deref()
            .map(str::parse::<DeleteReason>)
            .transpose()?;
        Ok(ConfigItem {
            id: self.id,
            source_id: self.source_id,
            kind: self.kind,
            name: self.name,
            config: serde_json::from_str(&self.config)?,
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
            deleted_at: opt_from_ms(self.deleted_at),
            delete_reason,
        })
    }
}

/// `config_changes` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChangeDbModel {
    pub id: String,
    pub config_id: String,
    pub change_type: String,
    pub summary: Option<String>,
    pub details: String,
    pub count: i64,
    pub first_observed: i64,
    pub last_observed: i64,
}

impl ChangeDbModel {
    pub fn into_domain(self) -> Result<ChangeRecord> {
        Ok(ChangeRecord {
            id: self.id,
            config_id: self.config_id,
            change_type: self.change_type,
            summary: self.summary,
            details: serde_json::from_str(&self.details)?,
            count: self.count,
            first_observed: from_ms(self.first_observed),
            last_observed: from_ms(self.last_observed),
        })
    }
}

/// `job_history` row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobHistoryDbModel {
    pub id: String,
    pub job_name: String,
    pub resource_id: String,
    pub status: String,
    pub success_count: i64,
    pub error_count: i64,
    /// JSON array of strings.
    pub errors: String,
    /// JSON object.
    pub details: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
}
