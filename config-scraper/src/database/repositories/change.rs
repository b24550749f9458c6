//! Change repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::ChangeDbModel;
use crate::database::retry::retry_on_busy;
use crate::database::time::to_ms;
use crate::domain::ChangeRecord;
use crate::{Error, Result};

/// Change repository trait.
#[async_trait]
pub trait ChangeRepository: Send + Sync {
    async fn insert(&self, change: &ChangeRecord) -> Result<()>;
    /// Fold one more observation into an existing row. Returns the new count.
    async fn bump(
        &self,
        id: &str,
        details: &serde_json::Value,
        summary: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Result<i64>;
    async fn get(&self, id: &str) -> Result<ChangeRecord>;
    /// Rows first observed at or after `since`.
    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>>;
    async fn list_for_config(&self, config_id: &str) -> Result<Vec<ChangeRecord>>;
    /// Delete rows of `change_type` on items of the source that were first
    /// observed before `older_than`, or that fall outside the newest
    /// `keep_latest` rows. Returns the number of rows deleted.
    async fn delete_by_retention(
        &self,
        source_id: &str,
        change_type: &str,
        older_than: Option<DateTime<Utc>>,
        keep_latest: Option<u32>,
    ) -> Result<u64>;
    /// Delete rows last observed before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLx implementation of ChangeRepository.
pub struct SqlxChangeRepository {
    pool: SqlitePool,
}

impl SqlxChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeRepository for SqlxChangeRepository {
    async fn insert(&self, change: &ChangeRecord) -> Result<()> {
        let details = serde_json::to_string(&change.details)?;
        let details = details.as_str();

        retry_on_busy("insert_change", || async {
            sqlx::query(
                r#"
                INSERT INTO config_changes
                    (id, config_id, change_type, summary, details, count, first_observed, last_observed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&change.id)
            .bind(&change.config_id)
            .bind(&change.change_type)
            .bind(&change.summary)
            .bind(details)
            .bind(change.count)
            .bind(to_ms(change.first_observed))
            .bind(to_ms(change.last_observed))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn bump(
        &self,
        id: &str,
        details: &serde_json::Value,
        summary: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Result<i64> {
        let details = serde_json::to_string(details)?;
        let details = details.as_str();
        let observed_at = to_ms(observed_at);

        retry_on_busy("bump_change", || async {
            let row: Option<(i64,)> = sqlx::query_as(
                r#"
                UPDATE config_changes
                SET count = count + 1,
                    details = ?,
                    summary = COALESCE(?, summary),
                    last_observed = MAX(last_observed, ?)
                WHERE id = ?
                RETURNING count
                "#,
            )
            .bind(details)
            .bind(summary)
            .bind(observed_at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|(count,)| count)
                .ok_or_else(|| Error::not_found("ConfigChange", id))
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<ChangeRecord> {
        sqlx::query_as::<_, ChangeDbModel>("SELECT * FROM config_changes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("ConfigChange", id))?
            .into_domain()
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>> {
        sqlx::query_as::<_, ChangeDbModel>(
            "SELECT * FROM config_changes WHERE first_observed >= ? ORDER BY first_observed",
        )
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ChangeDbModel::into_domain)
        .collect()
    }

    async fn list_for_config(&self, config_id: &str) -> Result<Vec<ChangeRecord>> {
        sqlx::query_as::<_, ChangeDbModel>(
            "SELECT * FROM config_changes WHERE config_id = ? ORDER BY first_observed, id",
        )
        .bind(config_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ChangeDbModel::into_domain)
        .collect()
    }

    async fn delete_by_retention(
        &self,
        source_id: &str,
        change_type: &str,
        older_than: Option<DateTime<Utc>>,
        keep_latest: Option<u32>,
    ) -> Result<u64> {
        if older_than.is_none() && keep_latest.is_none() {
            return Ok(0);
        }
        let older_than = older_than.map(to_ms);
        let keep_latest = keep_latest.map(i64::from);

        retry_on_busy("delete_changes_by_retention", || async {
            let result = sqlx::query(
                r#"
                WITH ranked AS (
                    SELECT id, first_observed,
                           ROW_NUMBER() OVER (ORDER BY first_observed DESC, id DESC) AS seq
                    FROM config_changes
                    WHERE change_type = ?
                      AND config_id IN (SELECT id FROM config_items WHERE source_id = ?)
                )
                DELETE FROM config_changes
                WHERE id IN (
                    SELECT id FROM ranked
                    WHERE (? IS NOT NULL AND first_observed < ?)
                       OR (? IS NOT NULL AND seq > ?)
                )
                "#,
            )
            .bind(change_type)
            .bind(source_id)
            .bind(older_than)
            .bind(older_than)
            .bind(keep_latest)
            .bind(keep_latest)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = to_ms(cutoff);
        retry_on_busy("delete_old_changes", || async {
            let result = sqlx::query("DELETE FROM config_changes WHERE last_observed < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
