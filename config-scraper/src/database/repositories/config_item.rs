//! Config item repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::ConfigItemDbModel;
use crate::database::retry::retry_on_busy;
use crate::database::time::to_ms;
use crate::domain::{ConfigItem, DeleteReason, Resource};
use crate::{Error, Result};

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// Payload changed.
    Updated,
    /// Payload identical; only `updated_at` moved.
    Unchanged,
}

/// Config item repository trait.
#[async_trait]
pub trait ConfigItemRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<ConfigItem>;
    async fn list_by_source(&self, source_id: &str) -> Result<Vec<ConfigItem>>;
    /// Insert or refresh a resource observed at `observed_at`.
    async fn upsert(
        &self,
        source_id: &str,
        resource: &Resource,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;
    /// Mark live items deleted. Returns the number of rows changed.
    async fn soft_delete(
        &self,
        ids: &[String],
        reason: DeleteReason,
        at: DateTime<Utc>,
    ) -> Result<u64>;
    /// Mark every live item of the source not updated since `older_than` as stale.
    async fn mark_stale(
        &self,
        source_id: &str,
        older_than: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64>;
    /// Clear the stale marking of items updated after they were marked.
    async fn revive_stale(&self, source_id: &str) -> Result<u64>;
    /// Hard-delete items soft-deleted before `deleted_before`, with their
    /// change rows. Returns the number of items removed.
    async fn purge_deleted(&self, deleted_before: DateTime<Utc>) -> Result<u64>;
}

/// SQLx implementation of ConfigItemRepository.
pub struct SqlxConfigItemRepository {
    pool: SqlitePool,
}

impl SqlxConfigItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigItemRepository for SqlxConfigItemRepository {
    async fn get(&self, id: &str) -> Result<ConfigItem> {
        sqlx::query_as::<_, ConfigItemDbModel>("SELECT * FROM config_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("ConfigItem", id))?
            .into_domain()
    }

    async fn list_by_source(&self, source_id: &str) -> Result<Vec<ConfigItem>> {
        sqlx::query_as::<_, ConfigItemDbModel>(
            "SELECT * FROM config_items WHERE source_id = ? ORDER BY kind, name, id",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ConfigItemDbModel::into_domain)
        .collect()
    }

    async fn upsert(
        &self,
        source_id: &str,
        resource: &Resource,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let config = serde_json::to_string(&resource.config)?;
        let now = to_ms(observed_at);
        let config = config.as_str();

        retry_on_busy("upsert_config_item", || async {
            let mut tx = self.pool.begin().await?;

            let existing: Option<(String,)> =
                sqlx::query_as("SELECT config FROM config_items WHERE id = ?")
                    .bind(&resource.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let outcome = match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO config_items (id, source_id, kind, name, config, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&resource.id)
                    .bind(source_id)
                    .bind(&resource.kind)
                    .bind(&resource.name)
                    .bind(config)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Created
                }
                Some((stored,)) => {
                    sqlx::query(
                        r#"
                        UPDATE config_items
                        SET kind = ?, name = ?, config = ?, updated_at = MAX(updated_at, ?)
                        WHERE id = ?
                        "#,
                    )
                    .bind(&resource.kind)
                    .bind(&resource.name)
                    .bind(config)
                    .bind(now)
                    .bind(&resource.id)
                    .execute(&mut *tx)
                    .await?;

                    if stored == config {
                        UpsertOutcome::Unchanged
                    } else {
                        UpsertOutcome::Updated
                    }
                }
            };

            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    async fn soft_delete(
        &self,
        ids: &[String],
        reason: DeleteReason,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let at = to_ms(at);

        retry_on_busy("soft_delete_config_items", || async {
            let mut tx = self.pool.begin().await?;
            let mut affected = 0;
            for id in ids {
                affected += sqlx::query(
                    r#"
                    UPDATE config_items SET deleted_at = ?, delete_reason = ?
                    WHERE id = ? AND deleted_at IS NULL
                    "#,
                )
                .bind(at)
                .bind(reason.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
            tx.commit().await?;
            Ok(affected)
        })
        .await
    }

    async fn mark_stale(
        &self,
        source_id: &str,
        older_than: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let older_than = to_ms(older_than);
        let at = to_ms(at);

        retry_on_busy("mark_stale_config_items", || async {
            let result = sqlx::query(
                r#"
                UPDATE config_items SET deleted_at = ?, delete_reason = ?
                WHERE source_id = ? AND deleted_at IS NULL AND updated_at < ?
                "#,
            )
            .bind(at)
            .bind(DeleteReason::Stale.as_str())
            .bind(source_id)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn revive_stale(&self, source_id: &str) -> Result<u64> {
        retry_on_busy("revive_stale_config_items", || async {
            let result = sqlx::query(
                r#"
                UPDATE config_items SET deleted_at = NULL, delete_reason = NULL
                WHERE source_id = ?
                  AND deleted_at IS NOT NULL
                  AND delete_reason = ?
                  AND updated_at > deleted_at
                "#,
            )
            .bind(source_id)
            .bind(DeleteReason::Stale.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn purge_deleted(&self, deleted_before: DateTime<Utc>) -> Result<u64> {
        let deleted_before = to_ms(deleted_before);

        retry_on_busy("purge_deleted_config_items", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                DELETE FROM config_changes
                WHERE config_id IN (
                    SELECT id FROM config_items
                    WHERE deleted_at IS NOT NULL AND deleted_at < ?
                )
                "#,
            )
            .bind(deleted_before)
            .execute(&mut *tx)
            .await?;
            let purged = sqlx::query(
                "DELETE FROM config_items WHERE deleted_at IS NOT NULL AND deleted_at < ?",
            )
            .bind(deleted_before)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;
            Ok(purged)
        })
        .await
    }
}
