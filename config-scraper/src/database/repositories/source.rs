//! Scrape source repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ScrapeSourceDbModel;
use crate::database::retry::retry_on_busy;
use crate::database::time::now_ms;
use crate::domain::ScrapeSource;
use crate::{Error, Result};

/// Scrape source repository trait.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Sources that have not been deleted.
    async fn list(&self) -> Result<Vec<ScrapeSource>>;
    async fn get(&self, id: &str) -> Result<ScrapeSource>;
    async fn save(&self, source: &ScrapeSource) -> Result<()>;
    async fn mark_deleted(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of SourceRepository.
pub struct SqlxSourceRepository {
    pool: SqlitePool,
}

impl SqlxSourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceRepository for SqlxSourceRepository {
    async fn list(&self) -> Result<Vec<ScrapeSource>> {
        sqlx::query_as::<_, ScrapeSourceDbModel>(
            "SELECT * FROM scrape_sources WHERE deleted = 0 ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScrapeSourceDbModel::into_domain)
        .collect()
    }

    async fn get(&self, id: &str) -> Result<ScrapeSource> {
        sqlx::query_as::<_, ScrapeSourceDbModel>("SELECT * FROM scrape_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("ScrapeSource", id))?
            .into_domain()
    }

    async fn save(&self, source: &ScrapeSource) -> Result<()> {
        let model = ScrapeSourceDbModel::from_domain(source, now_ms())?;
        let model = &model;

        retry_on_busy("save_scrape_source", || async {
            sqlx::query(
                r#"
                INSERT INTO scrape_sources (id, name, source_type, version, spec, deleted, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    source_type = excluded.source_type,
                    version = excluded.version,
                    spec = excluded.spec,
                    deleted = excluded.deleted,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&model.id)
            .bind(&model.name)
            .bind(&model.source_type)
            .bind(model.version)
            .bind(&model.spec)
            .bind(model.deleted)
            .bind(model.created_at)
            .bind(model.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn mark_deleted(&self, id: &str) -> Result<()> {
        retry_on_busy("delete_scrape_source", || async {
            let result = sqlx::query(
                "UPDATE scrape_sources SET deleted = 1, updated_at = ? WHERE id = ?",
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(Error::not_found("ScrapeSource", id));
            }
            Ok(())
        })
        .await
    }
}
