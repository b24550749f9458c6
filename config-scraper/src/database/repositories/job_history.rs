//! Job history repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::JobHistoryDbModel;
use crate::database::retry::retry_on_busy;
use crate::database::time::{from_ms, to_ms};
use crate::jobs::history::{JobHistory, JobStatus, Retention};
use crate::Result;

const SUCCESS_STATUSES: &str = "('SUCCESS', 'SKIPPED')";
const FAILURE_STATUSES: &str = "('FAILED', 'WARNING')";

/// Job history repository trait.
#[async_trait]
pub trait JobHistoryRepository: Send + Sync {
    async fn insert(&self, history: &JobHistory) -> Result<()>;
    /// Drop the oldest runs beyond what `retention` keeps. Returns rows removed.
    async fn prune(&self, job_name: &str, resource_id: &str, retention: Retention) -> Result<u64>;
    /// Most recent first.
    async fn list(&self, job_name: &str, resource_id: &str) -> Result<Vec<JobHistory>>;
}

/// SQLx implementation of JobHistoryRepository.
pub struct SqlxJobHistoryRepository {
    pool: SqlitePool,
}

impl SqlxJobHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn prune_group(
        &self,
        job_name: &str,
        resource_id: &str,
        statuses: &str,
        keep: u32,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            DELETE FROM job_history
            WHERE job_name = ? AND resource_id = ? AND status IN {statuses}
              AND id NOT IN (
                SELECT id FROM job_history
                WHERE job_name = ? AND resource_id = ? AND status IN {statuses}
                ORDER BY started_at DESC
                LIMIT ?
              )
            "#
        );
        let sql = sql.as_str();

        retry_on_busy("prune_job_history", || async {
            let result = sqlx::query(sql)
                .bind(job_name)
                .bind(resource_id)
                .bind(job_name)
                .bind(resource_id)
                .bind(i64::from(keep))
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

fn into_domain(model: JobHistoryDbModel) -> Result<JobHistory> {
    Ok(JobHistory {
        id: model.id,
        job_name: model.job_name,
        resource_id: model.resource_id,
        status: model.status.parse::<JobStatus>()?,
        success_count: model.success_count,
        errors: serde_json::from_str(&model.errors)?,
        details: serde_json::from_str(&model.details)?,
        started_at: from_ms(model.started_at),
        finished_at: Some(from_ms(model.finished_at)),
    })
}

#[async_trait]
impl JobHistoryRepository for SqlxJobHistoryRepository {
    async fn insert(&self, history: &JobHistory) -> Result<()> {
        let errors = serde_json::to_string(&history.errors)?;
        let details = serde_json::to_string(&history.details)?;
        let (errors, details) = (errors.as_str(), details.as_str());
        let finished_at = history.finished_at.unwrap_or(history.started_at);

        retry_on_busy("insert_job_history", || async {
            sqlx::query(
                r#"
                INSERT INTO job_history
                    (id, job_name, resource_id, status, success_count, error_count,
                     errors, details, started_at, finished_at, duration_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&history.id)
            .bind(&history.job_name)
            .bind(&history.resource_id)
            .bind(history.status.as_str())
            .bind(history.success_count)
            .bind(history.errors.len() as i64)
            .bind(errors)
            .bind(details)
            .bind(to_ms(history.started_at))
            .bind(to_ms(finished_at))
            .bind(history.duration().as_millis() as i64)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn prune(&self, job_name: &str, resource_id: &str, retention: Retention) -> Result<u64> {
        let ok = self
            .prune_group(job_name, resource_id, SUCCESS_STATUSES, retention.success)
            .await?;
        let failed = self
            .prune_group(job_name, resource_id, FAILURE_STATUSES, retention.failed)
            .await?;
        Ok(ok + failed)
    }

    async fn list(&self, job_name: &str, resource_id: &str) -> Result<Vec<JobHistory>> {
        sqlx::query_as::<_, JobHistoryDbModel>(
            r#"
            SELECT * FROM job_history
            WHERE job_name = ? AND resource_id = ?
            ORDER BY started_at DESC
            "#,
        )
        .bind(job_name)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(into_domain)
        .collect()
    }
}
