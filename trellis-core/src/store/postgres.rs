use std::fmt;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder, Row, postgres::PgRow};
use tracing::info;

use super::{DatasetStore, JobFilter, JobStore};
use crate::{
    dataset::record::{DatasetParameters, DatasetPatch, DatasetRecord, OwnerRole},
    error::{OrchestrationError, Result},
    orchestration::job::{EnqueueRequest, JobRecord},
    users::User,
};

const JOB_COLUMNS: &str = r#"id, jobtype, remote_id, details, "timestamp", timestamp_after,
    timestamp_claimed, timestamp_lastclaimed, "interval", attempts"#;

const DATASET_COLUMNS: &str = r#"key, query, parameters, result_file, creator, status, type,
    "timestamp", is_finished, is_private, software_version, software_file, num_rows,
    progress, key_parent, job"#;

/// Store backed by the `jobs`, `datasets`, `datasets_owners`, `users` and
/// `users_favourites` tables.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        info!(pool_size = pool.size(), "connected to database");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| OrchestrationError::Internal(format!("Migration failed: {e}")))?;
        Ok(())
    }

    fn map_job_row(row: &PgRow) -> Result<JobRecord> {
        Ok(JobRecord {
            id: row.try_get("id")?,
            jobtype: row.try_get("jobtype")?,
            remote_id: row.try_get("remote_id")?,
            details: row.try_get("details")?,
            timestamp: row.try_get("timestamp")?,
            timestamp_after: row.try_get("timestamp_after")?,
            timestamp_claimed: row.try_get("timestamp_claimed")?,
            timestamp_lastclaimed: row.try_get("timestamp_lastclaimed")?,
            interval: row.try_get("interval")?,
            attempts: row.try_get("attempts")?,
        })
    }

    fn map_dataset_row(row: &PgRow) -> Result<DatasetRecord> {
        let Json(parameters): Json<DatasetParameters> = row.try_get("parameters")?;
        Ok(DatasetRecord {
            key: row.try_get("key")?,
            query: row.try_get("query")?,
            parameters,
            result_file: row.try_get("result_file")?,
            creator: row.try_get("creator")?,
            status: row.try_get("status")?,
            dataset_type: row.try_get("type")?,
            timestamp: row.try_get("timestamp")?,
            is_finished: row.try_get("is_finished")?,
            is_private: row.try_get("is_private")?,
            software_version: row.try_get("software_version")?,
            software_file: row.try_get("software_file")?,
            num_rows: row.try_get("num_rows")?,
            progress: row.try_get("progress")?,
            key_parent: row.try_get("key_parent")?,
            job: row.try_get("job")?,
        })
    }

    fn map_user_row(row: &PgRow) -> Result<User> {
        let Json(tags): Json<Vec<String>> = row.try_get("tags")?;
        Ok(User {
            name: row.try_get("name")?,
            tags,
            is_admin: row.try_get("is_admin")?,
        })
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert_job(
        &self,
        request: &EnqueueRequest,
        timestamp: i64,
    ) -> Result<(JobRecord, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (jobtype, remote_id, details, "timestamp", timestamp_after, "interval")
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (jobtype, remote_id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&request.jobtype)
        .bind(&request.remote_id)
        .bind(&request.details)
        .bind(timestamp)
        .bind(request.claim_after)
        .bind(request.interval)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((Self::map_job_row(&row)?, true));
        }

        let existing = self
            .job_by_remote_id(Some(&request.jobtype), &request.remote_id)
            .await?
            .ok_or_else(|| {
                OrchestrationError::NotFound(format!(
                    "job {}/{} vanished during insert",
                    request.jobtype, request.remote_id
                ))
            })?;
        Ok((existing, false))
    }

    async fn job_by_id(&self, id: i64) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_job_row).transpose()
    }

    async fn job_by_remote_id(
        &self,
        jobtype: Option<&str>,
        remote_id: &str,
    ) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE remote_id = $1 AND ($2::text IS NULL OR jobtype = $2)
            ORDER BY "timestamp", id
            LIMIT 1
            "#
        ))
        .bind(remote_id)
        .bind(jobtype)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_job_row).transpose()
    }

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR jobtype = $1)
              AND ($2::text IS NULL OR remote_id = $2)
              AND ($3::bigint IS NULL OR (
                    timestamp_claimed = 0
                    AND timestamp_after < $3
                    AND ("interval" = 0 OR timestamp_lastclaimed + "interval" <= $3)))
            ORDER BY "timestamp", id
            LIMIT $4
            "#
        ))
        .bind(filter.jobtype.as_deref())
        .bind(filter.remote_id.as_deref())
        .bind(filter.claimable_at)
        .bind(filter.limit.map(|limit| limit as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_job_row).collect()
    }

    async fn count_jobs(&self, jobtype: Option<&str>) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE ($1::text IS NULL OR jobtype = $1)",
        )
        .bind(jobtype)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn claim_job(&self, id: i64, claimed_at: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET timestamp_claimed = $2, timestamp_lastclaimed = $2
            WHERE id = $1 AND timestamp_claimed = 0
            "#,
        )
        .bind(id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_job(&self, id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reset_recurring_job(&self, id: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE jobs SET timestamp_claimed = 0, attempts = 0 WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn release_job(&self, id: i64, timestamp_after: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET timestamp_claimed = 0, attempts = attempts + 1, timestamp_after = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(timestamp_after)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_all_jobs(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE jobs SET timestamp_claimed = 0 WHERE timestamp_claimed <> 0")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn count_jobs_ahead(&self, job: &JobRecord) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE jobtype = $1
              AND id <> $2
              AND (timestamp_claimed > 0
                   OR "timestamp" < $3
                   OR ("timestamp" = $3 AND id < $2))
            "#,
        )
        .bind(&job.jobtype)
        .bind(job.id)
        .bind(job.timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn delete_jobs_for_remote_id(&self, remote_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE remote_id = $1")
            .bind(remote_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DatasetStore for PostgresStore {
    async fn insert_dataset(&self, record: &DatasetRecord) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO datasets ({DATASET_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (key) DO NOTHING
            "#
        ))
        .bind(&record.key)
        .bind(&record.query)
        .bind(Json(&record.parameters))
        .bind(&record.result_file)
        .bind(&record.creator)
        .bind(&record.status)
        .bind(&record.dataset_type)
        .bind(record.timestamp)
        .bind(record.is_finished)
        .bind(record.is_private)
        .bind(&record.software_version)
        .bind(&record.software_file)
        .bind(record.num_rows)
        .bind(record.progress)
        .bind(&record.key_parent)
        .bind(record.job)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestrationError::DuplicateDataset(record.key.clone()));
        }
        Ok(())
    }

    async fn dataset(&self, key: &str) -> Result<Option<DatasetRecord>> {
        let row = sqlx::query(&format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE key = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_dataset_row).transpose()
    }

    async fn update_dataset(&self, key: &str, patch: &DatasetPatch) -> Result<u64> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::new("UPDATE datasets SET ");
        let mut fields = builder.separated(", ");
        if let Some(query) = &patch.query {
            fields.push("query = ").push_bind_unseparated(query);
        }
        if let Some(parameters) = &patch.parameters {
            fields.push("parameters = ").push_bind_unseparated(Json(parameters));
        }
        if let Some(result_file) = &patch.result_file {
            fields.push("result_file = ").push_bind_unseparated(result_file);
        }
        if let Some(status) = &patch.status {
            fields.push("status = ").push_bind_unseparated(status);
        }
        if let Some(timestamp) = patch.timestamp {
            fields.push("\"timestamp\" = ").push_bind_unseparated(timestamp);
        }
        if let Some(is_finished) = patch.is_finished {
            fields.push("is_finished = ").push_bind_unseparated(is_finished);
        }
        if let Some(is_private) = patch.is_private {
            fields.push("is_private = ").push_bind_unseparated(is_private);
        }
        if let Some(version) = &patch.software_version {
            fields.push("software_version = ").push_bind_unseparated(version);
        }
        if let Some(file) = &patch.software_file {
            fields.push("software_file = ").push_bind_unseparated(file);
        }
        if let Some(num_rows) = patch.num_rows {
            fields.push("num_rows = ").push_bind_unseparated(num_rows);
        }
        if let Some(progress) = patch.progress {
            fields.push("progress = ").push_bind_unseparated(progress);
        }
        if let Some(key_parent) = &patch.key_parent {
            fields.push("key_parent = ").push_bind_unseparated(key_parent);
        }
        if let Some(job) = patch.job {
            fields.push("job = ").push_bind_unseparated(job);
        }
        builder.push(" WHERE key = ").push_bind(key);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_dataset(&self, key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM datasets WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn child_datasets(&self, key: &str) -> Result<Vec<DatasetRecord>> {
        let rows = sqlx::query(&format!(
            r#"SELECT {DATASET_COLUMNS} FROM datasets WHERE key_parent = $1 ORDER BY "timestamp", key"#
        ))
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_dataset_row).collect()
    }

    async fn dataset_owners(&self, key: &str) -> Result<Vec<(String, OwnerRole)>> {
        let rows = sqlx::query("SELECT name, role FROM datasets_owners WHERE key = $1 ORDER BY name")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, OwnerRole)> {
                let name: String = row.try_get("name")?;
                let role: String = row.try_get("role")?;
                Ok((name, role.parse()?))
            })
            .collect()
    }

    async fn upsert_owner(&self, key: &str, name: &str, role: OwnerRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO datasets_owners (key, name, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, name) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(key)
        .bind(name)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_owner(&self, key: &str, name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM datasets_owners WHERE key = $1 AND name = $2")
            .bind(key)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_all_owners(&self, key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM datasets_owners WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (name, tags, is_admin)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET tags = EXCLUDED.tags, is_admin = EXCLUDED.is_admin
            "#,
        )
        .bind(&user.name)
        .bind(Json(&user.tags))
        .bind(user.is_admin)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user(&self, name: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT name, tags, is_admin FROM users WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_user_row).transpose()
    }

    async fn users_with_tags(&self, tags: &[String]) -> Result<Vec<User>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT name, tags, is_admin FROM users WHERE tags ?| $1 ORDER BY name",
        )
        .bind(tags)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_user_row).collect()
    }

    async fn add_favourite(&self, user: &str, key: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO users_favourites (name, key) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn favourites_of(&self, user: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM users_favourites WHERE name = $1 ORDER BY key")
            .bind(user)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn remove_favourites(&self, key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM users_favourites WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
