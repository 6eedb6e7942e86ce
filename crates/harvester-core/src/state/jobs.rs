//! Job rows: create-or-open, state transitions, reset and summary.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::db::{to_u32, unix_timestamp, StateStore};
use super::{JobRecord, JobState, JobSummary, StoreError};

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        state: state.parse()?,
        config_json: row.try_get("config_json")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
        summary: JobSummary {
            pages_total: to_u32("pages_total", row.try_get("pages_total")?)?,
            pages_completed: to_u32("pages_completed", row.try_get("pages_completed")?)?,
            pages_with_failures: to_u32("pages_with_failures", row.try_get("pages_with_failures")?)?,
            pages_no_images: to_u32("pages_no_images", row.try_get("pages_no_images")?)?,
            pages_failed: to_u32("pages_failed", row.try_get("pages_failed")?)?,
            images_total: to_u32("images_total", row.try_get("images_total")?)?,
            images_completed: to_u32("images_completed", row.try_get("images_completed")?)?,
            images_failed: to_u32("images_failed", row.try_get("images_failed")?)?,
        },
    })
}

/// Outcome of [`StateStore::open_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedJob {
    pub record: JobRecord,
    /// True when this call inserted the row.
    pub created: bool,
}

impl StateStore {
    /// Insert the job row in `pending` if it does not exist and return it.
    pub async fn open_job(&self, job_id: &str, config_json: &str) -> Result<OpenedJob, StoreError> {
        let now = unix_timestamp();
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, state, config_json, created_at, updated_at)
            VALUES (?1, 'pending', ?2, ?3, ?3)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(config_json)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let record = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        Ok(OpenedJob {
            record,
            created: inserted == 1,
        })
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Most recently created job id.
    pub async fn latest_job_id(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT job_id FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("job_id")).transpose()?)
    }

    /// Move the job to `next` if the state machine allows it. Flushes the
    /// write buffer first so the job row never runs ahead of its children.
    /// Returns false (and changes nothing) for a disallowed transition.
    pub async fn set_job_state(&self, job_id: &str, next: JobState) -> Result<bool, StoreError> {
        self.flush().await?;
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT state FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        let current: JobState = row.try_get::<String, _>("state")?.parse()?;
        if !current.can_transition_to(next) {
            tx.commit().await?;
            return Ok(false);
        }
        let finished_at = next.is_terminal().then_some(now);
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1,
                updated_at = ?2,
                finished_at = ?3
            WHERE job_id = ?4
            "#,
        )
        .bind(next.as_str())
        .bind(now)
        .bind(finished_at)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Move the job to `failed` and append a `job_failed` event in one
    /// transaction that bypasses the write buffer, so it still lands after a
    /// failed flush. Buffered work is flushed first when possible.
    pub async fn fail_job(&self, job_id: &str, detail: &str) -> Result<bool, StoreError> {
        if let Err(e) = self.flush().await {
            tracing::warn!(job_id, error = %e, "buffered writes of failing job not flushed");
        }
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            r#"
            UPDATE jobs SET state = 'failed', updated_at = ?1, finished_at = ?1
            WHERE job_id = ?2 AND state IN ('pending', 'running')
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO events (job_id, page_num, image_index, kind, detail, created_at)
            VALUES (?1, NULL, NULL, 'job_failed', ?2, ?3)
            "#,
        )
        .bind(job_id)
        .bind(detail)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Explicit reset: delete every page, image and event of the job in one
    /// transaction and put the job row back to `pending`, keeping its identity.
    pub async fn reset_job(&self, job_id: &str, config_json: &str) -> Result<(), StoreError> {
        self.flush().await?;
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM images WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pages WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM events WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                config_json = ?1,
                updated_at = ?2,
                finished_at = NULL,
                pages_total = 0, pages_completed = 0, pages_with_failures = 0,
                pages_no_images = 0, pages_failed = 0,
                images_total = 0, images_completed = 0, images_failed = 0
            WHERE job_id = ?3
            "#,
        )
        .bind(config_json)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        tx.commit().await?;

        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        claims.retain(|k| k.job_id != job_id);
        Ok(())
    }

    /// Count pages and images by state from flushed rows.
    pub async fn compute_summary(&self, job_id: &str) -> Result<JobSummary, StoreError> {
        let mut s = JobSummary::default();
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM pages WHERE job_id = ?1 GROUP BY state")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = to_u32("count", row.try_get("n")?)?;
            s.pages_total += n;
            match state.as_str() {
                "completed" => s.pages_completed += n,
                "completed_with_failures" => s.pages_with_failures += n,
                "no_images" => s.pages_no_images += n,
                "failed_fetch" => s.pages_failed += n,
                _ => {}
            }
        }
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM images WHERE job_id = ?1 GROUP BY state")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = to_u32("count", row.try_get("n")?)?;
            s.images_total += n;
            match state.as_str() {
                "completed" => s.images_completed += n,
                "failed" => s.images_failed += n,
                _ => {}
            }
        }
        Ok(s)
    }

    /// Recompute and store the job's summary counters. Flushes first.
    pub async fn refresh_job_summary(&self, job_id: &str) -> Result<JobSummary, StoreError> {
        self.flush().await?;
        let s = self.compute_summary(job_id).await?;
        sqlx::query(
            r#"
            UPDATE jobs
            SET pages_total = ?1, pages_completed = ?2, pages_with_failures = ?3,
                pages_no_images = ?4, pages_failed = ?5,
                images_total = ?6, images_completed = ?7, images_failed = ?8,
                updated_at = ?9
            WHERE job_id = ?10
            "#,
        )
        .bind(i64::from(s.pages_total))
        .bind(i64::from(s.pages_completed))
        .bind(i64::from(s.pages_with_failures))
        .bind(i64::from(s.pages_no_images))
        .bind(i64::from(s.pages_failed))
        .bind(i64::from(s.images_total))
        .bind(i64::from(s.images_completed))
        .bind(i64::from(s.images_failed))
        .bind(unix_timestamp())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(s)
    }
}
