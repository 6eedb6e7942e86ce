//! Image rows: exclusive claims, reads, and operator retries.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

use super::buffer::WriteOp;
use super::db::{opt_u32, to_u32, unix_timestamp, StateStore};
use super::{ImageKey, ImageRecord, ImageResult, StoreError};

pub(crate) fn image_from_row(row: &SqliteRow) -> Result<ImageRecord, StoreError> {
    let state: String = row.try_get("state")?;
    let http_status = opt_u32("http_status", row.try_get("http_status")?)?
        .map(|v| u16::try_from(v).unwrap_or(0));
    let size_bytes: Option<i64> = row.try_get("size_bytes")?;
    Ok(ImageRecord {
        key: ImageKey {
            job_id: row.try_get("job_id")?,
            page_num: to_u32("page_num", row.try_get("page_num")?)?,
            image_index: to_u32("image_index", row.try_get("image_index")?)?,
        },
        url: row.try_get("url")?,
        local_path: row.try_get("local_path")?,
        state: state.parse()?,
        http_status,
        sha256: row.try_get("sha256")?,
        size_bytes: size_bytes.map(|n| n.max(0) as u64),
        retries: to_u32("retries", row.try_get("retries")?)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

impl StateStore {
    /// Claim an image for one worker: `pending → running`. Returns false if
    /// another worker already holds it. The claim is exclusive in-process at
    /// once; the `running` row state follows with the next flush.
    pub async fn claim_image(&self, key: &ImageKey) -> Result<bool, StoreError> {
        let newly = {
            let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
            claims.insert(key.clone())
        };
        if !newly {
            return Ok(false);
        }
        if let Err(e) = self.enqueue(WriteOp::ImageRunning(key.clone())).await {
            self.release_claim(key);
            return Err(e);
        }
        Ok(true)
    }

    fn release_claim(&self, key: &ImageKey) {
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        claims.remove(key);
    }

    /// Record an image's terminal result and release its claim.
    pub async fn finish_image(&self, key: &ImageKey, result: ImageResult) -> Result<(), StoreError> {
        let res = self
            .enqueue(WriteOp::ImageFinished {
                key: key.clone(),
                result,
            })
            .await;
        self.release_claim(key);
        res
    }

    /// Images of one page in index order.
    pub async fn page_images(&self, job_id: &str, page_num: u32) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM images WHERE job_id = ?1 AND page_num = ?2 ORDER BY image_index ASC",
        )
        .bind(job_id)
        .bind(i64::from(page_num))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

    /// Failed images of a job in (page, index) order; `limit` of `None` means all.
    pub async fn failed_images(&self, job_id: &str, limit: Option<u32>) -> Result<Vec<ImageRecord>, StoreError> {
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT * FROM images
            WHERE job_id = ?1 AND state = 'failed'
            ORDER BY page_num ASC, image_index ASC
            LIMIT ?2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

    /// Image counts keyed by state string.
    pub async fn image_state_counts(&self, job_id: &str) -> Result<BTreeMap<String, u32>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM images WHERE job_id = ?1 GROUP BY state")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.try_get("state")?, to_u32("count", row.try_get("n")?)?);
        }
        Ok(out)
    }

    /// Store the outcome of an operator retry of a `failed` image. This is the
    /// only write that moves an image out of `failed`. Returns false if the
    /// image was no longer failed.
    pub async fn record_retry_result(&self, key: &ImageKey, result: &ImageResult) -> Result<bool, StoreError> {
        self.flush().await?;
        let now = unix_timestamp();
        let changed = sqlx::query(
            r#"
            UPDATE images
            SET state = ?1,
                http_status = COALESCE(?2, http_status),
                sha256 = ?3,
                size_bytes = ?4,
                retries = retries + ?5,
                error = ?6,
                updated_at = ?7,
                finished_at = ?7
            WHERE job_id = ?8 AND page_num = ?9 AND image_index = ?10 AND state = 'failed'
            "#,
        )
        .bind(result.state.as_str())
        .bind(result.http_status.map(i64::from))
        .bind(&result.sha256)
        .bind(result.size_bytes.map(|n| n as i64))
        .bind(i64::from(result.retries))
        .bind(&result.error)
        .bind(now)
        .bind(&key.job_id)
        .bind(i64::from(key.page_num))
        .bind(i64::from(key.image_index))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed > 0)
    }
}
