//! Page rows: reads, crash recovery and frontier reconstruction.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

use super::db::{opt_u32, to_u32, unix_timestamp, StateStore};
use super::{Frontier, PageExpansion, PageRecord, PageState, StoreError};

pub(crate) fn page_from_row(row: &SqliteRow) -> Result<PageRecord, StoreError> {
    let state: String = row.try_get("state")?;
    let upper_bound = opt_u32("upper_bound", row.try_get("upper_bound")?)?;
    let expansion = match upper_bound {
        Some(upper_bound) => Some(PageExpansion {
            upper_bound,
            seed_width: opt_u32("seed_width", row.try_get("seed_width")?)?.unwrap_or(0),
            extension: row
                .try_get::<Option<String>, _>("extension")?
                .unwrap_or_default(),
            index_base: opt_u32("index_base", row.try_get("index_base")?)?.unwrap_or(1),
        }),
        None => None,
    };
    Ok(PageRecord {
        job_id: row.try_get("job_id")?,
        page_num: to_u32("page_num", row.try_get("page_num")?)?,
        state: state.parse()?,
        source_url: row.try_get("source_url")?,
        source_id: row.try_get("source_id")?,
        expansion,
        image_count: opt_u32("image_count", row.try_get("image_count")?)?,
        meta_json: row.try_get("meta_json")?,
        engine: row.try_get("engine")?,
        failure_reason: row.try_get("failure_reason")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

/// Rows returned to `pending` by [`StateStore::recover_running`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovered {
    pub pages: u64,
    pub images: u64,
}

impl StateStore {
    pub async fn get_page(&self, job_id: &str, page_num: u32) -> Result<Option<PageRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM pages WHERE job_id = ?1 AND page_num = ?2")
            .bind(job_id)
            .bind(i64::from(page_num))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(page_from_row).transpose()
    }

    /// All pages of a job in page order.
    pub async fn list_pages(&self, job_id: &str) -> Result<Vec<PageRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM pages WHERE job_id = ?1 ORDER BY page_num ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(page_from_row).collect()
    }

    /// Page counts keyed by state string.
    pub async fn page_state_counts(&self, job_id: &str) -> Result<BTreeMap<String, u32>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM pages WHERE job_id = ?1 GROUP BY state")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.try_get("state")?, to_u32("count", row.try_get("n")?)?);
        }
        Ok(out)
    }

    /// Return pages and images left in `running` by a crashed or stopped run
    /// to `pending`. Call before [`StateStore::load_frontier`].
    pub async fn recover_running(&self, job_id: &str) -> Result<Recovered, StoreError> {
        self.flush().await?;
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        let pages = sqlx::query(
            r#"
            UPDATE pages SET state = 'pending', updated_at = ?1
            WHERE job_id = ?2 AND state = 'running'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let images = sqlx::query(
            r#"
            UPDATE images SET state = 'pending', updated_at = ?1
            WHERE job_id = ?2 AND state = 'running'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        claims.retain(|k| k.job_id != job_id);
        Ok(Recovered { pages, images })
    }

    /// Rebuild the resume frontier from durable rows: terminal pages to skip
    /// and open pages to continue.
    pub async fn load_frontier(&self, job_id: &str) -> Result<Frontier, StoreError> {
        self.flush().await?;
        let mut frontier = Frontier::default();
        for page in self.list_pages(job_id).await? {
            frontier.max_page_num = Some(page.page_num);
            if page.state.is_terminal() {
                frontier.terminal.push((page.page_num, page.state));
            } else {
                frontier.open_pages.push(page);
            }
        }
        Ok(frontier)
    }

    /// Re-derive a terminal page's state from its images after failed images
    /// were retried. Only moves between `completed_with_failures`,
    /// `failed_fetch` and `completed`, and only when no image is left open.
    pub async fn refresh_page_after_retry(
        &self,
        job_id: &str,
        page_num: u32,
    ) -> Result<Option<PageState>, StoreError> {
        self.flush().await?;
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END) AS ok,
                SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END) AS failed,
                SUM(CASE WHEN state IN ('pending', 'running') THEN 1 ELSE 0 END) AS open
            FROM images WHERE job_id = ?1 AND page_num = ?2
            "#,
        )
        .bind(job_id)
        .bind(i64::from(page_num))
        .fetch_one(&self.pool)
        .await?;
        let ok: i64 = row.try_get::<Option<i64>, _>("ok")?.unwrap_or(0);
        let failed: i64 = row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0);
        let open: i64 = row.try_get::<Option<i64>, _>("open")?.unwrap_or(0);
        if open > 0 || ok == 0 {
            return Ok(None);
        }
        let next = if failed == 0 {
            PageState::Completed
        } else {
            PageState::CompletedWithFailures
        };
        let changed = sqlx::query(
            r#"
            UPDATE pages
            SET state = ?1, failure_reason = NULL, updated_at = ?2
            WHERE job_id = ?3 AND page_num = ?4
              AND state IN ('completed_with_failures', 'failed_fetch')
              AND state <> ?1
            "#,
        )
        .bind(next.as_str())
        .bind(unix_timestamp())
        .bind(job_id)
        .bind(i64::from(page_num))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok((changed > 0).then_some(next))
    }
}
