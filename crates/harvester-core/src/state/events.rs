//! Event log reads. Events are only ever appended (through the write buffer).

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::db::{opt_u32, StateStore};
use super::{EventRecord, StoreError};

fn event_from_row(row: &SqliteRow) -> Result<EventRecord, StoreError> {
    Ok(EventRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        page_num: opt_u32("page_num", row.try_get("page_num")?)?,
        image_index: opt_u32("image_index", row.try_get("image_index")?)?,
        kind: row.try_get("kind")?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

impl StateStore {
    /// Newest `limit` events of a job, newest first.
    pub async fn recent_events(&self, job_id: &str, limit: u32) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2")
            .bind(job_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Every event of a job in append order.
    pub async fn events(&self, job_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE job_id = ?1 ORDER BY id ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Events of one kind, in append order.
    pub async fn events_of_kind(&self, job_id: &str, kind: &str) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE job_id = ?1 AND kind = ?2 ORDER BY id ASC")
            .bind(job_id)
            .bind(kind)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }
}
