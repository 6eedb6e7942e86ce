//! Batched write buffer.
//!
//! Worker transitions are queued in memory and applied to SQLite in a single
//! transaction once `flush_rows` operations are pending or `flush_interval`
//! has passed since the last flush, whichever comes first. Anything still
//! queued when the process dies is lost; resume only reads flushed rows.
//! A batch leaves the buffer for good only once its transaction commits; a
//! cancelled or failed flush puts it back in front of newer operations.
//!
//! Forward-only state guards live in the SQL `WHERE` clauses, so a stale or
//! duplicated operation can never move a row backwards.

use sqlx::{Sqlite, Transaction};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::db::{unix_timestamp, StateStore};
use super::{ImageKey, ImageResult, NewEvent, NewImage, PageExpansion, PageState, StoreError};

/// One buffered state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create the page row if missing and move it to `running`.
    PageStarted {
        job_id: String,
        page_num: u32,
        source_url: String,
        source_id: String,
    },
    /// Record the page's expansion (first time only) and insert its image rows.
    PageExpanded {
        job_id: String,
        page_num: u32,
        expansion: PageExpansion,
        meta_json: String,
        engine: String,
        images: Vec<NewImage>,
    },
    /// Move a page to a terminal state.
    PageFinished {
        job_id: String,
        page_num: u32,
        state: PageState,
        failure_reason: Option<String>,
        meta_json: Option<String>,
        engine: Option<String>,
    },
    ImageRunning(ImageKey),
    ImageFinished {
        key: ImageKey,
        result: ImageResult,
    },
    Event(NewEvent),
}

struct Pending {
    ops: Vec<WriteOp>,
    last_flush: Instant,
}

pub(crate) struct WriteBuffer {
    pending: Mutex<Pending>,
    /// Serializes flushes so batches commit in queue order.
    flush_lock: tokio::sync::Mutex<()>,
    poisoned: Mutex<Option<String>>,
    flush_rows: usize,
    flush_interval: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WriteBuffer {
    pub(crate) fn new(flush_rows: usize, flush_interval: Duration) -> Self {
        Self {
            pending: Mutex::new(Pending {
                ops: Vec::new(),
                last_flush: Instant::now(),
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            poisoned: Mutex::new(None),
            flush_rows: flush_rows.max(1),
            flush_interval,
        }
    }

    pub(crate) fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    fn check(&self) -> Result<(), StoreError> {
        match lock(&self.poisoned).as_ref() {
            Some(msg) => Err(StoreError::Poisoned(msg.clone())),
            None => Ok(()),
        }
    }

    /// Queue `ops`; returns true when a flush is due.
    fn push(&self, ops: impl IntoIterator<Item = WriteOp>) -> Result<bool, StoreError> {
        self.check()?;
        let mut p = lock(&self.pending);
        p.ops.extend(ops);
        Ok(p.ops.len() >= self.flush_rows || p.last_flush.elapsed() >= self.flush_interval)
    }

    fn take(&self) -> Batch<'_> {
        let mut p = lock(&self.pending);
        p.last_flush = Instant::now();
        Batch {
            buffer: self,
            ops: std::mem::take(&mut p.ops),
            committed: false,
        }
    }

    /// Put an uncommitted batch back ahead of anything queued since.
    fn restore(&self, mut ops: Vec<WriteOp>) {
        let mut p = lock(&self.pending);
        ops.append(&mut p.ops);
        p.ops = ops;
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.pending).ops.len()
    }

    fn poison(&self, msg: String) {
        let mut slot = lock(&self.poisoned);
        if slot.is_none() {
            *slot = Some(msg);
        }
    }
}

/// Operations taken for one flush. Dropped without [`Batch::commit`], they
/// return to the buffer.
struct Batch<'a> {
    buffer: &'a WriteBuffer,
    ops: Vec<WriteOp>,
    committed: bool,
}

impl Batch<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.ops.is_empty() {
            self.buffer.restore(std::mem::take(&mut self.ops));
        }
    }
}

/// Handle to the background interval flusher.
pub struct Flusher {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Flusher {
    /// Let any flush in progress finish, then end the task.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "background flusher panicked");
        }
    }
}

impl StateStore {
    /// Queue one transition, flushing if a threshold is reached.
    pub async fn enqueue(&self, op: WriteOp) -> Result<(), StoreError> {
        self.enqueue_all([op]).await
    }

    /// Queue several transitions that must land in the same batch.
    pub async fn enqueue_all(&self, ops: impl IntoIterator<Item = WriteOp>) -> Result<(), StoreError> {
        if self.buffer.push(ops)? {
            self.flush().await?;
        }
        Ok(())
    }

    /// Append an event (buffered).
    pub async fn record_event(&self, event: NewEvent) -> Result<(), StoreError> {
        self.enqueue(WriteOp::Event(event)).await
    }

    /// Number of operations waiting for the next flush.
    pub fn buffered_ops(&self) -> usize {
        self.buffer.len()
    }

    /// Apply every queued operation in one transaction. A failure disables the
    /// buffer: later writes return [`StoreError::Poisoned`].
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.buffer.flush_lock.lock().await;
        self.buffer.check()?;
        let batch = self.buffer.take();
        if batch.ops.is_empty() {
            return Ok(());
        }
        let count = batch.ops.len();
        let res = self.apply_batch(&batch.ops).await;
        match res {
            Ok(()) => {
                batch.commit();
                tracing::trace!(ops = count, "state buffer flushed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(ops = count, error = %e, "state buffer flush failed");
                self.buffer.poison(e.to_string());
                Err(e)
            }
        }
    }

    /// Background task flushing on the interval threshold. Stop it with
    /// [`Flusher::stop`], then call [`StateStore::flush`] for the remainder.
    pub fn spawn_flusher(&self) -> Flusher {
        let store = self.clone();
        let period = self.buffer.flush_interval().max(Duration::from_millis(10));
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if let Err(e) = store.flush().await {
                    tracing::warn!(error = %e, "background flush stopped");
                    break;
                }
            }
        });
        Flusher { stop, handle }
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        for op in ops {
            apply_op(&mut tx, op, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_op(tx: &mut Transaction<'_, Sqlite>, op: &WriteOp, now: i64) -> Result<(), StoreError> {
    match op {
        WriteOp::PageStarted {
            job_id,
            page_num,
            source_url,
            source_id,
        } => {
            sqlx::query(
                r#"
                INSERT INTO pages (job_id, page_num, state, source_url, source_id, updated_at)
                VALUES (?1, ?2, 'pending', ?3, ?4, ?5)
                ON CONFLICT(job_id, page_num) DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(i64::from(*page_num))
            .bind(source_url)
            .bind(source_id)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            sqlx::query(
                r#"
                UPDATE pages
                SET state = 'running',
                    started_at = COALESCE(started_at, ?1),
                    updated_at = ?1
                WHERE job_id = ?2 AND page_num = ?3 AND state IN ('pending', 'running')
                "#,
            )
            .bind(now)
            .bind(job_id)
            .bind(i64::from(*page_num))
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::PageExpanded {
            job_id,
            page_num,
            expansion,
            meta_json,
            engine,
            images,
        } => {
            sqlx::query(
                r#"
                UPDATE pages
                SET upper_bound = ?1,
                    seed_width = ?2,
                    extension = ?3,
                    index_base = ?4,
                    image_count = ?1,
                    meta_json = ?5,
                    updated_at = ?6,
                    engine = ?9
                WHERE job_id = ?7 AND page_num = ?8 AND upper_bound IS NULL
                "#,
            )
            .bind(i64::from(expansion.upper_bound))
            .bind(i64::from(expansion.seed_width))
            .bind(&expansion.extension)
            .bind(i64::from(expansion.index_base))
            .bind(meta_json)
            .bind(now)
            .bind(job_id)
            .bind(i64::from(*page_num))
            .bind(engine)
            .execute(&mut **tx)
            .await?;
            for img in images {
                sqlx::query(
                    r#"
                    INSERT INTO images (
                        job_id, page_num, image_index, url, local_path, state,
                        retries, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)
                    ON CONFLICT(job_id, page_num, image_index) DO NOTHING
                    "#,
                )
                .bind(job_id)
                .bind(i64::from(*page_num))
                .bind(i64::from(img.image_index))
                .bind(&img.url)
                .bind(&img.local_path)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
        }
        WriteOp::PageFinished {
            job_id,
            page_num,
            state,
            failure_reason,
            meta_json,
            engine,
        } => {
            sqlx::query(
                r#"
                UPDATE pages
                SET state = ?1,
                    failure_reason = ?2,
                    meta_json = COALESCE(?3, meta_json),
                    engine = COALESCE(?7, engine),
                    image_count = COALESCE(image_count, 0),
                    updated_at = ?4,
                    finished_at = ?4
                WHERE job_id = ?5 AND page_num = ?6 AND state IN ('pending', 'running')
                "#,
            )
            .bind(state.as_str())
            .bind(failure_reason)
            .bind(meta_json)
            .bind(now)
            .bind(job_id)
            .bind(i64::from(*page_num))
            .bind(engine)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::ImageRunning(key) => {
            sqlx::query(
                r#"
                UPDATE images
                SET state = 'running', updated_at = ?1
                WHERE job_id = ?2 AND page_num = ?3 AND image_index = ?4 AND state = 'pending'
                "#,
            )
            .bind(now)
            .bind(&key.job_id)
            .bind(i64::from(key.page_num))
            .bind(i64::from(key.image_index))
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::ImageFinished { key, result } => {
            sqlx::query(
                r#"
                UPDATE images
                SET state = ?1,
                    http_status = ?2,
                    sha256 = ?3,
                    size_bytes = ?4,
                    retries = ?5,
                    error = ?6,
                    updated_at = ?7,
                    finished_at = ?7
                WHERE job_id = ?8 AND page_num = ?9 AND image_index = ?10
                  AND state IN ('pending', 'running')
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
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::Event(ev) => {
            sqlx::query(
                r#"
                INSERT INTO events (job_id, page_num, image_index, kind, detail, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&ev.job_id)
            .bind(ev.page_num.map(i64::from))
            .bind(ev.image_index.map(i64::from))
            .bind(ev.kind)
            .bind(&ev.detail)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}
