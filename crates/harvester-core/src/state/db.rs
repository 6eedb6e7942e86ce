//! SQLite-backed state store: connection, schema and shared helpers.
//!
//! Writes from workers go through the batched [`WriteBuffer`]; reads and
//! the few operator-level operations (reset, recovery, retry) go straight
//! to the pool inside their own transactions.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::buffer::WriteBuffer;
use super::{ImageKey, StoreError};

const MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default write-buffer thresholds when the caller does not pick any.
pub const DEFAULT_FLUSH_ROWS: usize = 64;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        config_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        finished_at INTEGER,
        pages_total INTEGER NOT NULL DEFAULT 0,
        pages_completed INTEGER NOT NULL DEFAULT 0,
        pages_with_failures INTEGER NOT NULL DEFAULT 0,
        pages_no_images INTEGER NOT NULL DEFAULT 0,
        pages_failed INTEGER NOT NULL DEFAULT 0,
        images_total INTEGER NOT NULL DEFAULT 0,
        images_completed INTEGER NOT NULL DEFAULT 0,
        images_failed INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pages (
        job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
        page_num INTEGER NOT NULL,
        state TEXT NOT NULL,
        source_url TEXT NOT NULL,
        source_id TEXT NOT NULL,
        upper_bound INTEGER,
        seed_width INTEGER,
        extension TEXT,
        index_base INTEGER,
        image_count INTEGER,
        meta_json TEXT,
        engine TEXT,
        failure_reason TEXT,
        started_at INTEGER,
        updated_at INTEGER NOT NULL,
        finished_at INTEGER,
        PRIMARY KEY (job_id, page_num)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS images (
        job_id TEXT NOT NULL,
        page_num INTEGER NOT NULL,
        image_index INTEGER NOT NULL,
        url TEXT NOT NULL,
        local_path TEXT NOT NULL,
        state TEXT NOT NULL,
        http_status INTEGER,
        sha256 TEXT,
        size_bytes INTEGER,
        retries INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        finished_at INTEGER,
        PRIMARY KEY (job_id, page_num, image_index),
        FOREIGN KEY (job_id, page_num) REFERENCES pages(job_id, page_num) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_images_state ON images(job_id, state)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
        page_num INTEGER,
        image_index INTEGER,
        kind TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_job ON events(job_id, id)",
];

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the harvester state database. Cheap to clone; clones share the
/// pool, the write buffer and the image claim set.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) pool: Pool<Sqlite>,
    pub(crate) buffer: Arc<WriteBuffer>,
    pub(crate) claims: Arc<Mutex<HashSet<ImageKey>>>,
}

impl StateStore {
    fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            buffer: Arc::new(WriteBuffer::new(DEFAULT_FLUSH_ROWS, DEFAULT_FLUSH_INTERVAL)),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open (or create) the database at `path` in WAL mode with foreign keys on.
    /// Creates parent directories if needed.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::from_str(&path_to_sqlite_uri(path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database on a single connection (nothing survives the process).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Replace the write-buffer thresholds. Call before sharing the store.
    pub fn with_flush_policy(mut self, flush_rows: usize, flush_interval: Duration) -> Self {
        self.buffer = Arc::new(WriteBuffer::new(flush_rows, flush_interval));
        self
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close the pool after flushing buffered writes.
    pub async fn close(&self) -> Result<(), StoreError> {
        let res = self.flush().await;
        self.pool.close().await;
        res
    }
}

/// Current time as Unix seconds (for DB timestamps).
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub(crate) fn to_u32(column: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

pub(crate) fn opt_u32(column: &'static str, value: Option<i64>) -> Result<Option<u32>, StoreError> {
    value.map(|v| to_u32(column, v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_escapes_special_characters() {
        assert_eq!(
            path_to_sqlite_uri(Path::new("/tmp/my dir/state#1.sqlite3")),
            "sqlite:///tmp/my%20dir/state%231.sqlite3"
        );
    }

    #[tokio::test]
    async fn open_at_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.sqlite3");
        let store = StateStore::open_at(&path).await.unwrap();
        assert!(path.exists());
        store.close().await.unwrap();

        // Reopening runs the idempotent schema again.
        let again = StateStore::open_at(&path).await.unwrap();
        again.close().await.unwrap();
    }
}
