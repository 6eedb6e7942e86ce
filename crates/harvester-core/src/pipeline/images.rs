//! Shared image worker pool.
//!
//! `image_workers` tasks live for the whole run and take [`ImageTask`]s from
//! one bounded queue, so every page shares the same workers and the same rate
//! limiter. Each task claims its image (`pending → running`) before any I/O.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::checksum;
use crate::downloader::FetchOutcome;
use crate::state::{ImageKey, ImageResult, NewEvent, StoreError, WriteOp};
use crate::storage;

use super::Shared;

pub(crate) struct ImageTask {
    pub(crate) key: ImageKey,
    pub(crate) url: String,
    pub(crate) dest: PathBuf,
    /// Raise `abort` when this image fails.
    pub(crate) abort_on_failure: bool,
    /// Page-wide flag: once set, the page's remaining tasks are skipped.
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) reply: mpsc::UnboundedSender<ImageReply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImageDone {
    Completed,
    Failed,
    /// Not attempted (stop, page abort, or already claimed).
    Skipped,
}

pub(crate) struct ImageReply {
    pub(crate) done: Result<ImageDone, StoreError>,
}

pub(crate) struct ImagePool {
    tx: mpsc::Sender<ImageTask>,
    workers: JoinSet<()>,
}

impl ImagePool {
    pub(crate) fn start(shared: Arc<Shared>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<ImageTask>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            set.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(task) = next else {
                        break;
                    };
                    handle(&shared, task).await;
                }
                tracing::trace!(worker, "image worker exiting");
            });
        }
        Self { tx, workers: set }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<ImageTask> {
        self.tx.clone()
    }

    /// Close the queue and wait for every worker to drain it.
    pub(crate) async fn shutdown(self) {
        let Self { tx, mut workers } = self;
        drop(tx);
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "image worker panicked");
            }
        }
    }
}

async fn handle(shared: &Shared, task: ImageTask) {
    let done = download_one(shared, &task).await;
    if task.abort_on_failure && matches!(done, Ok(ImageDone::Failed)) {
        task.abort.store(true, Ordering::SeqCst);
    }
    if let Err(e) = &done {
        shared.halt();
        tracing::error!(job_id = %task.key.job_id, error = %e, "image state write failed");
    }
    // The page may have returned early on an error; nothing left to tell.
    let _ = task.reply.send(ImageReply { done });
}

async fn download_one(shared: &Shared, task: &ImageTask) -> Result<ImageDone, StoreError> {
    if shared.should_stop() || task.abort.load(Ordering::SeqCst) {
        return Ok(ImageDone::Skipped);
    }
    let key = &task.key;
    if !shared.store.claim_image(key).await? {
        tracing::debug!(page_num = key.page_num, index = key.image_index, "image already claimed");
        return Ok(ImageDone::Skipped);
    }

    if let Some(size) = storage::existing_nonempty(&task.dest) {
        match hash_file(task.dest.clone()).await {
            Ok(sha256) => {
                tracing::debug!(
                    page_num = key.page_num,
                    index = key.image_index,
                    size,
                    "image already on disk"
                );
                shared
                    .store
                    .finish_image(key, ImageResult::completed(None, sha256, size, 0))
                    .await?;
                return Ok(ImageDone::Completed);
            }
            Err(e) => {
                tracing::warn!(path = %task.dest.display(), error = %e, "cannot hash existing file, downloading");
            }
        }
    }

    let cfg = &shared.config;
    let report = shared
        .downloader
        .fetch_image(
            shared.images.as_ref(),
            &task.url,
            &task.dest,
            cfg.image_retries,
            cfg.image_timeout(),
        )
        .await;
    let retries = report.retries_used();

    let mut events = Vec::new();
    if report.throttle_events > 0 {
        events.push(NewEvent::image(
            key,
            "rate_limited",
            format!("{} throttled responses for {}", report.throttle_events, task.url),
        ));
    }

    let (result, done) = match report.outcome {
        FetchOutcome::Success(stored) => {
            tracing::debug!(
                page_num = key.page_num,
                index = key.image_index,
                bytes = stored.size_bytes,
                "image downloaded"
            );
            (
                ImageResult::completed(Some(stored.status), stored.sha256, stored.size_bytes, retries),
                ImageDone::Completed,
            )
        }
        FetchOutcome::Retryable { reason } => {
            events.push(NewEvent::image(
                key,
                "retry_exhausted",
                format!("{}: gave up after {} attempts", task.url, report.attempts),
            ));
            events.push(failed_event(key, &task.url, &reason));
            (ImageResult::failed(report.last_status, retries, reason), ImageDone::Failed)
        }
        FetchOutcome::Fatal { reason } => {
            events.push(failed_event(key, &task.url, &reason));
            (ImageResult::failed(report.last_status, retries, reason), ImageDone::Failed)
        }
    };
    if done == ImageDone::Failed {
        tracing::warn!(page_num = key.page_num, index = key.image_index, url = %task.url, "image failed");
    }

    shared.store.finish_image(key, result).await?;
    if !events.is_empty() {
        shared
            .store
            .enqueue_all(events.into_iter().map(WriteOp::Event))
            .await?;
    }
    Ok(done)
}

fn failed_event(key: &ImageKey, url: &str, reason: &str) -> NewEvent {
    NewEvent::image(
        key,
        "image_failed",
        format!("page {} image {} ({}): {}", key.page_num, key.image_index, url, reason),
    )
}

pub(crate) async fn hash_file(path: PathBuf) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || checksum::sha256_path(&path))
        .await
        .map_err(|e| anyhow::anyhow!("hash task join: {}", e))?
}
