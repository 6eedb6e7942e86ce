//! Operator retry of failed images.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::RunConfig;
use crate::downloader::FetchOutcome;
use crate::metadata;
use crate::state::{ImageRecord, ImageResult, NewEvent, PageState};

use super::Pipeline;

/// Outcome of [`Pipeline::retry_failed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub job_id: String,
    pub retried: u32,
    pub recovered: u32,
    pub failed_again: u32,
    /// Pages whose terminal state changed, with the new state.
    pub pages_updated: Vec<(u32, PageState)>,
}

impl Pipeline {
    /// Re-attempt up to `limit` failed images of `job_id` (all when `None`),
    /// refresh the owning pages and rewrite their metadata documents.
    pub async fn retry_failed(&self, job_id: &str, limit: Option<u32>) -> Result<RetryReport> {
        let store = &self.store;
        let job = store
            .get_job(job_id)
            .await?
            .with_context(|| format!("job {} not found", job_id))?;
        // Paths and selectors come from the job's own configuration.
        let job_config = RunConfig::from_json(&job.config_json).unwrap_or_else(|e| {
            tracing::warn!(job_id, error = %e, "stored config unreadable, using current config");
            self.config.as_ref().clone()
        });

        let failed = store.failed_images(job_id, limit).await?;
        let mut report = RetryReport {
            job_id: job_id.to_string(),
            ..RetryReport::default()
        };
        if failed.is_empty() {
            tracing::info!(job_id, "no failed images to retry");
            return Ok(report);
        }
        tracing::info!(job_id, count = failed.len(), "retrying failed images");

        let workers = self.config.image_workers.max(1);
        let mut join_set = JoinSet::new();
        let mut pages = BTreeSet::new();
        for image in failed {
            while join_set.len() >= workers {
                if let Some(res) = join_set.join_next().await {
                    self.settle(res.context("retry task join")?, &mut report).await?;
                }
            }
            pages.insert(image.key.page_num);
            let downloader = self.downloader.clone();
            let transport = Arc::clone(&self.images);
            let retries = self.config.image_retries;
            let timeout = self.config.image_timeout();
            join_set.spawn(async move {
                let dest = PathBuf::from(&image.local_path);
                let r = downloader
                    .fetch_image(transport.as_ref(), &image.url, &dest, retries, timeout)
                    .await;
                let retries = r.retries_used();
                let result = match r.outcome {
                    FetchOutcome::Success(stored) => {
                        ImageResult::completed(Some(stored.status), stored.sha256, stored.size_bytes, retries)
                    }
                    FetchOutcome::Retryable { reason } | FetchOutcome::Fatal { reason } => {
                        ImageResult::failed(r.last_status, retries, reason)
                    }
                };
                (image, result)
            });
        }
        while let Some(res) = join_set.join_next().await {
            self.settle(res.context("retry task join")?, &mut report).await?;
        }

        for page_num in pages {
            if let Some(state) = store.refresh_page_after_retry(job_id, page_num).await? {
                tracing::info!(job_id, page_num, state = state.as_str(), "page state refreshed");
                report.pages_updated.push((page_num, state));
            }
            rewrite_metadata(self, &job_config, job_id, page_num).await;
        }

        store
            .record_event(NewEvent::job(
                job_id,
                "retry_failed",
                format!(
                    "retried={} recovered={} failed_again={}",
                    report.retried, report.recovered, report.failed_again
                ),
            ))
            .await?;
        store.refresh_job_summary(job_id).await?;
        Ok(report)
    }

    async fn settle(&self, (image, result): (ImageRecord, ImageResult), report: &mut RetryReport) -> Result<()> {
        let recovered = result.state == crate::state::ImageState::Completed;
        if !recovered {
            tracing::warn!(
                page_num = image.key.page_num,
                index = image.key.image_index,
                error = result.error.as_deref().unwrap_or(""),
                "image failed again"
            );
        }
        if self.store.record_retry_result(&image.key, &result).await? {
            report.retried += 1;
            if recovered {
                report.recovered += 1;
            } else {
                report.failed_again += 1;
            }
        }
        Ok(())
    }
}

/// The page keeps the engine recorded when it was extracted; `cfg.engine` covers older rows.
async fn rewrite_metadata(pipeline: &Pipeline, cfg: &RunConfig, job_id: &str, page_num: u32) {
    let res = metadata::write_page_metadata(
        &pipeline.store,
        &cfg.output_dir,
        job_id,
        page_num,
        &cfg.selector,
        cfg.engine.as_str(),
    )
    .await;
    if let Err(e) = res {
        tracing::warn!(job_id, page_num, error = %e, "page metadata not rewritten");
    }
}
