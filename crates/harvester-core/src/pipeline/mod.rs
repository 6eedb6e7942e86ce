//! Job orchestration.
//!
//! Drives the job/page/image state machines: opens (or resets) the job,
//! recovers rows left `running`, rebuilds the frontier, then schedules pages
//! over a bounded pool (bounded range) or strictly in order (open-ended range)
//! while a shared image worker pool downloads every expanded image through
//! the one rate limiter. All transitions go through the store's write buffer.

mod images;
mod page;
mod retry_failed;
mod schedule;

pub use retry_failed::RetryReport;

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ConfigError, RunConfig};
use crate::control::StopSignal;
use crate::downloader::Downloader;
use crate::extract::Extractor;
use crate::fetch::{self, CurlImageTransport, ImageTransport, PageFetcher};
use crate::rate_limit::RateLimiter;
use crate::state::{JobState, JobSummary, NewEvent, StateStore};

use images::ImagePool;

/// Why a run returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunEnd {
    /// Every scheduled page was visited.
    #[default]
    Exhausted,
    /// Open-ended range hit the consecutive-failure threshold.
    ThresholdReached,
    /// The stop signal fired. The job stays `running` for a later resume, or
    /// turns `failed` when no page had reached a terminal state.
    Stopped,
    /// The job was already terminal; nothing was scheduled.
    AlreadyFinished,
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job_id: String,
    pub state: JobState,
    pub end: RunEnd,
    pub summary: JobSummary,
    /// Pages processed in this run (terminal pages skipped on resume excluded).
    pub pages_processed: u32,
    pub pages_skipped: u32,
}

/// Outcome of one page visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageOutcome {
    Finished(crate::state::PageState),
    /// Already terminal from an earlier run.
    Skipped(crate::state::PageState),
    /// Stopped before every expected image was attempted; page left open.
    Interrupted,
}

/// Everything a page or image worker needs, shared by reference count.
pub(crate) struct Shared {
    pub(crate) store: StateStore,
    pub(crate) config: Arc<RunConfig>,
    pub(crate) job_id: String,
    pub(crate) page_fetcher: Arc<dyn PageFetcher>,
    pub(crate) fallback_fetcher: Option<Arc<dyn PageFetcher>>,
    pub(crate) images: Arc<dyn ImageTransport>,
    pub(crate) downloader: Downloader,
    pub(crate) extractor: Extractor,
    pub(crate) stop: StopSignal,
    /// Set after a fatal store error so the other workers wind down.
    pub(crate) halted: AtomicBool,
}

impl Shared {
    pub(crate) fn should_stop(&self) -> bool {
        self.stop.is_stopped() || self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }
}

/// Harvesting engine for one run configuration.
pub struct Pipeline {
    store: StateStore,
    config: Arc<RunConfig>,
    page_fetcher: Arc<dyn PageFetcher>,
    fallback_fetcher: Option<Arc<dyn PageFetcher>>,
    images: Arc<dyn ImageTransport>,
    downloader: Downloader,
    stop: StopSignal,
}

impl Pipeline {
    /// Validate `config` and build a pipeline over the given transports.
    pub fn new(
        store: StateStore,
        config: RunConfig,
        page_fetcher: Arc<dyn PageFetcher>,
        images: Arc<dyn ImageTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.requests_per_sec, config.burst));
        let downloader = Downloader::new(limiter, config.backoff_base(), config.backoff_max());
        Ok(Self {
            store,
            config: Arc::new(config),
            page_fetcher,
            fallback_fetcher: None,
            images,
            downloader,
            stop: StopSignal::new(),
        })
    }

    /// Pipeline over the libcurl / headless-browser transports named by `config`.
    pub fn from_config(store: StateStore, config: RunConfig) -> Result<Self, ConfigError> {
        let primary = fetch::page_fetcher_for(config.engine, &config);
        let fallback = config
            .fallback_engine
            .filter(|e| *e != config.engine)
            .map(|e| fetch::page_fetcher_for(e, &config));
        let mut pipeline = Self::new(store, config, primary, Arc::new(CurlImageTransport))?;
        pipeline.fallback_fetcher = fallback;
        Ok(pipeline)
    }

    /// Re-fetch engine used when the primary engine finds no image URLs.
    pub fn with_fallback(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fallback_fetcher = Some(fetcher);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn job_id(&self) -> String {
        self.config.job_id()
    }

    /// Run (or resume) the job for this configuration.
    pub async fn run(&self) -> Result<RunReport> {
        let job_id = self.job_id();
        let config_json = self.config.to_json()?;
        let opened = self
            .store
            .open_job(&job_id, &config_json)
            .await
            .context("open job")?;

        if !opened.created && !self.config.resume {
            self.store
                .reset_job(&job_id, &config_json)
                .await
                .context("reset job")?;
            tracing::info!(job_id = %job_id, "job reset");
        } else if opened.record.state.is_terminal() {
            tracing::info!(
                job_id = %job_id,
                state = opened.record.state.as_str(),
                "job already finished, nothing to resume"
            );
            return Ok(RunReport {
                job_id,
                state: opened.record.state,
                end: RunEnd::AlreadyFinished,
                summary: opened.record.summary,
                pages_processed: 0,
                pages_skipped: 0,
            });
        }

        let extractor = match Extractor::new(&self.config.selector, &self.config.sequence_count_selector) {
            Ok(x) => x,
            Err(e) => {
                self.store
                    .fail_job(&job_id, &format!("configuration error: {}", e))
                    .await?;
                return Err(anyhow::Error::new(e).context("compile selectors"));
            }
        };

        let shared = Arc::new(Shared {
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            job_id: job_id.clone(),
            page_fetcher: Arc::clone(&self.page_fetcher),
            fallback_fetcher: self.fallback_fetcher.clone(),
            images: Arc::clone(&self.images),
            downloader: self.downloader.clone(),
            extractor,
            stop: self.stop.clone(),
            halted: AtomicBool::new(false),
        });

        match self.drive(&shared).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "job failed");
                if let Err(fail_err) = self.store.fail_job(&job_id, &format!("persistence failure: {}", e)).await {
                    tracing::error!(job_id = %job_id, error = %fail_err, "could not mark job failed");
                }
                Err(anyhow::Error::new(e).context(format!("job {}", job_id)))
            }
        }
    }

    async fn drive(&self, shared: &Arc<Shared>) -> Result<RunReport, crate::state::StoreError> {
        let job_id = shared.job_id.as_str();
        let store = &shared.store;

        store.set_job_state(job_id, JobState::Running).await?;
        let recovered = store.recover_running(job_id).await?;
        if recovered.pages > 0 || recovered.images > 0 {
            tracing::info!(
                job_id,
                pages = recovered.pages,
                images = recovered.images,
                "recovered rows left running"
            );
        }
        let frontier = Arc::new(store.load_frontier(job_id).await?);
        let range = match self.config.end_num {
            Some(end) => format!("pages {}..={}", self.config.start_num, end),
            None => format!("pages {}.. (open-ended)", self.config.start_num),
        };
        store
            .record_event(NewEvent::job(
                job_id,
                "job_start",
                format!(
                    "{}, {} terminal and {} open pages on record",
                    range,
                    frontier.terminal.len(),
                    frontier.open_pages.len()
                ),
            ))
            .await?;
        tracing::info!(job_id, %range, "job started");

        let flusher = store.spawn_flusher();
        let pool = ImagePool::start(Arc::clone(shared), self.config.image_workers);
        let tally = match self.config.end_num {
            Some(end) => {
                schedule::run_bounded(shared, pool.sender(), frontier, self.config.start_num, end).await
            }
            None => schedule::run_open_ended(shared, pool.sender(), &frontier).await,
        };
        pool.shutdown().await;
        flusher.stop().await;
        let tally = tally?;

        let summary = store.refresh_job_summary(job_id).await?;
        let terminal_pages =
            summary.pages_completed + summary.pages_with_failures + summary.pages_no_images + summary.pages_failed;
        let state = if tally.end == RunEnd::Stopped && terminal_pages == 0 {
            store
                .fail_job(job_id, "stopped before any page completed")
                .await?;
            tracing::info!(job_id, "job stopped before any page completed");
            JobState::Failed
        } else if tally.end == RunEnd::Stopped {
            store
                .record_event(NewEvent::job(
                    job_id,
                    "job_stopped",
                    format!("stopped after {} pages; resume to continue", tally.processed),
                ))
                .await?;
            store.flush().await?;
            tracing::info!(job_id, pages = tally.processed, "job stopped");
            JobState::Running
        } else {
            store
                .record_event(NewEvent::job(
                    job_id,
                    "job_end",
                    format!(
                        "{} pages ({} completed, {} with failures, {} no images, {} failed), {} of {} images",
                        summary.pages_total,
                        summary.pages_completed,
                        summary.pages_with_failures,
                        summary.pages_no_images,
                        summary.pages_failed,
                        summary.images_completed,
                        summary.images_total
                    ),
                ))
                .await?;
            store.set_job_state(job_id, JobState::Completed).await?;
            tracing::info!(job_id, pages = summary.pages_total, "job completed");
            JobState::Completed
        };

        Ok(RunReport {
            job_id: job_id.to_string(),
            state,
            end: tally.end,
            summary,
            pages_processed: tally.processed,
            pages_skipped: tally.skipped,
        })
    }
}
