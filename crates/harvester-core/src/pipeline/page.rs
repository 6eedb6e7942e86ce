//! One page: fetch, extract, expand, download, finalize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::downloader::FetchOutcome;
use crate::extract::PageExtract;
use crate::metadata;
use crate::sequence::{self, Expansion};
use crate::state::{
    Frontier, ImageState, NewEvent, NewImage, PageExpansion, PageRecord, PageState, StoreError, WriteOp,
};
use crate::url_model::{image_file_name, page_dir_name, source_id_from_page_url};

use super::images::{ImageDone, ImageTask};
use super::{PageOutcome, Shared};

/// Visit `page_num`: skip it if terminal on record, continue its downloads if
/// it was expanded before, otherwise process it from the fetch.
pub(super) async fn visit_page(
    shared: &Arc<Shared>,
    image_tx: &mpsc::Sender<ImageTask>,
    frontier: &Frontier,
    page_num: u32,
) -> Result<PageOutcome, StoreError> {
    if let Some(state) = frontier.terminal_state(page_num) {
        tracing::debug!(job_id = %shared.job_id, page_num, state = state.as_str(), "page already terminal");
        return Ok(PageOutcome::Skipped(state));
    }

    let page_url = shared.config.page_url(page_num);
    let source_id = source_id_from_page_url(&page_url, page_num);
    shared
        .store
        .enqueue_all([
            WriteOp::PageStarted {
                job_id: shared.job_id.clone(),
                page_num,
                source_url: page_url.clone(),
                source_id,
            },
            WriteOp::Event(NewEvent::page(
                &shared.job_id,
                page_num,
                "page_start",
                format!("page {} started: {}", page_num, page_url),
            )),
        ])
        .await?;
    tracing::info!(job_id = %shared.job_id, page_num, url = %page_url, "page started");

    if let Some(open) = frontier.open_page(page_num).filter(|p| p.expansion.is_some()) {
        tracing::info!(
            job_id = %shared.job_id,
            page_num,
            image_count = open.image_count.unwrap_or(0),
            "continuing expanded page"
        );
        return download_images(shared, image_tx, open_expansion_size(open), page_num, shared.page_fetcher.name()).await;
    }

    process_fresh(shared, image_tx, page_num, &page_url).await
}

fn open_expansion_size(page: &PageRecord) -> u32 {
    page.expansion.as_ref().map(|e| e.upper_bound).unwrap_or(0)
}

async fn process_fresh(
    shared: &Arc<Shared>,
    image_tx: &mpsc::Sender<ImageTask>,
    page_num: u32,
    page_url: &str,
) -> Result<PageOutcome, StoreError> {
    let cfg = &shared.config;
    let report = shared
        .downloader
        .fetch_page(shared.page_fetcher.as_ref(), page_url, cfg.page_retries, cfg.page_timeout())
        .await;
    if report.throttle_events > 0 {
        shared
            .store
            .record_event(NewEvent::page(
                &shared.job_id,
                page_num,
                "rate_limited",
                format!("{} throttled responses fetching {}", report.throttle_events, page_url),
            ))
            .await?;
    }
    let attempts = report.attempts;
    let fetched = match report.outcome {
        FetchOutcome::Success(page) => page,
        FetchOutcome::Retryable { reason } => {
            return fail_page_fetch(shared, page_num, reason, Some(attempts)).await;
        }
        FetchOutcome::Fatal { reason } => {
            return fail_page_fetch(shared, page_num, reason, None).await;
        }
    };

    let mut engine = shared.page_fetcher.name();
    let mut extract = shared.extractor.extract(&fetched.html, page_url);
    if extract.image_urls.is_empty() {
        if let Some(fallback) = &shared.fallback_fetcher {
            if let Some(found) = refetch_with_fallback(shared, fallback.as_ref(), page_num, page_url).await? {
                extract = found;
                engine = fallback.name();
            }
        }
    }
    let extraction = Extraction {
        meta_json: serde_json::to_string(&extract.meta)?,
        engine,
    };

    if extract.image_urls.is_empty() {
        finish_page(
            shared,
            page_num,
            PageState::NoImages,
            None,
            Some(extraction),
            ("page_no_images", format!("page {}: selector matched no image URLs", page_num)),
        )
        .await?;
        write_metadata(shared, page_num, engine).await;
        return Ok(PageOutcome::Finished(PageState::NoImages));
    }

    let expansion = match sequence::resolve(
        &extract.image_urls,
        extract.upper_bound_text.as_deref(),
        cfg.sequence_require_upper_bound,
    ) {
        Ok(e) => e,
        Err(err) => {
            let detail = format!(
                "page {}: {} ({} image URLs in DOM, upper bound text {:?})",
                page_num,
                err,
                extract.image_urls.len(),
                extract.upper_bound_text.as_deref().unwrap_or("")
            );
            finish_page(
                shared,
                page_num,
                PageState::FailedFetch,
                Some(err.to_string()),
                Some(extraction),
                (err.event_kind(), detail),
            )
            .await?;
            write_metadata(shared, page_num, engine).await;
            return Ok(PageOutcome::Finished(PageState::FailedFetch));
        }
    };
    tracing::info!(
        job_id = %shared.job_id,
        page_num,
        upper_bound = expansion.upper_bound,
        dom_count = extract.image_urls.len(),
        "sequence expanded"
    );

    shared
        .store
        .enqueue(expanded_op(shared, page_num, &expansion, extraction))
        .await?;
    // Image rows must be durable before workers claim them.
    shared.store.flush().await?;
    download_images(shared, image_tx, expansion.upper_bound, page_num, engine).await
}

/// What extraction recorded about a page.
struct Extraction {
    meta_json: String,
    /// Engine whose DOM was extracted.
    engine: &'static str,
}

fn expanded_op(shared: &Shared, page_num: u32, expansion: &Expansion, extraction: Extraction) -> WriteOp {
    let page_dir = shared.config.output_dir.join(page_dir_name(page_num));
    let images = expansion
        .urls
        .iter()
        .enumerate()
        .map(|(pos, url)| NewImage {
            image_index: expansion.index_at(pos),
            url: url.clone(),
            local_path: page_dir.join(image_file_name(url)).to_string_lossy().into_owned(),
        })
        .collect();
    WriteOp::PageExpanded {
        job_id: shared.job_id.clone(),
        page_num,
        expansion: PageExpansion {
            upper_bound: expansion.upper_bound,
            seed_width: expansion.template.width as u32,
            extension: expansion.template.extension.clone(),
            index_base: expansion.index_base,
        },
        meta_json: extraction.meta_json,
        engine: extraction.engine.to_string(),
        images,
    }
}

async fn refetch_with_fallback(
    shared: &Shared,
    fallback: &dyn crate::fetch::PageFetcher,
    page_num: u32,
    page_url: &str,
) -> Result<Option<PageExtract>, StoreError> {
    shared
        .store
        .record_event(NewEvent::page(
            &shared.job_id,
            page_num,
            "fallback_fetch",
            format!("no image URLs from {}, re-fetching with {}", shared.page_fetcher.name(), fallback.name()),
        ))
        .await?;
    let report = shared
        .downloader
        .fetch_page(fallback, page_url, 0, shared.config.page_timeout())
        .await;
    match report.outcome {
        FetchOutcome::Success(page) => Ok(Some(shared.extractor.extract(&page.html, page_url))),
        FetchOutcome::Retryable { reason } | FetchOutcome::Fatal { reason } => {
            tracing::warn!(job_id = %shared.job_id, page_num, %reason, "fallback fetch failed");
            Ok(None)
        }
    }
}

/// `exhausted_after` is set when transient failures used up every retry.
async fn fail_page_fetch(
    shared: &Shared,
    page_num: u32,
    reason: String,
    exhausted_after: Option<u32>,
) -> Result<PageOutcome, StoreError> {
    tracing::warn!(job_id = %shared.job_id, page_num, %reason, "page fetch failed");
    if let Some(attempts) = exhausted_after {
        shared
            .store
            .record_event(NewEvent::page(
                &shared.job_id,
                page_num,
                "retry_exhausted",
                format!("page {}: gave up after {} attempts", page_num, attempts),
            ))
            .await?;
    }
    let detail = format!("page {} fetch failed: {}", page_num, reason);
    finish_page(
        shared,
        page_num,
        PageState::FailedFetch,
        Some(reason),
        None,
        ("page_fetch_failed", detail),
    )
    .await?;
    Ok(PageOutcome::Finished(PageState::FailedFetch))
}

/// Schedule the page's open images in ascending index order, wait for them,
/// and settle the page's terminal state from the full expected range.
async fn download_images(
    shared: &Arc<Shared>,
    image_tx: &mpsc::Sender<ImageTask>,
    upper_bound: u32,
    page_num: u32,
    engine: &str,
) -> Result<PageOutcome, StoreError> {
    let rows = shared.store.page_images(&shared.job_id, page_num).await?;
    let expected = (upper_bound as usize).max(rows.len());
    let mut completed = rows.iter().filter(|r| r.state == ImageState::Completed).count();
    let mut failed = rows.iter().filter(|r| r.state == ImageState::Failed).count();

    let abort = Arc::new(AtomicBool::new(false));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    for row in rows.iter().filter(|r| !r.state.is_terminal()) {
        if shared.should_stop() || abort.load(Ordering::SeqCst) {
            break;
        }
        let task = ImageTask {
            key: row.key.clone(),
            url: row.url.clone(),
            dest: row.local_path.clone().into(),
            abort_on_failure: !shared.config.continue_on_image_failure,
            abort: Arc::clone(&abort),
            reply: reply_tx.clone(),
        };
        if image_tx.send(task).await.is_err() {
            break;
        }
    }
    drop(reply_tx);

    while let Some(reply) = reply_rx.recv().await {
        match reply.done? {
            ImageDone::Completed => completed += 1,
            ImageDone::Failed => failed += 1,
            ImageDone::Skipped => {}
        }
    }

    if shared.config.sequence_probe_after_upper_bound {
        if let Some(first) = rows.first() {
            probe_past_bound(shared, page_num, &first.url, rows.len() as u32).await?;
        }
    }

    let attempted = completed + failed;
    if attempted < expected {
        if abort.load(Ordering::SeqCst) || !shared.should_stop() {
            let reason = format!(
                "sequence incomplete: {} of {} expected images attempted",
                attempted, expected
            );
            finish_page(
                shared,
                page_num,
                PageState::FailedFetch,
                Some(reason.clone()),
                None,
                ("incomplete_sequence_failure", format!("page {}: {}", page_num, reason)),
            )
            .await?;
            write_metadata(shared, page_num, engine).await;
            return Ok(PageOutcome::Finished(PageState::FailedFetch));
        }
        tracing::info!(
            job_id = %shared.job_id,
            page_num,
            attempted,
            expected,
            "page interrupted by stop"
        );
        return Ok(PageOutcome::Interrupted);
    }

    let (state, reason, event) = if failed == 0 {
        (PageState::Completed, None, None)
    } else if completed == 0 {
        let reason = format!("all {} images failed", failed);
        let detail = format!("page {}: {}", page_num, reason);
        (PageState::FailedFetch, Some(reason), Some(("incomplete_sequence_failure", detail)))
    } else {
        (PageState::CompletedWithFailures, None, None)
    };
    match event {
        Some(event) => finish_page(shared, page_num, state, reason, None, event).await?,
        None => {
            shared
                .store
                .enqueue(finished_op(shared, page_num, state, reason, None))
                .await?
        }
    }
    tracing::info!(
        job_id = %shared.job_id,
        page_num,
        state = state.as_str(),
        completed,
        failed,
        "page finished"
    );
    write_metadata(shared, page_num, engine).await;
    Ok(PageOutcome::Finished(state))
}

/// Attempt the first index past the sequence once and record what came back.
/// The result never changes the page.
async fn probe_past_bound(shared: &Shared, page_num: u32, first_url: &str, count: u32) -> Result<(), StoreError> {
    let Some(seed) = sequence::match_seed(first_url) else {
        return Ok(());
    };
    let url = seed.template.url_for(seed.number.saturating_add(count));
    shared.downloader.limiter().acquire().await;
    let timeout = shared.config.image_timeout();
    let result = tokio::time::timeout(timeout, shared.images.fetch_bytes(&url, timeout)).await;
    let detail = match result {
        Ok(Ok(body)) => format!("{} -> HTTP {} ({} bytes)", url, body.status, body.bytes.len()),
        Ok(Err(e)) => format!("{} -> {}", url, e),
        Err(_) => format!("{} -> timed out", url),
    };
    tracing::debug!(job_id = %shared.job_id, page_num, %detail, "sequence probe");
    shared
        .store
        .record_event(NewEvent::page(&shared.job_id, page_num, "sequence_probe", detail))
        .await
}

fn finished_op(
    shared: &Shared,
    page_num: u32,
    state: PageState,
    failure_reason: Option<String>,
    extraction: Option<Extraction>,
) -> WriteOp {
    let (meta_json, engine) = match extraction {
        Some(e) => (Some(e.meta_json), Some(e.engine.to_string())),
        None => (None, None),
    };
    WriteOp::PageFinished {
        job_id: shared.job_id.clone(),
        page_num,
        state,
        failure_reason,
        meta_json,
        engine,
    }
}

/// Terminal transition plus the event explaining it, in one batch.
async fn finish_page(
    shared: &Shared,
    page_num: u32,
    state: PageState,
    failure_reason: Option<String>,
    extraction: Option<Extraction>,
    (kind, detail): (&'static str, String),
) -> Result<(), StoreError> {
    tracing::info!(job_id = %shared.job_id, page_num, state = state.as_str(), kind, "page finished");
    shared
        .store
        .enqueue_all([
            finished_op(shared, page_num, state, failure_reason, extraction),
            WriteOp::Event(NewEvent::page(&shared.job_id, page_num, kind, detail)),
        ])
        .await
}

/// Metadata is an output artifact; a failed write is logged, not fatal.
async fn write_metadata(shared: &Shared, page_num: u32, engine: &str) {
    let res = metadata::write_page_metadata(
        &shared.store,
        &shared.config.output_dir,
        &shared.job_id,
        page_num,
        &shared.config.selector,
        engine,
    )
    .await;
    if let Err(e) = res {
        tracing::warn!(job_id = %shared.job_id, page_num, error = %e, "page metadata not written");
    }
}
