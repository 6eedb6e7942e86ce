//! Page scheduling: bounded pool for a known range, strict order when open-ended.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::state::{Frontier, NewEvent, StoreError};

use super::images::ImageTask;
use super::page::visit_page;
use super::{PageOutcome, RunEnd, Shared};

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Tally {
    pub(super) processed: u32,
    pub(super) skipped: u32,
    pub(super) interrupted: bool,
    pub(super) end: RunEnd,
}

impl Tally {
    fn add(&mut self, outcome: PageOutcome) {
        match outcome {
            PageOutcome::Finished(_) => self.processed += 1,
            PageOutcome::Skipped(_) => self.skipped += 1,
            PageOutcome::Interrupted => self.interrupted = true,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.interrupted |= other.interrupted;
    }
}

/// Visit `start..=end` with `page_workers` tasks pulling from one queue.
/// Pages may finish out of order.
pub(super) async fn run_bounded(
    shared: &Arc<Shared>,
    image_tx: mpsc::Sender<ImageTask>,
    frontier: Arc<Frontier>,
    start: u32,
    end: u32,
) -> Result<Tally, StoreError> {
    let queue: Arc<Mutex<VecDeque<u32>>> = Arc::new(Mutex::new((start..=end).collect()));
    let workers = shared.config.page_workers.max(1);
    let mut join_set = JoinSet::new();

    for _ in 0..workers {
        let shared = Arc::clone(shared);
        let queue = Arc::clone(&queue);
        let frontier = Arc::clone(&frontier);
        let image_tx = image_tx.clone();
        join_set.spawn(async move {
            let mut tally = Tally::default();
            loop {
                if shared.should_stop() {
                    break;
                }
                let next = queue
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .pop_front();
                let Some(page_num) = next else {
                    break;
                };
                match visit_page(&shared, &image_tx, &frontier, page_num).await {
                    Ok(outcome) => tally.add(outcome),
                    Err(e) => {
                        shared.halt();
                        return Err(e);
                    }
                }
            }
            Ok(tally)
        });
    }
    drop(image_tx);

    let mut total = Tally::default();
    let mut first_err = None;
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Ok(tally)) => total.merge(tally),
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(join_err) => {
                shared.halt();
                first_err.get_or_insert(StoreError::Poisoned(format!("page worker: {}", join_err)));
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    let queue_left = !queue.lock().unwrap_or_else(|p| p.into_inner()).is_empty();
    if total.interrupted || (queue_left && shared.stop.is_stopped()) {
        total.end = RunEnd::Stopped;
    }
    Ok(total)
}

/// Visit pages from `start_num` upward one at a time until the consecutive
/// unproductive-page threshold is reached or the stop signal fires. Pages
/// already terminal from an earlier run count with their recorded state.
pub(super) async fn run_open_ended(
    shared: &Arc<Shared>,
    image_tx: mpsc::Sender<ImageTask>,
    frontier: &Frontier,
) -> Result<Tally, StoreError> {
    let threshold = shared.config.stop_after_consecutive_page_failures.max(1);
    let mut tally = Tally::default();
    let mut consecutive = 0u32;
    let mut page_num = shared.config.start_num;

    loop {
        if shared.should_stop() {
            tally.end = RunEnd::Stopped;
            return Ok(tally);
        }
        let outcome = visit_page(shared, &image_tx, frontier, page_num).await?;
        tally.add(outcome);
        let state = match outcome {
            PageOutcome::Finished(s) | PageOutcome::Skipped(s) => s,
            PageOutcome::Interrupted => {
                tally.end = RunEnd::Stopped;
                return Ok(tally);
            }
        };
        if state.is_unproductive() {
            consecutive += 1;
        } else {
            consecutive = 0;
        }
        tracing::debug!(
            job_id = %shared.job_id,
            page_num,
            state = state.as_str(),
            consecutive,
            "page counted"
        );

        if consecutive >= threshold {
            shared
                .store
                .record_event(NewEvent::job(
                    &shared.job_id,
                    "stop_threshold",
                    format!(
                        "{} consecutive pages without images or failed (last page {})",
                        consecutive, page_num
                    ),
                ))
                .await?;
            tracing::info!(job_id = %shared.job_id, page_num, consecutive, "stop threshold reached");
            tally.end = RunEnd::ThresholdReached;
            return Ok(tally);
        }

        page_num = match page_num.checked_add(1) {
            Some(n) => n,
            None => return Ok(tally),
        };
    }
}
