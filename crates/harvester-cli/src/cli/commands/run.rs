//! `harvester run` – harvest or resume the configured page range.

use anyhow::{Context, Result};
use harvester_core::config;
use harvester_core::pipeline::{Pipeline, RunEnd};
use harvester_core::state::StateStore;

use crate::cli::RunArgs;

pub async fn run_harvest(args: &RunArgs) -> Result<()> {
    let mut cfg = config::load_or_default(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate().context("invalid run configuration")?;
    tracing::debug!("effective config: {:?}", cfg);

    let store = StateStore::open_at(&cfg.state_db)
        .await
        .with_context(|| format!("open state db {}", cfg.state_db.display()))?
        .with_flush_policy(cfg.flush_rows, cfg.flush_interval());
    let pipeline = Pipeline::from_config(store, cfg)?;

    let stop = pipeline.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stop requested; finishing in-flight downloads (resume later with `harvester run`)");
            tracing::info!("stop requested from terminal");
            stop.request_stop();
        }
    });

    println!("job {}", pipeline.job_id());
    let result = pipeline.run().await;
    ctrl_c.abort();
    if let Err(e) = pipeline.store().close().await {
        tracing::warn!(error = %e, "closing state db failed");
    }
    let report = result?;

    let s = &report.summary;
    let end = match report.end {
        RunEnd::Exhausted => "range exhausted",
        RunEnd::ThresholdReached => "stopped after consecutive unproductive pages",
        RunEnd::Stopped => "stopped; job left running for resume",
        RunEnd::AlreadyFinished => "job already finished; use --no-resume to start over",
    };
    println!("{} ({})", report.state.as_str(), end);
    println!(
        "pages: {} processed, {} skipped; {} total ({} completed, {} with failures, {} no images, {} failed)",
        report.pages_processed,
        report.pages_skipped,
        s.pages_total,
        s.pages_completed,
        s.pages_with_failures,
        s.pages_no_images,
        s.pages_failed
    );
    println!(
        "images: {} of {} completed, {} failed",
        s.images_completed, s.images_total, s.images_failed
    );
    Ok(())
}
