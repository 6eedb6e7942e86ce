//! `harvester retry-failed` – re-attempt a job's failed images.

use anyhow::{Context, Result};
use harvester_core::config::RunConfig;
use harvester_core::pipeline::Pipeline;
use harvester_core::state::StateStore;
use std::path::Path;

use crate::cli::resolve_job_id;

pub async fn run_retry_failed(
    db: StateStore,
    config_path: Option<&Path>,
    job_id: Option<&str>,
    limit: Option<u32>,
) -> Result<()> {
    let job_id = resolve_job_id(&db, job_id).await?;
    let job = db
        .get_job(&job_id)
        .await?
        .with_context(|| format!("job {} not found", job_id))?;
    let mut cfg = RunConfig::from_json(&job.config_json)
        .with_context(|| format!("stored config of job {} unreadable", job_id))?;
    if let Some(path) = config_path {
        overlay_transport(&mut cfg, &RunConfig::load_from_path(path)?);
    }

    let pipeline = Pipeline::from_config(db, cfg)?;
    let report = pipeline.retry_failed(&job_id, limit).await;
    if let Err(e) = pipeline.store().close().await {
        tracing::warn!(error = %e, "closing state db failed");
    }
    let report = report?;

    println!(
        "job {}: retried {}, recovered {}, failed again {}",
        report.job_id, report.retried, report.recovered, report.failed_again
    );
    for (page_num, state) in &report.pages_updated {
        println!("  page {} -> {}", page_num, state.as_str());
    }
    Ok(())
}

/// Take pacing, retry and worker settings from `file`; keep the job's
/// template, selectors and paths.
fn overlay_transport(cfg: &mut RunConfig, file: &RunConfig) {
    cfg.browser_command = file.browser_command.clone();
    cfg.image_timeout_sec = file.image_timeout_sec;
    cfg.image_retries = file.image_retries;
    cfg.requests_per_sec = file.requests_per_sec;
    cfg.burst = file.burst;
    cfg.backoff_base_sec = file.backoff_base_sec;
    cfg.backoff_max_sec = file.backoff_max_sec;
    cfg.image_workers = file.image_workers;
}
