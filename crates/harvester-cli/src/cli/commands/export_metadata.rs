//! `harvester export-metadata` – write the job-level JSON document.

use anyhow::{Context, Result};
use harvester_core::config::RunConfig;
use harvester_core::metadata;
use harvester_core::state::StateStore;
use std::path::Path;

use crate::cli::resolve_job_id;

/// File name used when `--output` is omitted.
pub const DEFAULT_EXPORT_FILE: &str = "job_metadata.json";

pub async fn run_export_metadata(db: &StateStore, job_id: Option<&str>, output: Option<&Path>) -> Result<()> {
    let job_id = resolve_job_id(db, job_id).await?;
    let job = db
        .get_job(&job_id)
        .await?
        .with_context(|| format!("job {} not found", job_id))?;
    let output_dir = match RunConfig::from_json(&job.config_json) {
        Ok(cfg) => cfg.output_dir,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "stored config unreadable, using default output dir");
            RunConfig::default().output_dir
        }
    };
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| output_dir.join(DEFAULT_EXPORT_FILE));

    let written = metadata::export_job_metadata(db, &job_id, &output_dir, &output).await?;
    println!("exported job {} to {}", job_id, written.display());
    Ok(())
}
