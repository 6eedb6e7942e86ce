//! CLI for the harvester.

mod commands;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use harvester_core::config::{self, Engine, RunConfig};
use harvester_core::state::StateStore;
use std::path::{Path, PathBuf};

use commands::{run_checksum, run_export_metadata, run_harvest, run_retry_failed, run_status};

/// Top-level CLI for the harvester.
#[derive(Debug, Parser)]
#[command(name = "harvester")]
#[command(about = "harvester: resumable, rate-limited gallery image downloader", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Harvest (or resume) the page range described by the config and flags.
    Run(RunArgs),

    /// Show a job's state, totals, recent events and failed images.
    Status {
        /// State database (default: from the config file).
        #[arg(long, value_name = "FILE")]
        state_db: Option<PathBuf>,
        /// Job identifier (default: most recently created job).
        #[arg(long, value_name = "ID")]
        job_id: Option<String>,
        /// Newest events to show.
        #[arg(long, default_value = "20", value_name = "N")]
        events_limit: u32,
        /// Failed images to show.
        #[arg(long, default_value = "20", value_name = "N")]
        failed_limit: u32,
    },

    /// Re-attempt failed images of a job and refresh their pages.
    RetryFailed {
        /// Config file for pacing, retries and workers (default: the job's stored config).
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        state_db: Option<PathBuf>,
        #[arg(long, value_name = "ID")]
        job_id: Option<String>,
        /// Retry at most N images.
        #[arg(long, value_name = "N")]
        limit: Option<u32>,
    },

    /// Write a job-level JSON summary of every page.
    ExportMetadata {
        #[arg(long, value_name = "FILE")]
        state_db: Option<PathBuf>,
        #[arg(long, value_name = "ID")]
        job_id: Option<String>,
        /// Output file (default: job_metadata.json in the job's output dir).
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Compute SHA-256 of a file.
    Checksum {
        /// Path to the file.
        path: PathBuf,
    },
}

/// Flags of `harvester run`; each one overrides the config file value.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Config file (default: ~/.config/harvester/config.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Page URL template containing `{num}`.
    #[arg(long, value_name = "T")]
    pub url_template: Option<String>,
    #[arg(long, value_name = "N")]
    pub start_num: Option<u32>,
    /// Last page (inclusive); omit for an open-ended range.
    #[arg(long, value_name = "N")]
    pub end_num: Option<u32>,
    /// CSS selector for gallery images.
    #[arg(long, value_name = "S")]
    pub selector: Option<String>,
    #[arg(long, value_name = "D")]
    pub output_dir: Option<PathBuf>,
    #[arg(long, value_name = "FILE")]
    pub state_db: Option<PathBuf>,
    /// Page fetch engine: http or browser.
    #[arg(long, value_name = "ENGINE")]
    pub engine: Option<Engine>,
    /// Engine to re-fetch with when a page yields no image URLs.
    #[arg(long, value_name = "ENGINE")]
    pub fallback_engine: Option<Engine>,
    /// Continue the job recorded for this config (default).
    #[arg(long, conflicts_with = "no_resume")]
    pub resume: bool,
    /// Reset the job recorded for this config and start over.
    #[arg(long)]
    pub no_resume: bool,
    #[arg(long, value_name = "N")]
    pub page_workers: Option<usize>,
    #[arg(long, value_name = "N")]
    pub image_workers: Option<usize>,
    #[arg(long, value_name = "R")]
    pub requests_per_sec: Option<f64>,
    #[arg(long, value_name = "N")]
    pub image_retries: Option<u32>,
    #[arg(long, value_name = "N")]
    pub page_retries: Option<u32>,
    /// Open-ended range: stop after N consecutive unproductive pages.
    #[arg(long, value_name = "N")]
    pub stop_after: Option<u32>,
    /// Skip a page's remaining images after its first image failure.
    #[arg(long)]
    pub abort_page_on_image_failure: bool,
}

impl RunArgs {
    /// Overlay the given flags onto `cfg`.
    pub fn apply(&self, cfg: &mut RunConfig) {
        if let Some(t) = &self.url_template {
            cfg.url_template = t.clone();
        }
        if let Some(n) = self.start_num {
            cfg.start_num = n;
        }
        if let Some(n) = self.end_num {
            cfg.end_num = Some(n);
        }
        if let Some(s) = &self.selector {
            cfg.selector = s.clone();
        }
        if let Some(d) = &self.output_dir {
            cfg.output_dir = d.clone();
        }
        if let Some(f) = &self.state_db {
            cfg.state_db = f.clone();
        }
        if let Some(e) = self.engine {
            cfg.engine = e;
        }
        if let Some(e) = self.fallback_engine {
            cfg.fallback_engine = Some(e);
        }
        if self.resume {
            cfg.resume = true;
        }
        if self.no_resume {
            cfg.resume = false;
        }
        if let Some(n) = self.page_workers {
            cfg.page_workers = n;
        }
        if let Some(n) = self.image_workers {
            cfg.image_workers = n;
        }
        if let Some(r) = self.requests_per_sec {
            cfg.requests_per_sec = r;
        }
        if let Some(n) = self.image_retries {
            cfg.image_retries = n;
        }
        if let Some(n) = self.page_retries {
            cfg.page_retries = n;
        }
        if let Some(n) = self.stop_after {
            cfg.stop_after_consecutive_page_failures = n;
        }
        if self.abort_page_on_image_failure {
            cfg.continue_on_image_failure = false;
        }
    }
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        match cli.command {
            CliCommand::Run(args) => run_harvest(&args).await?,
            CliCommand::Status {
                state_db,
                job_id,
                events_limit,
                failed_limit,
            } => {
                let store = open_state_db(state_db.as_deref()).await?;
                run_status(&store, job_id.as_deref(), events_limit, failed_limit).await?;
            }
            CliCommand::RetryFailed {
                config,
                state_db,
                job_id,
                limit,
            } => {
                let store = open_state_db(state_db.as_deref()).await?;
                run_retry_failed(store, config.as_deref(), job_id.as_deref(), limit).await?;
            }
            CliCommand::ExportMetadata {
                state_db,
                job_id,
                output,
            } => {
                let store = open_state_db(state_db.as_deref()).await?;
                run_export_metadata(&store, job_id.as_deref(), output.as_deref()).await?;
            }
            CliCommand::Checksum { path } => run_checksum(&path).await?,
        }

        Ok(())
    }
}

/// Open the state database named by `--state-db`, else the one in the default config.
async fn open_state_db(state_db: Option<&Path>) -> Result<StateStore> {
    let path = match state_db {
        Some(p) => p.to_path_buf(),
        None => config::load_or_default(None)?.state_db,
    };
    tracing::debug!(path = %path.display(), "opening state db");
    StateStore::open_at(&path)
        .await
        .with_context(|| format!("open state db {}", path.display()))
}

/// The given job id, or the most recently created job.
async fn resolve_job_id(store: &StateStore, job_id: Option<&str>) -> Result<String> {
    if let Some(id) = job_id {
        return Ok(id.to_string());
    }
    store
        .latest_job_id()
        .await?
        .context("no jobs in database; pass --job-id or run a harvest first")
}

#[cfg(test)]
mod tests;
