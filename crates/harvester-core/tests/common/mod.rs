//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

pub mod fake_site;

use harvester_core::config::RunConfig;
use harvester_core::state::StateStore;
use std::path::Path;
use std::time::Duration;

pub const TEMPLATE: &str = "https://gallery.test/g/{num}.html";

/// Config pointed at `root` with fast, deterministic pacing.
pub fn config(root: &Path, start: u32, end: Option<u32>) -> RunConfig {
    let mut cfg = RunConfig::new(TEMPLATE, start);
    cfg.end_num = end;
    cfg.output_dir = root.join("downloads");
    cfg.state_db = root.join("state.sqlite3");
    cfg.requests_per_sec = 1000.0;
    cfg.burst = 100;
    cfg.backoff_base_sec = 0.0;
    cfg.backoff_max_sec = 0.0;
    cfg.page_workers = 1;
    cfg.image_workers = 1;
    cfg
}

pub async fn open_store(cfg: &RunConfig) -> StateStore {
    StateStore::open_at(&cfg.state_db)
        .await
        .unwrap()
        .with_flush_policy(cfg.flush_rows, Duration::from_millis(cfg.flush_interval_ms))
}
