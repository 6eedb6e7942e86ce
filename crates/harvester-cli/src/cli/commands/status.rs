//! `harvester status` – show a job's progress.

use anyhow::{Context, Result};
use harvester_core::state::StateStore;

use crate::cli::resolve_job_id;

pub async fn run_status(
    db: &StateStore,
    job_id: Option<&str>,
    events_limit: u32,
    failed_limit: u32,
) -> Result<()> {
    let job_id = resolve_job_id(db, job_id).await?;
    let job = db
        .get_job(&job_id)
        .await?
        .with_context(|| format!("job {} not found", job_id))?;

    println!("job:      {}", job.job_id);
    println!("state:    {}", job.state.as_str());
    println!("created:  {}", job.created_at);
    println!("updated:  {}", job.updated_at);
    if let Some(finished) = job.finished_at {
        println!("finished: {}", finished);
    }

    println!();
    println!("{:<24} {}", "PAGE STATE", "COUNT");
    for (state, n) in db.page_state_counts(&job_id).await? {
        println!("{:<24} {}", state, n);
    }
    println!();
    println!("{:<24} {}", "IMAGE STATE", "COUNT");
    for (state, n) in db.image_state_counts(&job_id).await? {
        println!("{:<24} {}", state, n);
    }

    let events = db.recent_events(&job_id, events_limit).await?;
    if !events.is_empty() {
        println!();
        println!("{:<12} {:<6} {:<6} {:<28} {}", "TIME", "PAGE", "IMAGE", "EVENT", "DETAIL");
        for e in events {
            println!(
                "{:<12} {:<6} {:<6} {:<28} {}",
                e.created_at,
                dash(e.page_num),
                dash(e.image_index),
                e.kind,
                e.detail
            );
        }
    }

    let failed = db.failed_images(&job_id, Some(failed_limit)).await?;
    if !failed.is_empty() {
        println!();
        println!("{:<6} {:<6} {:<6} {}", "PAGE", "IMAGE", "HTTP", "URL / ERROR");
        for img in failed {
            println!(
                "{:<6} {:<6} {:<6} {}",
                img.key.page_num,
                img.key.image_index,
                dash(img.http_status),
                img.url
            );
            if let Some(err) = img.error {
                println!("{:<20} {}", "", err);
            }
        }
    }
    Ok(())
}

fn dash<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
