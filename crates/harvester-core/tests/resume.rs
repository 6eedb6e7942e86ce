//! Integration tests: stop/resume, reset, operator retry and job export.

mod common;

use common::fake_site::{empty_html, gallery_html, image_url, FakeSite, ImageReply};
use harvester_core::control::StopSignal;
use harvester_core::metadata;
use harvester_core::pipeline::{Pipeline, RunEnd};
use harvester_core::state::{ImageState, JobState, PageState};
use tempfile::tempdir;

fn two_page_site() -> FakeSite {
    let site = FakeSite::new();
    site.page(1, gallery_html(1, &[1], "3"));
    site.images(1, 3);
    site.page(2, gallery_html(2, &[1], "1"));
    site.images(2, 1);
    site
}

#[tokio::test]
async fn stop_then_resume_downloads_nothing_twice() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(3));
    let site = FakeSite::new();
    site.page(1, gallery_html(1, &[1], "1"));
    site.images(1, 1);
    site.page(2, gallery_html(2, &[1], "3"));
    site.images(2, 3);
    site.page(3, gallery_html(3, &[1], "1"));
    site.images(3, 1);
    let stop = StopSignal::new();
    site.stop_when_fetched(image_url(2, 2), stop.clone());

    let store = common::open_store(&cfg).await;
    let first = Pipeline::new(store.clone(), cfg.clone(), site.fetcher(), site.transport())
        .unwrap()
        .with_stop_signal(stop);
    let report = first.run().await.unwrap();
    let job_id = first.job_id();

    assert_eq!(report.end, RunEnd::Stopped);
    assert_eq!(report.state, JobState::Running);
    assert_eq!(store.get_job(&job_id).await.unwrap().unwrap().state, JobState::Running);
    assert_eq!(store.events_of_kind(&job_id, "job_stopped").await.unwrap().len(), 1);
    assert_eq!(store.get_page(&job_id, 1).await.unwrap().unwrap().state, PageState::Completed);
    assert_eq!(site.image_hits(&image_url(2, 3)), 0);
    assert_eq!(site.page_hits(3), 0);
    let states: Vec<ImageState> = store
        .page_images(&job_id, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.state)
        .collect();
    assert_eq!(
        states,
        vec![ImageState::Completed, ImageState::Completed, ImageState::Pending]
    );

    let second = Pipeline::new(store.clone(), cfg, site.fetcher(), site.transport()).unwrap();
    let report = second.run().await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.end, RunEnd::Exhausted);
    // Page 2 continued from its recorded expansion: no second page fetch.
    assert_eq!(site.page_hits(1), 1);
    assert_eq!(site.page_hits(2), 1);
    assert_eq!(site.page_hits(3), 1);
    for i in 1..=3 {
        assert_eq!(site.image_hits(&image_url(2, i)), 1, "image {}", i);
    }
    assert_eq!(site.total_image_hits(), 5);
    assert_eq!(store.get_page(&job_id, 2).await.unwrap().unwrap().state, PageState::Completed);
    assert_eq!(report.summary.images_completed, 5);
    assert_eq!(store.events_of_kind(&job_id, "job_start").await.unwrap().len(), 2);
}

#[tokio::test]
async fn stop_inside_first_page_fails_the_job() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(2));
    let site = two_page_site();
    let stop = StopSignal::new();
    site.stop_when_fetched(image_url(1, 2), stop.clone());

    let store = common::open_store(&cfg).await;
    let pipeline = Pipeline::new(store.clone(), cfg, site.fetcher(), site.transport())
        .unwrap()
        .with_stop_signal(stop);
    let report = pipeline.run().await.unwrap();
    let job_id = pipeline.job_id();

    assert_eq!(report.end, RunEnd::Stopped);
    assert_eq!(report.state, JobState::Failed);
    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    let failed = store.events_of_kind(&job_id, "job_failed").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].detail, "stopped before any page completed");
    assert_eq!(site.page_hits(2), 0);
    // Work already done stays recorded.
    assert_eq!(report.summary.images_completed, 2);
}

#[tokio::test]
async fn resuming_a_finished_job_does_no_work() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(2));
    let site = two_page_site();
    let store = common::open_store(&cfg).await;

    let pipeline = Pipeline::new(store.clone(), cfg.clone(), site.fetcher(), site.transport()).unwrap();
    pipeline.run().await.unwrap();
    let again = pipeline.run().await.unwrap();

    assert_eq!(again.end, RunEnd::AlreadyFinished);
    assert_eq!(again.state, JobState::Completed);
    assert_eq!(again.summary.images_completed, 4);
    assert_eq!(site.page_hits(1), 1);
    assert_eq!(site.total_image_hits(), 4);
}

#[tokio::test]
async fn extended_range_runs_as_its_own_job() {
    let dir = tempdir().unwrap();
    let site = two_page_site();
    site.page(3, gallery_html(3, &[1], "2"));
    site.images(3, 2);

    let short = common::config(dir.path(), 1, Some(1));
    let store = common::open_store(&short).await;
    let first = Pipeline::new(store.clone(), short, site.fetcher(), site.transport()).unwrap();
    assert_eq!(first.run().await.unwrap().state, JobState::Completed);

    let long = common::config(dir.path(), 1, Some(3));
    let second = Pipeline::new(store.clone(), long, site.fetcher(), site.transport()).unwrap();
    assert_ne!(second.job_id(), first.job_id());
    let report = second.run().await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.end, RunEnd::Exhausted);
    assert_eq!(report.pages_processed, 3);
    assert_eq!(site.page_hits(2), 1);
    assert_eq!(site.page_hits(3), 1);
    // Page 1's files from the first job are reused.
    for i in 1..=3 {
        assert_eq!(site.image_hits(&image_url(1, i)), 1, "image {}", i);
    }
    assert_eq!(report.summary.images_completed, 6);

    let earlier = store.get_job(&first.job_id()).await.unwrap().unwrap();
    assert_eq!(earlier.state, JobState::Completed);
    assert_eq!(store.list_pages(&first.job_id()).await.unwrap().len(), 1);
    assert_eq!(store.list_jobs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn no_resume_resets_job_before_running() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(2));
    let site = two_page_site();
    let store = common::open_store(&cfg).await;

    let first = Pipeline::new(store.clone(), cfg.clone(), site.fetcher(), site.transport()).unwrap();
    first.run().await.unwrap();
    let job_id = first.job_id();

    let mut fresh = cfg.clone();
    fresh.resume = false;
    let second = Pipeline::new(store.clone(), fresh, site.fetcher(), site.transport()).unwrap();
    assert_eq!(second.job_id(), job_id);
    let report = second.run().await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.pages_processed, 2);
    assert_eq!(site.page_hits(1), 2);
    // Only the second run's events remain.
    assert_eq!(store.events_of_kind(&job_id, "job_start").await.unwrap().len(), 1);
    assert_eq!(store.events_of_kind(&job_id, "job_end").await.unwrap().len(), 1);
    // Files on disk are reused rather than downloaded again.
    assert_eq!(site.total_image_hits(), 4);
    assert_eq!(store.list_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn retry_failed_recovers_images_and_refreshes_page() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(1));
    let site = FakeSite::new();
    site.page(1, gallery_html(1, &[1], "3"));
    site.images(1, 3);
    site.image(image_url(1, 2), ImageReply::Status(404));

    let store = common::open_store(&cfg).await;
    let pipeline = Pipeline::new(store.clone(), cfg.clone(), site.fetcher(), site.transport()).unwrap();
    pipeline.run().await.unwrap();
    let job_id = pipeline.job_id();
    assert_eq!(
        store.get_page(&job_id, 1).await.unwrap().unwrap().state,
        PageState::CompletedWithFailures
    );

    // The server has the image now.
    site.images(1, 3);
    let report = pipeline.retry_failed(&job_id, None).await.unwrap();

    assert_eq!(report.retried, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed_again, 0);
    assert_eq!(report.pages_updated, vec![(1, PageState::Completed)]);
    assert_eq!(store.get_page(&job_id, 1).await.unwrap().unwrap().state, PageState::Completed);
    assert!(store.failed_images(&job_id, None).await.unwrap().is_empty());
    assert_eq!(site.image_hits(&image_url(1, 2)), 2);

    let events = store.events_of_kind(&job_id, "retry_failed").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].detail, "retried=1 recovered=1 failed_again=0");

    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(cfg.output_dir.join("000001/metadata.json")).unwrap()).unwrap();
    assert_eq!(doc["summary"]["success_count"], 3);
    assert_eq!(doc["summary"]["status"], "completed");
    assert_eq!(store.get_job(&job_id).await.unwrap().unwrap().summary.images_failed, 0);
}

#[tokio::test]
async fn retry_failed_counts_images_that_fail_again() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(1));
    let site = FakeSite::new();
    site.page(1, gallery_html(1, &[1], "2"));
    site.images(1, 1);

    let store = common::open_store(&cfg).await;
    let pipeline = Pipeline::new(store.clone(), cfg, site.fetcher(), site.transport()).unwrap();
    pipeline.run().await.unwrap();
    let job_id = pipeline.job_id();

    let report = pipeline.retry_failed(&job_id, Some(5)).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.recovered, 0);
    assert_eq!(report.failed_again, 1);
    assert!(report.pages_updated.is_empty());
    assert_eq!(
        store.get_page(&job_id, 1).await.unwrap().unwrap().state,
        PageState::CompletedWithFailures
    );
    assert_eq!(store.failed_images(&job_id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retry_failed_keeps_the_engine_that_extracted_the_page() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(1));
    let site = FakeSite::new();
    site.page(1, empty_html());
    site.images(1, 2);
    site.image(image_url(1, 2), ImageReply::Status(404));
    let rendered = FakeSite::new().named("browser");
    rendered.page(1, gallery_html(1, &[1], "2"));

    let store = common::open_store(&cfg).await;
    let pipeline = Pipeline::new(store.clone(), cfg.clone(), site.fetcher(), site.transport())
        .unwrap()
        .with_fallback(rendered.fetcher());
    pipeline.run().await.unwrap();
    let job_id = pipeline.job_id();
    let page = store.get_page(&job_id, 1).await.unwrap().unwrap();
    assert_eq!(page.state, PageState::CompletedWithFailures);
    assert_eq!(page.engine.as_deref(), Some("browser"));

    site.images(1, 2);
    let report = pipeline.retry_failed(&job_id, None).await.unwrap();
    assert_eq!(report.recovered, 1);

    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(cfg.output_dir.join("000001/metadata.json")).unwrap()).unwrap();
    assert_eq!(doc["summary"]["status"], "completed");
    assert_eq!(doc["engine"], "browser");
}

#[tokio::test]
async fn export_lists_every_page_with_metadata_path() {
    let dir = tempdir().unwrap();
    let cfg = common::config(dir.path(), 1, Some(2));
    let site = two_page_site();
    let store = common::open_store(&cfg).await;
    let pipeline = Pipeline::new(store.clone(), cfg.clone(), site.fetcher(), site.transport()).unwrap();
    pipeline.run().await.unwrap();
    let job_id = pipeline.job_id();

    let out = dir.path().join("export").join("job.json");
    let written = metadata::export_job_metadata(&store, &job_id, &cfg.output_dir, &out)
        .await
        .unwrap();
    assert_eq!(written, out);

    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(doc["job"]["job_id"], job_id);
    assert_eq!(doc["job"]["state"], "completed");
    assert_eq!(doc["job"]["config"]["url_template"], common::TEMPLATE);
    assert_eq!(doc["totals"]["pages"]["completed"], 2);
    assert_eq!(doc["totals"]["images"]["completed"], 4);
    let pages = doc["pages"].as_array().unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(pages[0]["page_num"], 1);
    assert_eq!(pages[0]["title"], "Set 1");
    assert!(pages[1]["metadata_path"].as_str().unwrap().ends_with("000002/metadata.json"));
}
