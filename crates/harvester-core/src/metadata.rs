//! Per-page `metadata.json` documents and the job-level export.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::extract::GalleryMeta;
use crate::state::{ImageRecord, ImageState, JobSummary, PageRecord, StateStore};
use crate::storage;
use crate::url_model::page_dir_name;

pub const METADATA_FILE: &str = "metadata.json";

/// Path of a page's metadata document under `output_dir`.
pub fn metadata_path(output_dir: &Path, page_num: u32) -> PathBuf {
    output_dir.join(page_dir_name(page_num)).join(METADATA_FILE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub index: u32,
    pub url: String,
    pub file_name: String,
    pub status: String,
    pub http_status: Option<u16>,
    pub sha256: Option<String>,
    pub size_bytes: Option<u64>,
    pub retries: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    /// Expected image count (the expansion size), not the DOM count.
    pub total_count: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub status: String,
    pub failure_reason: Option<String>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub job_id: String,
    pub page_num: u32,
    pub page_url: String,
    pub source_id: String,
    pub selector: String,
    pub engine: String,
    #[serde(flatten)]
    pub gallery: GalleryMeta,
    pub upper_bound: Option<u32>,
    pub images: Vec<ImageEntry>,
    pub summary: PageSummary,
}

fn file_name_of(local_path: &str) -> String {
    Path::new(local_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Build the document for a terminal page from its durable rows.
/// `engine` names the page only when its row has no engine recorded.
pub fn build_page_metadata(
    page: &PageRecord,
    images: &[ImageRecord],
    selector: &str,
    engine: &str,
) -> PageMetadata {
    let gallery = page
        .meta_json
        .as_deref()
        .and_then(|s| serde_json::from_str::<GalleryMeta>(s).ok())
        .unwrap_or_default();
    let success_count = images.iter().filter(|i| i.state == ImageState::Completed).count() as u32;
    let failed_count = images.iter().filter(|i| i.state == ImageState::Failed).count() as u32;
    let duration_sec = match (page.started_at, page.finished_at) {
        (Some(start), Some(end)) if end >= start => (end - start) as f64,
        _ => 0.0,
    };

    PageMetadata {
        job_id: page.job_id.clone(),
        page_num: page.page_num,
        page_url: page.source_url.clone(),
        source_id: page.source_id.clone(),
        selector: selector.to_string(),
        engine: page.engine.clone().unwrap_or_else(|| engine.to_string()),
        gallery,
        upper_bound: page.expansion.as_ref().map(|e| e.upper_bound),
        images: images
            .iter()
            .map(|i| ImageEntry {
                index: i.key.image_index,
                url: i.url.clone(),
                file_name: file_name_of(&i.local_path),
                status: i.state.as_str().to_string(),
                http_status: i.http_status,
                sha256: i.sha256.clone(),
                size_bytes: i.size_bytes,
                retries: i.retries,
                error: i.error.clone(),
            })
            .collect(),
        summary: PageSummary {
            total_count: page.image_count.unwrap_or(images.len() as u32),
            success_count,
            failed_count,
            status: page.state.as_str().to_string(),
            failure_reason: page.failure_reason.clone(),
            started_at: page.started_at,
            ended_at: page.finished_at,
            duration_sec,
        },
    }
}

/// Read the page's flushed rows and (re)write its metadata document atomically.
pub async fn write_page_metadata(
    store: &StateStore,
    output_dir: &Path,
    job_id: &str,
    page_num: u32,
    selector: &str,
    engine: &str,
) -> Result<PathBuf> {
    store.flush().await?;
    let page = store
        .get_page(job_id, page_num)
        .await?
        .with_context(|| format!("page {} of {} not found", page_num, job_id))?;
    let images = store.page_images(job_id, page_num).await?;
    let doc = build_page_metadata(&page, &images, selector, engine);
    let path = metadata_path(output_dir, page_num);
    let target = path.clone();
    tokio::task::spawn_blocking(move || storage::write_json_atomic(&target, &doc))
        .await
        .context("metadata write task join")??;
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub state: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
    pub summary: JobSummary,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTotals {
    pub pages: BTreeMap<String, u32>,
    pub images: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPage {
    pub page_num: u32,
    pub page_url: String,
    pub source_id: String,
    pub status: String,
    pub upper_bound: Option<u32>,
    pub image_count: Option<u32>,
    pub failure_reason: Option<String>,
    pub metadata_path: Option<String>,
    #[serde(flatten)]
    pub gallery: GalleryMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExport {
    pub generated_at: i64,
    pub job: JobInfo,
    pub totals: ExportTotals,
    pub pages: Vec<ExportedPage>,
}

/// Build the job-level export. `output_dir` locates page metadata files;
/// pages whose document does not exist get `metadata_path: null`.
pub async fn build_job_export(store: &StateStore, job_id: &str, output_dir: &Path) -> Result<JobExport> {
    store.flush().await?;
    let job = store
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {} not found", job_id))?;
    let config = serde_json::from_str(&job.config_json).unwrap_or(serde_json::Value::Null);

    let pages = store
        .list_pages(job_id)
        .await?
        .into_iter()
        .map(|p| {
            let path = metadata_path(output_dir, p.page_num);
            ExportedPage {
                page_num: p.page_num,
                page_url: p.source_url,
                source_id: p.source_id,
                status: p.state.as_str().to_string(),
                upper_bound: p.expansion.map(|e| e.upper_bound),
                image_count: p.image_count,
                failure_reason: p.failure_reason,
                metadata_path: path.exists().then(|| path.to_string_lossy().into_owned()),
                gallery: p
                    .meta_json
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default(),
            }
        })
        .collect();

    Ok(JobExport {
        generated_at: crate::state::unix_timestamp(),
        job: JobInfo {
            job_id: job.job_id,
            state: job.state.as_str().to_string(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            summary: job.summary,
            config,
        },
        totals: ExportTotals {
            pages: store.page_state_counts(job_id).await?,
            images: store.image_state_counts(job_id).await?,
        },
        pages,
    })
}

/// Write the job export atomically to `output`.
pub async fn export_job_metadata(
    store: &StateStore,
    job_id: &str,
    output_dir: &Path,
    output: &Path,
) -> Result<PathBuf> {
    let doc = build_job_export(store, job_id, output_dir).await?;
    let target = output.to_path_buf();
    tokio::task::spawn_blocking(move || storage::write_json_atomic(&target, &doc))
        .await
        .context("export write task join")??;
    tracing::info!(job_id, path = %output.display(), "job metadata exported");
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ImageKey, PageExpansion, PageState};

    fn page() -> PageRecord {
        PageRecord {
            job_id: "job_1".into(),
            page_num: 4,
            state: PageState::CompletedWithFailures,
            source_url: "https://x/g/4.html".into(),
            source_id: "4".into(),
            expansion: Some(PageExpansion {
                upper_bound: 3,
                seed_width: 3,
                extension: "jpg".into(),
                index_base: 1,
            }),
            image_count: Some(3),
            meta_json: Some(r#"{"title":"Set","tags":["a"]}"#.into()),
            engine: None,
            failure_reason: None,
            started_at: Some(100),
            updated_at: 112,
            finished_at: Some(112),
        }
    }

    fn image(index: u32, state: ImageState) -> ImageRecord {
        ImageRecord {
            key: ImageKey::new("job_1", 4, index),
            url: format!("https://x/i/{:03}.jpg", index),
            local_path: format!("/out/000004/{:03}.jpg", index),
            state,
            http_status: Some(200),
            sha256: None,
            size_bytes: None,
            retries: 0,
            error: None,
            created_at: 100,
            updated_at: 100,
            finished_at: None,
        }
    }

    #[test]
    fn page_document_fields() {
        let images = vec![
            image(1, ImageState::Completed),
            image(2, ImageState::Failed),
            image(3, ImageState::Completed),
        ];
        let doc = build_page_metadata(&page(), &images, "div.gallerypic img", "http");
        assert_eq!(doc.summary.total_count, 3);
        assert_eq!(doc.summary.success_count, 2);
        assert_eq!(doc.summary.failed_count, 1);
        assert_eq!(doc.summary.status, "completed_with_failures");
        assert_eq!(doc.summary.duration_sec, 12.0);
        assert_eq!(doc.gallery.title, "Set");
        assert_eq!(doc.images[1].file_name, "002.jpg");

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["title"], "Set");
        assert_eq!(json["tags"][0], "a");
        assert_eq!(json["engine"], "http");
        assert_eq!(json["summary"]["total_count"], 3);
    }

    #[test]
    fn recorded_engine_wins_over_caller_engine() {
        let mut page = page();
        page.engine = Some("browser".into());
        let doc = build_page_metadata(&page, &[], "img", "http");
        assert_eq!(doc.engine, "browser");
    }

    #[test]
    fn metadata_lives_in_page_dir() {
        assert_eq!(
            metadata_path(Path::new("/out"), 12),
            PathBuf::from("/out/000012/metadata.json")
        );
    }
}
