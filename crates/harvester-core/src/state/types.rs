//! Row types and state machines stored in the harvester database.

use std::str::FromStr;

use super::StoreError;

macro_rules! state_strings {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(StoreError::UnknownState {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Job state machine: `pending → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

state_strings!(JobState, "job", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Forward-only transitions. `running → running` is allowed so a stopped
    /// job can be picked up again.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Page state machine:
/// `pending → running → {completed, completed_with_failures, no_images, failed_fetch}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    Pending,
    Running,
    Completed,
    CompletedWithFailures,
    NoImages,
    FailedFetch,
}

state_strings!(PageState, "page", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    CompletedWithFailures => "completed_with_failures",
    NoImages => "no_images",
    FailedFetch => "failed_fetch",
});

impl PageState {
    pub const TERMINAL: [PageState; 4] = [
        PageState::Completed,
        PageState::CompletedWithFailures,
        PageState::NoImages,
        PageState::FailedFetch,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(self, PageState::Pending | PageState::Running)
    }

    /// Pages that count toward the consecutive-failure stopping rule.
    pub fn is_unproductive(self) -> bool {
        matches!(self, PageState::NoImages | PageState::FailedFetch)
    }
}

/// Image state machine: `pending → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    Pending,
    Running,
    Completed,
    Failed,
}

state_strings!(ImageState, "image", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl ImageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageState::Completed | ImageState::Failed)
    }
}

/// Counters stored on the job row when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobSummary {
    pub pages_total: u32,
    pub pages_completed: u32,
    pub pages_with_failures: u32,
    pub pages_no_images: u32,
    pub pages_failed: u32,
    pub images_total: u32,
    pub images_completed: u32,
    pub images_failed: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub config_json: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
    pub summary: JobSummary,
}

/// Expansion facts fixed the first time a page is expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageExpansion {
    pub upper_bound: u32,
    pub seed_width: u32,
    pub extension: String,
    pub index_base: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub job_id: String,
    pub page_num: u32,
    pub state: PageState,
    pub source_url: String,
    pub source_id: String,
    /// Set once the page has been expanded; never changes afterwards.
    pub expansion: Option<PageExpansion>,
    pub image_count: Option<u32>,
    pub meta_json: Option<String>,
    /// Engine whose DOM the page was extracted from.
    pub engine: Option<String>,
    pub failure_reason: Option<String>,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

/// Identity of one image row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub job_id: String,
    pub page_num: u32,
    pub image_index: u32,
}

impl ImageKey {
    pub fn new(job_id: impl Into<String>, page_num: u32, image_index: u32) -> Self {
        Self {
            job_id: job_id.into(),
            page_num,
            image_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub key: ImageKey,
    pub url: String,
    pub local_path: String,
    pub state: ImageState,
    pub http_status: Option<u16>,
    pub sha256: Option<String>,
    pub size_bytes: Option<u64>,
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

/// Image row inserted when a page is expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub image_index: u32,
    pub url: String,
    pub local_path: String,
}

/// Terminal result of one image attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResult {
    pub state: ImageState,
    pub http_status: Option<u16>,
    pub sha256: Option<String>,
    pub size_bytes: Option<u64>,
    pub retries: u32,
    pub error: Option<String>,
}

impl ImageResult {
    pub fn completed(http_status: Option<u16>, sha256: String, size_bytes: u64, retries: u32) -> Self {
        Self {
            state: ImageState::Completed,
            http_status,
            sha256: Some(sha256),
            size_bytes: Some(size_bytes),
            retries,
            error: None,
        }
    }

    pub fn failed(http_status: Option<u16>, retries: u32, error: impl Into<String>) -> Self {
        Self {
            state: ImageState::Failed,
            http_status,
            sha256: None,
            size_bytes: None,
            retries,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: i64,
    pub job_id: String,
    pub page_num: Option<u32>,
    pub image_index: Option<u32>,
    pub kind: String,
    pub detail: String,
    pub created_at: i64,
}

/// Event to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub job_id: String,
    pub page_num: Option<u32>,
    pub image_index: Option<u32>,
    pub kind: &'static str,
    pub detail: String,
}

impl NewEvent {
    pub fn job(job_id: &str, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            page_num: None,
            image_index: None,
            kind,
            detail: detail.into(),
        }
    }

    pub fn page(job_id: &str, page_num: u32, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            page_num: Some(page_num),
            ..Self::job(job_id, kind, detail)
        }
    }

    pub fn image(key: &ImageKey, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            page_num: Some(key.page_num),
            image_index: Some(key.image_index),
            ..Self::job(&key.job_id, kind, detail)
        }
    }
}

/// Resume frontier reconstructed once at job start from durable rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontier {
    /// Pages already terminal, in page order.
    pub terminal: Vec<(u32, PageState)>,
    /// Non-terminal pages, in page order.
    pub open_pages: Vec<PageRecord>,
    /// Highest page number with any row.
    pub max_page_num: Option<u32>,
}

impl Frontier {
    pub fn terminal_state(&self, page_num: u32) -> Option<PageState> {
        self.terminal
            .binary_search_by_key(&page_num, |(n, _)| *n)
            .ok()
            .map(|i| self.terminal[i].1)
    }

    pub fn open_page(&self, page_num: u32) -> Option<&PageRecord> {
        self.open_pages.iter().find(|p| p.page_num == page_num)
    }
}
