//! Run configuration: one immutable, validated value per job.
//!
//! Loaded from TOML (`~/.config/harvester/config.toml` by default), merged with
//! CLI overrides by the caller, then validated once before the job starts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the page number in `url_template`.
pub const NUM_PLACEHOLDER: &str = "{num}";

/// Longest accepted timeout or backoff, in seconds.
pub const MAX_DURATION_SEC: f64 = 86_400.0;
/// Accepted `requests_per_sec` range.
pub const REQUESTS_PER_SEC_RANGE: (f64, f64) = (0.001, 10_000.0);

/// Page fetch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Plain HTTP GET through libcurl.
    #[default]
    Http,
    /// Headless browser that renders the page and dumps the DOM.
    Browser,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Http => "http",
            Engine::Browser => "browser",
        }
    }
}

impl std::str::FromStr for Engine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Engine::Http),
            "browser" => Ok(Engine::Browser),
            other => Err(ConfigError::UnknownEngine(other.to_string())),
        }
    }
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("url_template must contain the '{{num}}' placeholder")]
    MissingPlaceholder,
    #[error("end_num ({end}) must be >= start_num ({start})")]
    InvalidRange { start: u32, end: u32 },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be >= {min}")]
    TooSmall { field: &'static str, min: u64 },
    #[error("{field} must be a positive number")]
    NotPositive { field: &'static str },
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: &'static str, min: f64, max: f64 },
    #[error("backoff_max_sec must be >= backoff_base_sec")]
    BackoffOrder,
    #[error("unknown engine '{0}' (expected http or browser)")]
    UnknownEngine(String),
}

/// Runtime configuration for a harvesting job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Page URL template containing `{num}`.
    pub url_template: String,
    /// First page number (inclusive).
    pub start_num: u32,
    /// Last page number (inclusive). `None` = open-ended, stop on consecutive failures.
    pub end_num: Option<u32>,
    /// CSS selector for gallery images; their `src` attributes seed the sequence.
    pub selector: String,
    /// CSS selector whose text holds the declared image count.
    pub sequence_count_selector: String,
    /// Fail the page when the upper bound cannot be read.
    pub sequence_require_upper_bound: bool,
    /// After the declared range, try index `upper_bound + 1` once and record the result.
    pub sequence_probe_after_upper_bound: bool,
    /// Root directory for per-page output directories.
    pub output_dir: PathBuf,
    /// SQLite state database.
    pub state_db: PathBuf,
    /// Primary page fetch engine.
    pub engine: Engine,
    /// Engine used to re-fetch a page whose primary fetch yielded zero image URLs.
    pub fallback_engine: Option<Engine>,
    /// Browser executable used by `Engine::Browser`.
    pub browser_command: String,
    /// Resume an existing job with the same fingerprint (false = reset it).
    pub resume: bool,
    pub page_timeout_sec: f64,
    pub image_timeout_sec: f64,
    /// Retries after the first page fetch attempt.
    pub page_retries: u32,
    /// Retries after the first image fetch attempt.
    pub image_retries: u32,
    /// Steady-state request rate shared by every fetch in the process.
    pub requests_per_sec: f64,
    /// Token bucket capacity.
    pub burst: u32,
    pub backoff_base_sec: f64,
    pub backoff_max_sec: f64,
    /// Concurrent pages when `end_num` is set (open-ended ranges are always sequential).
    pub page_workers: usize,
    /// Concurrent image downloads across the whole job.
    pub image_workers: usize,
    /// Keep downloading a page's remaining images after one fails.
    pub continue_on_image_failure: bool,
    pub stop_after_consecutive_page_failures: u32,
    /// Flush the state write buffer after this many buffered rows...
    pub flush_rows: usize,
    /// ...or after this many milliseconds, whichever comes first.
    pub flush_interval_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            url_template: String::new(),
            start_num: 1,
            end_num: None,
            selector: "div.gallerypic img".to_string(),
            sequence_count_selector: "#tishi p span".to_string(),
            sequence_require_upper_bound: true,
            sequence_probe_after_upper_bound: false,
            output_dir: PathBuf::from("data/downloads"),
            state_db: PathBuf::from("data/state.sqlite3"),
            engine: Engine::Http,
            fallback_engine: None,
            browser_command: "chromium".to_string(),
            resume: true,
            page_timeout_sec: 20.0,
            image_timeout_sec: 30.0,
            page_retries: 2,
            image_retries: 3,
            requests_per_sec: 5.0,
            burst: 10,
            backoff_base_sec: 0.5,
            backoff_max_sec: 8.0,
            page_workers: 2,
            image_workers: 4,
            continue_on_image_failure: true,
            stop_after_consecutive_page_failures: 5,
            flush_rows: 64,
            flush_interval_ms: 500,
        }
    }
}

/// Fields that identify a job across runs. Order is the serialization order.
#[derive(Serialize)]
struct JobIdentity<'a> {
    url_template: &'a str,
    start_num: u32,
    end_num: Option<u32>,
    selector: &'a str,
    sequence_count_selector: &'a str,
    sequence_require_upper_bound: bool,
    sequence_probe_after_upper_bound: bool,
    output_dir: String,
    engine: Engine,
}

impl RunConfig {
    /// Config with defaults for everything except the template and start page.
    pub fn new(url_template: impl Into<String>, start_num: u32) -> Self {
        Self {
            url_template: url_template.into(),
            start_num,
            ..Self::default()
        }
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        toml::from_str(data).context("parse run config TOML")
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("in {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("parse stored run config JSON")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize run config")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.url_template.contains(NUM_PLACEHOLDER) {
            return Err(ConfigError::MissingPlaceholder);
        }
        if let Some(end) = self.end_num {
            if end < self.start_num {
                return Err(ConfigError::InvalidRange {
                    start: self.start_num,
                    end,
                });
            }
        }
        if self.selector.trim().is_empty() {
            return Err(ConfigError::Empty { field: "selector" });
        }
        if self.sequence_count_selector.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "sequence_count_selector",
            });
        }
        if self.uses_engine(Engine::Browser) && self.browser_command.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "browser_command",
            });
        }
        for (field, value) in [
            ("page_timeout_sec", self.page_timeout_sec),
            ("image_timeout_sec", self.image_timeout_sec),
            ("requests_per_sec", self.requests_per_sec),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if !(self.backoff_base_sec.is_finite() && self.backoff_base_sec >= 0.0) {
            return Err(ConfigError::NotPositive {
                field: "backoff_base_sec",
            });
        }
        if !self.backoff_max_sec.is_finite() || self.backoff_max_sec < self.backoff_base_sec {
            return Err(ConfigError::BackoffOrder);
        }
        for (field, value) in [
            ("page_timeout_sec", self.page_timeout_sec),
            ("image_timeout_sec", self.image_timeout_sec),
            ("backoff_base_sec", self.backoff_base_sec),
            ("backoff_max_sec", self.backoff_max_sec),
        ] {
            if value > MAX_DURATION_SEC {
                return Err(ConfigError::OutOfRange {
                    field,
                    min: 0.0,
                    max: MAX_DURATION_SEC,
                });
            }
        }
        let (min_rate, max_rate) = REQUESTS_PER_SEC_RANGE;
        if !(min_rate..=max_rate).contains(&self.requests_per_sec) {
            return Err(ConfigError::OutOfRange {
                field: "requests_per_sec",
                min: min_rate,
                max: max_rate,
            });
        }
        for (field, value, min) in [
            ("burst", self.burst as u64, 1),
            ("page_workers", self.page_workers as u64, 1),
            ("image_workers", self.image_workers as u64, 1),
            (
                "stop_after_consecutive_page_failures",
                self.stop_after_consecutive_page_failures as u64,
                1,
            ),
            ("flush_rows", self.flush_rows as u64, 1),
            ("flush_interval_ms", self.flush_interval_ms, 1),
        ] {
            if value < min {
                return Err(ConfigError::TooSmall { field, min });
            }
        }
        Ok(())
    }

    /// Stable job fingerprint: `job_` + first 16 hex chars of SHA-256 over the identity fields.
    pub fn job_id(&self) -> String {
        let identity = JobIdentity {
            url_template: &self.url_template,
            start_num: self.start_num,
            end_num: self.end_num,
            selector: &self.selector,
            sequence_count_selector: &self.sequence_count_selector,
            sequence_require_upper_bound: self.sequence_require_upper_bound,
            sequence_probe_after_upper_bound: self.sequence_probe_after_upper_bound,
            output_dir: self.output_dir.to_string_lossy().into_owned(),
            engine: self.engine,
        };
        // Serializing a struct of strings, numbers and bools cannot fail.
        let raw = serde_json::to_string(&identity).unwrap_or_default();
        let digest = Sha256::digest(raw.as_bytes());
        format!("job_{}", &hex::encode(digest)[..16])
    }

    /// Page URL for `num`.
    pub fn page_url(&self, num: u32) -> String {
        self.url_template.replace(NUM_PLACEHOLDER, &num.to_string())
    }

    pub fn is_open_ended(&self) -> bool {
        self.end_num.is_none()
    }

    pub fn uses_engine(&self, engine: Engine) -> bool {
        self.engine == engine || self.fallback_engine == Some(engine)
    }

    pub fn page_timeout(&self) -> Duration {
        secs(self.page_timeout_sec)
    }

    pub fn image_timeout(&self) -> Duration {
        secs(self.image_timeout_sec)
    }

    pub fn backoff_base(&self) -> Duration {
        secs(self.backoff_base_sec)
    }

    pub fn backoff_max(&self) -> Duration {
        secs(self.backoff_max_sec)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Seconds to a `Duration`, clamped to `[0, MAX_DURATION_SEC]`; NaN reads as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_DURATION_SEC)).unwrap_or_default()
}

/// Default config file path: `~/.config/harvester/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("harvester")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load the run config at `path`, or the default file if `path` is `None`.
/// A missing default file yields the built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<RunConfig> {
    if let Some(path) = path {
        return RunConfig::load_from_path(path);
    }
    let path = default_config_path()?;
    if !path.exists() {
        tracing::debug!("no config at {}, using defaults", path.display());
        return Ok(RunConfig::default());
    }
    RunConfig::load_from_path(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RunConfig {
        RunConfig::new("https://x/g/{num}.html", 1)
    }

    #[test]
    fn default_config_values() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.selector, "div.gallerypic img");
        assert_eq!(cfg.sequence_count_selector, "#tishi p span");
        assert!(cfg.sequence_require_upper_bound);
        assert!(!cfg.sequence_probe_after_upper_bound);
        assert!(cfg.resume);
        assert!(cfg.continue_on_image_failure);
        assert_eq!(cfg.stop_after_consecutive_page_failures, 5);
        assert_eq!(cfg.engine, Engine::Http);
    }

    #[test]
    fn validate_requires_placeholder() {
        let cfg = RunConfig::new("https://x/no-placeholder", 1);
        assert_eq!(cfg.validate(), Err(ConfigError::MissingPlaceholder));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut cfg = valid();
        cfg.start_num = 5;
        cfg.end_num = Some(4);
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidRange { start: 5, end: 4 })
        );
    }

    #[test]
    fn validate_rejects_zero_workers_and_threshold() {
        let mut cfg = valid();
        cfg.image_workers = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooSmall {
                field: "image_workers",
                ..
            })
        ));
        let mut cfg = valid();
        cfg.stop_after_consecutive_page_failures = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_caps_durations_and_rate() {
        let mut cfg = valid();
        cfg.page_timeout_sec = 1e20;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "page_timeout_sec",
                min: 0.0,
                max: MAX_DURATION_SEC,
            })
        );

        let mut cfg = valid();
        cfg.backoff_max_sec = MAX_DURATION_SEC * 2.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "backoff_max_sec", .. })
        ));

        let mut cfg = valid();
        cfg.requests_per_sec = 1e-300;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "requests_per_sec", .. })
        ));

        let mut cfg = valid();
        cfg.image_timeout_sec = MAX_DURATION_SEC;
        cfg.backoff_max_sec = MAX_DURATION_SEC;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.image_timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn duration_accessors_clamp_unvalidated_values() {
        let mut cfg = valid();
        cfg.page_timeout_sec = 1e20;
        cfg.image_timeout_sec = f64::NAN;
        cfg.backoff_base_sec = -1.0;
        assert_eq!(cfg.page_timeout(), Duration::from_secs(86_400));
        assert_eq!(cfg.image_timeout(), Duration::ZERO);
        assert_eq!(cfg.backoff_base(), Duration::ZERO);
    }

    #[test]
    fn validate_rejects_backoff_max_below_base() {
        let mut cfg = valid();
        cfg.backoff_base_sec = 2.0;
        cfg.backoff_max_sec = 1.0;
        assert_eq!(cfg.validate(), Err(ConfigError::BackoffOrder));
    }

    #[test]
    fn toml_partial_file_keeps_defaults() {
        let cfg = RunConfig::from_toml_str(
            r#"
            url_template = "https://x/g/{num}.html"
            start_num = 3
            end_num = 7
            engine = "browser"
            image_workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.start_num, 3);
        assert_eq!(cfg.end_num, Some(7));
        assert_eq!(cfg.engine, Engine::Browser);
        assert_eq!(cfg.image_workers, 8);
        assert_eq!(cfg.page_workers, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn job_id_is_stable_and_ignores_tuning_knobs() {
        let a = valid();
        let mut b = valid();
        b.image_workers = 16;
        b.requests_per_sec = 0.5;
        b.resume = false;
        assert_eq!(a.job_id(), b.job_id());
        assert!(a.job_id().starts_with("job_"));
        assert_eq!(a.job_id().len(), "job_".len() + 16);

        let mut c = valid();
        c.selector = "img.other".to_string();
        assert_ne!(a.job_id(), c.job_id());
    }

    #[test]
    fn page_range_is_part_of_job_id() {
        let mut a = valid();
        a.end_num = Some(1);
        let mut b = a.clone();
        b.end_num = Some(3);
        let mut open = a.clone();
        open.end_num = None;
        let mut later = a.clone();
        later.start_num = 2;
        later.end_num = Some(3);

        let ids = [a.job_id(), b.job_id(), open.job_id(), later.job_id()];
        for (i, x) in ids.iter().enumerate() {
            for y in &ids[i + 1..] {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    fn json_roundtrip_preserves_config() {
        let mut cfg = valid();
        cfg.fallback_engine = Some(Engine::Browser);
        let parsed = RunConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn page_url_substitutes_number() {
        assert_eq!(valid().page_url(42), "https://x/g/42.html");
    }

    #[test]
    fn engine_parses_case_insensitively() {
        assert_eq!("HTTP".parse::<Engine>().unwrap(), Engine::Http);
        assert_eq!("browser".parse::<Engine>().unwrap(), Engine::Browser);
        assert!("playwright".parse::<Engine>().is_err());
    }
}
