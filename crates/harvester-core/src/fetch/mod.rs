//! Pluggable fetch transports.
//!
//! The engine only talks to [`PageFetcher`] and [`ImageTransport`]; the
//! libcurl and headless-browser implementations live here, and tests supply
//! in-process fakes.

mod browser;
mod http;

pub use self::browser::BrowserFetcher;
pub use self::http::{get_blocking, CurlImageTransport, CurlPageFetcher};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Engine, RunConfig};
use crate::retry::TransportError;

/// A fetched HTML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub html: String,
    pub status: u16,
}

/// A fetched binary body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBytes {
    pub bytes: Vec<u8>,
    pub status: u16,
}

/// Fetches a page's HTML within `timeout`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Engine name recorded in events and metadata.
    fn name(&self) -> &'static str;

    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<FetchedPage, TransportError>;
}

/// Fetches an image body within `timeout`.
#[async_trait]
pub trait ImageTransport: Send + Sync {
    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> Result<FetchedBytes, TransportError>;
}

/// Page fetcher for `engine`.
pub fn page_fetcher_for(engine: Engine, cfg: &RunConfig) -> Arc<dyn PageFetcher> {
    match engine {
        Engine::Http => Arc::new(CurlPageFetcher),
        Engine::Browser => Arc::new(BrowserFetcher::new(cfg.browser_command.clone())),
    }
}
