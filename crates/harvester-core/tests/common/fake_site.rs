//! In-process gallery site: scripted pages and images behind the transport traits.

use async_trait::async_trait;
use harvester_core::control::StopSignal;
use harvester_core::fetch::{FetchedBytes, FetchedPage, ImageTransport, PageFetcher};
use harvester_core::retry::TransportError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn page_url(num: u32) -> String {
    super::TEMPLATE.replace("{num}", &num.to_string())
}

pub fn image_url(page: u32, index: u32) -> String {
    format!("https://img.gallery.test/a/{}/{:03}.jpg", page, index)
}

pub fn image_body(url: &str) -> Vec<u8> {
    format!("jpeg bytes of {}", url).into_bytes()
}

/// Gallery page showing `shown` seed images and declaring `bound_text`.
pub fn gallery_html(page: u32, shown: &[u32], bound_text: &str) -> String {
    let imgs: String = shown
        .iter()
        .map(|i| format!(r#"<img src="{}">"#, image_url(page, *i)))
        .collect();
    format!(
        r#"<html><body>
<div class="gallery_jieshao"><h1>Set {page}</h1><p>2024-05-01</p><p><a>portrait</a><a>studio</a></p></div>
<div id="tishi"><p>total <span>{bound_text}</span> images</p></div>
<div class="gallerypic">{imgs}</div>
</body></html>"#
    )
}

/// Page whose gallery has no images at all.
pub fn empty_html() -> String {
    r#"<html><body><div class="gallerypic"></div></body></html>"#.to_string()
}

#[derive(Debug, Clone)]
pub enum ImageReply {
    Body(Vec<u8>),
    Status(u16),
    /// One 429, then the body.
    ThrottleOnce(Vec<u8>),
}

#[derive(Default)]
struct SiteState {
    pages: HashMap<String, Result<String, TransportError>>,
    images: HashMap<String, ImageReply>,
    page_hits: HashMap<String, u32>,
    image_hits: HashMap<String, u32>,
    stop_on: Option<(String, StopSignal)>,
}

/// Cheap to clone; clones share the script and hit counters.
#[derive(Clone, Default)]
pub struct FakeSite {
    state: Arc<Mutex<SiteState>>,
    name: &'static str,
}

impl FakeSite {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            name: "fake",
        }
    }

    /// Same script, different engine name.
    pub fn named(&self, name: &'static str) -> Self {
        Self {
            state: Arc::clone(&self.state),
            name,
        }
    }

    pub fn page(&self, num: u32, html: String) {
        self.state.lock().unwrap().pages.insert(page_url(num), Ok(html));
    }

    pub fn page_error(&self, num: u32, err: TransportError) {
        self.state.lock().unwrap().pages.insert(page_url(num), Err(err));
    }

    /// Serve images `1..=count` of `page`.
    pub fn images(&self, page: u32, count: u32) {
        for i in 1..=count {
            let url = image_url(page, i);
            let body = image_body(&url);
            self.image(url, ImageReply::Body(body));
        }
    }

    pub fn image(&self, url: String, reply: ImageReply) {
        self.state.lock().unwrap().images.insert(url, reply);
    }

    /// Raise `stop` when `url` is fetched (the fetch itself still succeeds).
    pub fn stop_when_fetched(&self, url: String, stop: StopSignal) {
        self.state.lock().unwrap().stop_on = Some((url, stop));
    }

    pub fn page_hits(&self, num: u32) -> u32 {
        let s = self.state.lock().unwrap();
        s.page_hits.get(&page_url(num)).copied().unwrap_or(0)
    }

    pub fn image_hits(&self, url: &str) -> u32 {
        let s = self.state.lock().unwrap();
        s.image_hits.get(url).copied().unwrap_or(0)
    }

    pub fn total_image_hits(&self) -> u32 {
        self.state.lock().unwrap().image_hits.values().sum()
    }

    pub fn fetcher(&self) -> Arc<dyn PageFetcher> {
        Arc::new(self.clone())
    }

    pub fn transport(&self) -> Arc<dyn ImageTransport> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl PageFetcher for FakeSite {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_page(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, TransportError> {
        let mut s = self.state.lock().unwrap();
        *s.page_hits.entry(url.to_string()).or_default() += 1;
        match s.pages.get(url) {
            Some(Ok(html)) => Ok(FetchedPage {
                html: html.clone(),
                status: 200,
            }),
            Some(Err(e)) => Err(e.clone()),
            None => Err(TransportError::Http(404)),
        }
    }
}

#[async_trait]
impl ImageTransport for FakeSite {
    async fn fetch_bytes(&self, url: &str, _timeout: Duration) -> Result<FetchedBytes, TransportError> {
        let mut s = self.state.lock().unwrap();
        let hits = {
            let h = s.image_hits.entry(url.to_string()).or_default();
            *h += 1;
            *h
        };
        if let Some((stop_url, stop)) = &s.stop_on {
            if stop_url == url {
                stop.request_stop();
            }
        }
        match s.images.get(url).cloned() {
            Some(ImageReply::Body(bytes)) => Ok(FetchedBytes { bytes, status: 200 }),
            Some(ImageReply::Status(code)) => Err(TransportError::Http(code)),
            Some(ImageReply::ThrottleOnce(bytes)) if hits > 1 => Ok(FetchedBytes { bytes, status: 200 }),
            Some(ImageReply::ThrottleOnce(_)) => Err(TransportError::Http(429)),
            None => Err(TransportError::Http(404)),
        }
    }
}
