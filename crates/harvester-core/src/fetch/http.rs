//! libcurl transport for pages and images.
//!
//! Each call builds its own `Easy` handle on a blocking thread.

use async_trait::async_trait;
use std::time::Duration;

use super::{FetchedBytes, FetchedPage, ImageTransport, PageFetcher};
use crate::retry::TransportError;

const USER_AGENT: &str = concat!("harvester/", env!("CARGO_PKG_VERSION"));
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_REDIRECTS: u32 = 10;

/// Blocking GET returning `(status, body)`. Non-2xx statuses are errors.
pub fn get_blocking(url: &str, timeout: Duration) -> Result<FetchedBytes, TransportError> {
    let mut body: Vec<u8> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.max_redirections(MAX_REDIRECTS)?;
    easy.connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))?;
    easy.timeout(timeout)?;
    easy.useragent(USER_AGENT)?;
    // Empty string enables every encoding libcurl was built with.
    easy.accept_encoding("")?;

    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform()?;
    }

    let code = easy.response_code()?;
    let status = u16::try_from(code).unwrap_or(0);
    if !(200..300).contains(&status) {
        return Err(TransportError::Http(status));
    }
    Ok(FetchedBytes {
        bytes: body,
        status,
    })
}

async fn get(url: &str, timeout: Duration) -> Result<FetchedBytes, TransportError> {
    let url = url.to_string();
    tokio::task::spawn_blocking(move || get_blocking(&url, timeout))
        .await
        .map_err(|e| TransportError::Other(format!("transfer task join: {}", e)))?
}

/// Plain HTTP page fetcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurlPageFetcher;

#[async_trait]
impl PageFetcher for CurlPageFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<FetchedPage, TransportError> {
        let fetched = get(url, timeout).await?;
        Ok(FetchedPage {
            html: String::from_utf8_lossy(&fetched.bytes).into_owned(),
            status: fetched.status,
        })
    }
}

/// Image transport over libcurl.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurlImageTransport;

#[async_trait]
impl ImageTransport for CurlImageTransport {
    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> Result<FetchedBytes, TransportError> {
        get(url, timeout).await
    }
}
