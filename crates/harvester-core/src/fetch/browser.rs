//! Headless-browser page fetcher for JS-rendered galleries.
//!
//! Runs `<command> --headless --dump-dom <url>` and takes stdout as the
//! rendered DOM. Any Chromium-compatible executable works.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;

use super::{FetchedPage, PageFetcher};
use crate::retry::TransportError;

const STDERR_SNIPPET: usize = 200;

#[derive(Debug, Clone)]
pub struct BrowserFetcher {
    command: String,
    extra_args: Vec<String>,
}

impl BrowserFetcher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            extra_args: Vec::new(),
        }
    }

    /// Extra arguments placed before `--dump-dom`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    fn args<'a>(&'a self, url: &'a str) -> Vec<&'a str> {
        let mut args = vec!["--headless", "--disable-gpu"];
        args.extend(self.extra_args.iter().map(String::as_str));
        args.push("--dump-dom");
        args.push(url);
        args
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch_page(&self, url: &str, timeout: Duration) -> Result<FetchedPage, TransportError> {
        let child = tokio::process::Command::new(&self.command)
            .args(self.args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Other(format!("spawn {}: {}", self.command, e)))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|e| TransportError::Other(format!("{}: {}", self.command, e)))?,
            Err(_) => return Err(TransportError::Timeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let snippet: String = stderr.trim().chars().take(STDERR_SNIPPET).collect();
            return Err(TransportError::Other(format!(
                "{} exited with {}: {}",
                self.command, output.status, snippet
            )));
        }

        Ok(FetchedPage {
            html: String::from_utf8_lossy(&output.stdout).into_owned(),
            status: 200,
        })
    }
}
