//! HTML extraction: image URLs, upper-bound text and gallery fields.
//!
//! Selectors are compiled once per job by [`Extractor::new`]; an invalid
//! selector is a configuration error, not a page failure.

mod meta;

pub use meta::GalleryMeta;

use scraper::{Html, Selector};
use std::fmt;

use meta::{element_text, MetaSelectors};

/// A configured CSS selector that does not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractError {
    pub selector: String,
    pub message: String,
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CSS selector {:?}: {}", self.selector, self.message)
    }
}

impl std::error::Error for ExtractError {}

pub(crate) fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Everything the pipeline needs from one fetched page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtract {
    /// Resolved image URLs in DOM order.
    pub image_urls: Vec<String>,
    /// Text of the first upper-bound match that contains a digit (else the first match).
    pub upper_bound_text: Option<String>,
    pub meta: GalleryMeta,
}

pub struct Extractor {
    images: Selector,
    count: Selector,
    meta: MetaSelectors,
}

impl Extractor {
    pub fn new(image_selector: &str, count_selector: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            images: compile(image_selector)?,
            count: compile(count_selector)?,
            meta: MetaSelectors::new()?,
        })
    }

    /// Parse `html` fetched from `page_url`.
    pub fn extract(&self, html: &str, page_url: &str) -> PageExtract {
        let doc = Html::parse_document(html);
        let base = url::Url::parse(page_url).ok();

        let image_urls = doc
            .select(&self.images)
            .filter_map(|img| img.value().attr("src"))
            .map(str::trim)
            .filter(|src| !src.is_empty())
            .filter_map(|src| resolve_src(base.as_ref(), src))
            .collect();

        let counts: Vec<String> = doc.select(&self.count).map(element_text).collect();
        let upper_bound_text = counts
            .iter()
            .find(|t| t.chars().any(|c| c.is_ascii_digit()))
            .or_else(|| counts.first())
            .cloned();

        PageExtract {
            image_urls,
            upper_bound_text,
            meta: self.meta.extract(&doc),
        }
    }
}

fn resolve_src(base: Option<&url::Url>, src: &str) -> Option<String> {
    let joined = match base {
        Some(b) => b.join(src).ok()?,
        None => url::Url::parse(src).ok()?,
    };
    Some(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://site.example/gallery/9.html";

    fn extractor() -> Extractor {
        Extractor::new("div.gallerypic img", "#tishi p span").unwrap()
    }

    #[test]
    fn image_urls_keep_dom_order_and_resolve() {
        let html = r#"
        <div class="gallerypic">
          <img src="/img/002.jpg" />
          <img src="" />
          <img alt="no src" />
          <img src="/img/001.jpg" />
          <img src="https://cdn.example.com/003.jpg" />
        </div>
        <img src="/outside.jpg" />"#;
        let out = extractor().extract(html, PAGE);
        assert_eq!(
            out.image_urls,
            vec![
                "https://site.example/img/002.jpg",
                "https://site.example/img/001.jpg",
                "https://cdn.example.com/003.jpg",
            ]
        );
    }

    #[test]
    fn upper_bound_text_from_count_selector() {
        let html = r#"<div id="tishi"><p>全本<span>61</span>张图片，欣赏完整作品</p></div>"#;
        let out = extractor().extract(html, PAGE);
        assert_eq!(out.upper_bound_text.as_deref(), Some("61"));
        assert_eq!(
            crate::sequence::parse_upper_bound(out.upper_bound_text.as_deref()),
            Some(61)
        );
    }

    #[test]
    fn upper_bound_absent() {
        let out = extractor().extract("<html><body><div>no count</div></body></html>", PAGE);
        assert_eq!(out.upper_bound_text, None);
        assert!(out.image_urls.is_empty());
    }

    #[test]
    fn invalid_selector_is_an_error() {
        let err = Extractor::new("div[", "#tishi").err().unwrap();
        assert_eq!(err.selector, "div[");
    }
}
