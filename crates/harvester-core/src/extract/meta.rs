//! Gallery descriptive fields (title, date, tags, people).

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use super::{compile, ExtractError};

/// Page-level descriptive fields written into the page metadata document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryMeta {
    pub title: String,
    pub published_date: String,
    pub tags: Vec<String>,
    pub organizations: Vec<String>,
    pub models: Vec<String>,
}

impl GalleryMeta {
    pub fn is_empty(&self) -> bool {
        self == &GalleryMeta::default()
    }
}

pub(super) struct MetaSelectors {
    title: Selector,
    paragraph: Selector,
    tag: Selector,
    person_block: Selector,
    person_name: Selector,
    org_marker: Selector,
    model_marker: Selector,
}

const ORG_CLASS: &str = "gallery_chuangzuo";
const MODEL_CLASS: &str = "gallery_chujing";

impl MetaSelectors {
    pub(super) fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            title: compile(".gallery_jieshao h1")?,
            paragraph: compile(".gallery_jieshao p")?,
            tag: compile(".gallery_jieshao p a")?,
            person_block: compile(".gallery_nav .gallery_renwu")?,
            person_name: compile(".gallery_renwu_title a")?,
            org_marker: compile(".gallery_chuangzuo")?,
            model_marker: compile(".gallery_chujing")?,
        })
    }

    pub(super) fn extract(&self, doc: &Html) -> GalleryMeta {
        let mut meta = GalleryMeta {
            title: doc
                .select(&self.title)
                .map(element_text)
                .find(|t| !t.is_empty())
                .unwrap_or_default(),
            published_date: doc
                .select(&self.paragraph)
                .find_map(|p| find_date(&element_text(p)))
                .unwrap_or_default(),
            ..GalleryMeta::default()
        };

        for tag in doc.select(&self.tag).map(element_text) {
            push_unique(&mut meta.tags, tag);
        }

        for block in doc.select(&self.person_block) {
            let target = if self.marks(block, ORG_CLASS, &self.org_marker) {
                &mut meta.organizations
            } else if self.marks(block, MODEL_CLASS, &self.model_marker) {
                &mut meta.models
            } else {
                continue;
            };
            for name in block.select(&self.person_name).map(element_text) {
                push_unique(target, name);
            }
        }

        meta
    }

    fn marks(&self, block: ElementRef<'_>, class: &str, marker: &Selector) -> bool {
        block.value().classes().any(|c| c == class) || block.select(marker).next().is_some()
    }
}

/// Whitespace-normalized text content of an element.
pub(super) fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

fn take_digits(chars: &[char], from: usize, min: usize, max: usize) -> Option<usize> {
    let n = chars[from..]
        .iter()
        .take(max)
        .take_while(|c| c.is_ascii_digit())
        .count();
    (n >= min).then_some(from + n)
}

/// First `YYYY-M-D` style date in `text`; `-`, `.`, `/` and `年月日` separators.
pub(super) fn find_date(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    for start in 0..chars.len() {
        if start > 0 && chars[start - 1].is_ascii_digit() {
            continue;
        }
        let Some(year_end) = take_digits(&chars, start, 4, 4) else {
            continue;
        };
        if year_end < chars.len() && chars[year_end].is_ascii_digit() {
            continue;
        }
        let sep1 = chars.get(year_end).copied();
        if !matches!(sep1, Some('-' | '.' | '/' | '年')) {
            continue;
        }
        let Some(month_end) = take_digits(&chars, year_end + 1, 1, 2) else {
            continue;
        };
        let sep2 = chars.get(month_end).copied();
        if !matches!(sep2, Some('-' | '.' | '/' | '月')) {
            continue;
        }
        let Some(mut end) = take_digits(&chars, month_end + 1, 1, 2) else {
            continue;
        };
        if chars.get(end) == Some(&'日') {
            end += 1;
        }
        return Some(chars[start..end].iter().collect());
    }
    None
}
