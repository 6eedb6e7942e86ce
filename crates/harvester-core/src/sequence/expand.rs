//! Expansion of a captured template into the page's full image list.

use super::bound::parse_upper_bound;
use super::seed::{detect_seed, numbers_matching, SequenceTemplate};
use super::SequenceError;

/// Where the expansion's image count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundSource {
    /// Parsed from the page's upper-bound selector.
    Declared,
    /// Highest index seen in the DOM (upper bound not required and absent).
    Inferred,
}

/// Fully expanded image list for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub template: SequenceTemplate,
    /// First index of the sequence: 0 when the DOM shows a `0` item, else 1.
    pub index_base: u32,
    /// Declared (or inferred) image count.
    pub upper_bound: u32,
    pub bound_source: BoundSource,
    /// `upper_bound` URLs in ascending index order.
    pub urls: Vec<String>,
}

impl Expansion {
    /// Index of the item at position `position` (0-based) in `urls`.
    pub fn index_at(&self, position: usize) -> u32 {
        self.index_base + position as u32
    }

    /// One index past the end of the sequence.
    pub fn probe_url(&self) -> String {
        self.template
            .url_for(self.index_base.saturating_add(self.upper_bound))
    }
}

/// Expand `template` over `count` indices starting at `index_base`.
pub fn expand(template: &SequenceTemplate, index_base: u32, count: u32) -> Vec<String> {
    (0..count)
        .map(|offset| template.url_for(index_base.saturating_add(offset)))
        .collect()
}

/// Resolve a page's extracted image URLs and raw upper-bound text into its
/// full image list.
///
/// The result always holds exactly `upper_bound` URLs, independent of how many
/// images the DOM showed.
pub fn resolve(
    image_urls: &[String],
    upper_bound_text: Option<&str>,
    require_upper_bound: bool,
) -> Result<Expansion, SequenceError> {
    let seed = detect_seed(image_urls).ok_or(SequenceError::SeedNotFound)?;
    let seen = numbers_matching(image_urls, &seed.template);
    let index_base = if seen.contains(&0) { 0 } else { 1 };

    let (upper_bound, bound_source) = match parse_upper_bound(upper_bound_text) {
        Some(n) => (n, BoundSource::Declared),
        None if require_upper_bound => return Err(SequenceError::UpperBoundMissing),
        None => {
            let max_seen = seen.iter().copied().max().unwrap_or(seed.number);
            let count = max_seen.saturating_add(1) - index_base;
            if count == 0 {
                return Err(SequenceError::UpperBoundMissing);
            }
            (count, BoundSource::Inferred)
        }
    };

    let urls = expand(&seed.template, index_base, upper_bound);
    Ok(Expansion {
        template: seed.template,
        index_base,
        upper_bound,
        bound_source,
        urls,
    })
}
