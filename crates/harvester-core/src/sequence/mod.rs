//! Sequence resolution: seed detection, upper-bound parsing and expansion.
//!
//! A gallery page shows a few numbered images (`.../001.jpg`) and declares
//! its total image count somewhere in the markup. The resolver turns those
//! two facts into the complete, ordered list of image URLs for the page.

mod bound;
mod expand;
mod seed;

pub use bound::parse_upper_bound;
pub use expand::{expand, resolve, BoundSource, Expansion};
pub use seed::{detect_seed, match_seed, numbers_matching, SeedMatch, SequenceTemplate};

use std::fmt;

/// Structural reasons a page cannot be expanded. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// No extracted URL has a `<digits>.<ext>` file name.
    SeedNotFound,
    /// The upper-bound selector yielded no positive integer.
    UpperBoundMissing,
}

impl SequenceError {
    /// Event kind recorded when a page fails for this reason.
    pub fn event_kind(self) -> &'static str {
        match self {
            SequenceError::SeedNotFound => "seed_not_found",
            SequenceError::UpperBoundMissing => "upper_bound_missing",
        }
    }
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceError::SeedNotFound => write!(f, "no numbered seed image URL found"),
            SequenceError::UpperBoundMissing => write!(f, "upper bound missing or not numeric"),
        }
    }
}

impl std::error::Error for SequenceError {}
