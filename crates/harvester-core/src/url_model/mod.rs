//! Output naming: page directories, image file names and page source ids.
//!
//! Every page gets its own directory under the output root, so workers on
//! different pages never touch the same files.

mod path;
mod sanitize;

pub use path::{first_digit_run, last_path_segment};
pub use sanitize::sanitize_file_name;

/// File name used when an image URL yields nothing usable.
const DEFAULT_IMAGE_NAME: &str = "image.bin";

/// Directory name for a page: the page number zero-padded to six digits.
pub fn page_dir_name(page_num: u32) -> String {
    format!("{:06}", page_num)
}

/// Local file name for an image: the sanitized, percent-decoded basename of
/// the URL path, or `image.bin`.
///
/// # Examples
///
/// - `image_file_name("https://x/g/1/001.jpg")` → `"001.jpg"`
/// - `image_file_name("https://x/")` → `"image.bin"`
pub fn image_file_name(url: &str) -> String {
    let sanitized = last_path_segment(url)
        .map(|s| sanitize_file_name(&s))
        .unwrap_or_default();
    if sanitized.is_empty() {
        DEFAULT_IMAGE_NAME.to_string()
    } else {
        sanitized
    }
}

/// Source id of a gallery page: the first digit run of the page URL's last
/// path segment, or the page number when there is none.
pub fn source_id_from_page_url(page_url: &str, page_num: u32) -> String {
    last_path_segment(page_url)
        .as_deref()
        .and_then(first_digit_run)
        .map(str::to_string)
        .unwrap_or_else(|| page_num.to_string())
}
