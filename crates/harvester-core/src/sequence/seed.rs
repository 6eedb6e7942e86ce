//! Seed detection: find a numbered image URL and capture its naming template.

/// Naming template captured from a seed URL: `{prefix}{index:0width}.{extension}{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceTemplate {
    /// Everything up to and including the last `/` of the path.
    pub prefix: String,
    /// Digit count of the seed's number; indices are zero-padded to it.
    pub width: usize,
    pub extension: String,
    /// `?query` of the seed URL, or empty.
    pub suffix: String,
}

impl SequenceTemplate {
    /// URL for one index, zero-padded to the template width.
    pub fn url_for(&self, index: u32) -> String {
        format!(
            "{}{:0width$}.{}{}",
            self.prefix,
            index,
            self.extension,
            self.suffix,
            width = self.width
        )
    }
}

/// A URL that matched the seed shape, with its parsed number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedMatch {
    pub template: SequenceTemplate,
    pub number: u32,
}

fn is_extension(s: &str) -> bool {
    (2..=5).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Match `<prefix>/<digits>.<ext>` on the URL path. Fragments are ignored.
pub fn match_seed(image_url: &str) -> Option<SeedMatch> {
    let mut parsed = url::Url::parse(image_url).ok()?;
    parsed.set_fragment(None);
    let suffix = parsed.query().map(|q| format!("?{}", q)).unwrap_or_default();
    parsed.set_query(None);

    let path = parsed.path();
    let slash = path.rfind('/')?;
    let file = &path[slash + 1..];
    let (digits, extension) = file.rsplit_once('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || !is_extension(extension)
    {
        return None;
    }
    let number: u32 = digits.parse().ok()?;

    let full = parsed.as_str();
    let prefix = full.strip_suffix(file)?.to_string();

    Some(SeedMatch {
        template: SequenceTemplate {
            prefix,
            width: digits.len(),
            extension: extension.to_string(),
            suffix,
        },
        number,
    })
}

/// First URL in DOM order that matches the seed shape.
pub fn detect_seed(image_urls: &[String]) -> Option<SeedMatch> {
    image_urls.iter().find_map(|u| match_seed(u))
}

/// Numbers of every URL that shares `template` (same prefix, width, extension and suffix).
pub fn numbers_matching(image_urls: &[String], template: &SequenceTemplate) -> Vec<u32> {
    image_urls
        .iter()
        .filter_map(|u| match_seed(u))
        .filter(|m| &m.template == template)
        .map(|m| m.number)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_url_is_a_seed() {
        let m = match_seed("https://oss.example.com/img/77163/001.jpg").unwrap();
        assert_eq!(m.number, 1);
        assert_eq!(m.template.prefix, "https://oss.example.com/img/77163/");
        assert_eq!(m.template.width, 3);
        assert_eq!(m.template.extension, "jpg");
        assert_eq!(m.template.suffix, "");
    }

    #[test]
    fn non_numbered_names_rejected() {
        assert!(match_seed("https://oss.example.com/img/77163/cover.jpg").is_none());
        assert!(match_seed("https://oss.example.com/img/77163/01a.jpg").is_none());
        assert!(match_seed("https://oss.example.com/img/77163/001.jpeg2000").is_none());
        assert!(match_seed("https://oss.example.com/img/77163/001").is_none());
        assert!(match_seed("https://oss.example.com/img/77163/.jpg").is_none());
    }

    #[test]
    fn query_is_kept_as_suffix() {
        let m = match_seed("https://x.example/a/0007.webp?sig=abc#frag").unwrap();
        assert_eq!(m.number, 7);
        assert_eq!(m.template.suffix, "?sig=abc");
        assert_eq!(m.template.url_for(12), "https://x.example/a/0012.webp?sig=abc");
    }

    #[test]
    fn url_for_keeps_padding_and_grows_past_width() {
        let m = match_seed("https://oss.example.com/img/77163/001.jpg").unwrap();
        assert_eq!(
            m.template.url_for(12),
            "https://oss.example.com/img/77163/012.jpg"
        );
        assert_eq!(
            m.template.url_for(1234),
            "https://oss.example.com/img/77163/1234.jpg"
        );
    }

    #[test]
    fn detect_skips_leading_non_seeds() {
        let urls = vec![
            "https://x.example/static/logo.png".to_string(),
            "https://x.example/g/5/03.jpg".to_string(),
            "https://x.example/g/5/04.jpg".to_string(),
        ];
        let m = detect_seed(&urls).unwrap();
        assert_eq!(m.number, 3);
        assert_eq!(numbers_matching(&urls, &m.template), vec![3, 4]);
    }
}
