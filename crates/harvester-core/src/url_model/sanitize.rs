//! Filesystem-safe image file names.

/// Linux NAME_MAX.
const NAME_MAX: usize = 255;

/// Characters that are never allowed in a saved image file name.
fn is_reserved(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

/// Replaces reserved and control characters with `_`, trims surrounding
/// whitespace and dots, and truncates to NAME_MAX bytes on a char boundary.
///
/// Returns an empty string when nothing usable is left; callers pick the fallback.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_reserved(c) { '_' } else { c })
        .collect();

    let trimmed = replaced.trim().trim_matches('.');

    let mut take = trimmed.len().min(NAME_MAX);
    while take > 0 && !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_reserved_characters() {
        assert_eq!(sanitize_file_name("a<b>c:d\"e|f?g*h.jpg"), "a_b_c_d_e_f_g_h.jpg");
        assert_eq!(sanitize_file_name("dir\\001.jpg"), "dir_001.jpg");
    }

    #[test]
    fn control_characters() {
        assert_eq!(sanitize_file_name("img\x00\x1f.png"), "img__.png");
    }

    #[test]
    fn trims_dots_and_whitespace() {
        assert_eq!(sanitize_file_name("  ..cover.jpg.. "), "cover.jpg");
        assert_eq!(sanitize_file_name(" .. "), "");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_file_name(&long);
        assert!(out.len() <= NAME_MAX);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
