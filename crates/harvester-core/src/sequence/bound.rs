//! Upper-bound text parsing.

/// First run of ASCII digits in the selector's text, as a positive count.
///
/// `"共 36 张"` gives 36; text with no digits, a zero count, or a number that
/// does not fit `u32` gives `None`.
pub fn parse_upper_bound(text: Option<&str>) -> Option<u32> {
    let text = text?;
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}
