//! Output truncation (§4.F step 8): keeps rendered command output bounded,
//! preserving the head and tail and naming how much was cut from the middle.

const DEFAULT_THRESHOLD: usize = 10_000;
const DEFAULT_KEEP: usize = 3_000;

/// Truncate `text` if it exceeds `threshold` characters, keeping the first
/// and last `keep` characters joined by an elision marker that names the
/// number of omitted characters. `keep` is independent of `threshold`.
pub fn truncate(text: &str, threshold: usize, keep: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= threshold {
        return text.to_string();
    }

    let head: String = chars[..keep].iter().collect();
    let tail: String = chars[chars.len() - keep..].iter().collect();
    let omitted = chars.len() - 2 * keep;

    format!("{head}\n... [{omitted} characters omitted] ...\n{tail}")
}

pub fn truncate_default(text: &str) -> String {
    truncate(text, DEFAULT_THRESHOLD, DEFAULT_KEEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_short_text_untouched() {
        let text = "hello world";
        assert_eq!(truncate_default(text), text);
    }

    #[test]
    fn truncates_long_text_with_marker() {
        let text = "a".repeat(20_000);
        let result = truncate_default(&text);
        assert!(result.contains("characters omitted"));
        assert!(result.starts_with(&"a".repeat(3_000)));
        assert!(result.ends_with(&"a".repeat(3_000)));
    }

    #[test]
    fn exact_threshold_is_not_truncated() {
        let text = "b".repeat(10_000);
        assert_eq!(truncate_default(&text), text);
    }

    #[test]
    fn elision_marker_mentions_omitted_count() {
        let text = "c".repeat(10_001);
        let result = truncate_default(&text);
        assert!(result.contains("4001 characters omitted"));
    }

    #[test]
    fn keep_size_is_independent_of_threshold() {
        let text = "d".repeat(100);
        let result = truncate(&text, 50, 10);
        assert!(result.starts_with(&"d".repeat(10)));
        assert!(result.ends_with(&"d".repeat(10)));
        assert!(result.contains("80 characters omitted"));
    }
}
