use std::borrow::Cow;

/// Marker appended when a value is shortened by [`abbreviate`].
const ELLIPSIS: &str = "...";

/// Shortens `s` to at most `max_chars` characters, ending with "..." when cut.
///
/// Counts Unicode scalar values, not bytes, so multi-byte text is never split
/// mid-character. Widths smaller than the ellipsis are cut without a marker.
///
/// # Examples
///
/// ```
/// use feedsync::util::abbreviate;
///
/// assert_eq!(abbreviate("Short", 10), "Short");
/// assert_eq!(abbreviate("Hello World", 8), "Hello...");
/// assert_eq!(abbreviate("Hello", 2), "He");
/// ```
pub fn abbreviate(s: &str, max_chars: usize) -> Cow<'_, str> {
    let count = s.chars().count();
    if count <= max_chars {
        return Cow::Borrowed(s);
    }

    let ellipsis_len = ELLIPSIS.chars().count();
    if max_chars <= ellipsis_len {
        return Cow::Owned(s.chars().take(max_chars).collect());
    }

    let mut out: String = s.chars().take(max_chars - ellipsis_len).collect();
    out.push_str(ELLIPSIS);
    Cow::Owned(out)
}

/// [`abbreviate`] over an optional value.
pub fn abbreviate_opt(s: Option<&str>, max_chars: usize) -> Option<String> {
    s.map(|v| abbreviate(v, max_chars).into_owned())
}

/// Keeps a value only if it fits in `max_chars`; longer values become `None`.
///
/// Used for codes (language tags) where a truncated value would be wrong.
pub fn fit_or_none(s: Option<&str>, max_chars: usize) -> Option<String> {
    s.filter(|v| v.chars().count() <= max_chars)
        .map(str::to_owned)
}

/// Strip control characters and ANSI escape sequences from text.
///
/// Feed XML is attacker-controlled; escape sequences embedded in titles would
/// otherwise persist into every client that renders them.
///
/// Preserves tab, newline and carriage return. Returns `Cow::Borrowed` when
/// the input is already clean.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            if !is_stripped(c) {
                out.push(c);
            }
            continue;
        }

        match chars.peek().copied() {
            // CSI: parameters until a final byte in 0x40..=0x7e
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: until BEL or ST
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    Cow::Owned(out)
}

fn is_stripped(c: char) -> bool {
    c == '\x7f' || (c < '\x20' && c != '\t' && c != '\n' && c != '\r')
}

/// Collapses every run of whitespace into a single space and trims the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_abbreviate_fits() {
        assert_eq!(abbreviate("Short", 10), "Short");
        assert!(matches!(abbreviate("Short", 10), Cow::Borrowed(_)));
    }

    #[test]
    fn test_abbreviate_exact_length() {
        assert_eq!(abbreviate("12345", 5), "12345");
    }

    #[test]
    fn test_abbreviate_long_title_to_limit() {
        let title = "x".repeat(150);
        let result = abbreviate(&title, 100);
        assert_eq!(result.chars().count(), 100);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_abbreviate_multibyte() {
        assert_eq!(abbreviate("日本語テキスト", 5), "日本...");
    }

    #[test]
    fn test_abbreviate_narrow() {
        assert_eq!(abbreviate("Testing", 0), "");
        assert_eq!(abbreviate("Testing", 3), "Tes");
    }

    #[test]
    fn test_fit_or_none() {
        assert_eq!(fit_or_none(Some("en-us"), 10), Some("en-us".to_string()));
        assert_eq!(fit_or_none(Some("x-klingon-1"), 10), None);
        assert_eq!(fit_or_none(None, 10), None);
    }

    #[test]
    fn test_strip_clean_text_returns_borrowed() {
        let result = strip_control_chars("Hello, world!");
        assert!(matches!(result, Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_preserves_tabs_newlines_cr() {
        assert_eq!(strip_control_chars("a\tb\nc\rd"), "a\tb\nc\rd");
    }

    #[test]
    fn test_strip_removes_controls() {
        assert_eq!(strip_control_chars("a\x00b\x07c\x7fd"), "abcd");
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_control_chars("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_control_chars("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_control_chars("\x1b]0;title\x1b\\text"), "text");
        assert_eq!(strip_control_chars("a\x1bb"), "ab");
    }

    #[test]
    fn test_strip_unicode_preserved() {
        assert_eq!(strip_control_chars("日本\x01語"), "日本語");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \n\t b  "), "a b");
        assert_eq!(collapse_whitespace(""), "");
    }

    proptest! {
        #[test]
        fn prop_abbreviate_never_exceeds_limit(s in ".{0,300}", max in 0usize..200) {
            prop_assert!(abbreviate(&s, max).chars().count() <= max);
        }

        #[test]
        fn prop_abbreviate_keeps_short_values(s in ".{0,50}") {
            let abbreviated = abbreviate(&s, 50);
            prop_assert_eq!(abbreviated.as_ref(), s.as_str());
        }
    }
}
