//! Normalize raw captions returned by vision-language models.
//!
//! Models frequently echo JSON-escaped text back (`\u2019`, `\n`, `\t` as
//! literal backslash sequences) and pad answers with blank lines. Captions are
//! stored one per image, so everything is flattened to a single trimmed line.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static ESCAPE_SEQUENCES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\u[0-9A-Fa-f]{4}|\\n|\\t").expect("escape pattern compiles"));

static WHITESPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

/// Cleans a raw caption: drops literal escape sequences, collapses whitespace
/// runs to a single space and trims both ends.
pub fn clean_caption(raw: &str) -> String {
    let stripped = strip_escape_sequences(raw);
    collapse_whitespace(&stripped)
}

/// Removes literal `\uXXXX`, `\n` and `\t` sequences (backslash included).
///
/// Real control characters are left alone; [`collapse_whitespace`] handles
/// those.
pub fn strip_escape_sequences(raw: &str) -> Cow<'_, str> {
    ESCAPE_SEQUENCES.replace_all(raw, "")
}

/// Collapses every whitespace run to one ASCII space and trims the result.
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUNS.replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_literal_escapes() {
        let raw = r"Relaxed fit\n\tlinen shirt \u2014 beach days";
        assert_eq!(clean_caption(raw), "Relaxed fitlinen shirt beach days");
    }

    #[test]
    fn collapses_real_whitespace() {
        let raw = "  Tailored\n\n wool   coat\t for  winter  ";
        assert_eq!(clean_caption(raw), "Tailored wool coat for winter");
    }

    #[test]
    fn keeps_backslashes_that_are_not_escapes() {
        assert_eq!(clean_caption(r"50\50 blend \x"), r"50\50 blend \x");
    }

    #[test]
    fn short_unicode_escape_is_not_stripped() {
        assert_eq!(clean_caption(r"tone \u20 shade"), r"tone \u20 shade");
    }

    #[test]
    fn blank_input_becomes_empty() {
        assert_eq!(clean_caption(" \n\t "), "");
        assert_eq!(clean_caption(r"\n\t"), "");
    }
}
