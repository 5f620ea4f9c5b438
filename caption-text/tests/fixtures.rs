use pretty_assertions::assert_eq;

use caption_text::clean_caption;

#[test]
fn fixtures_match_expected_output() {
    let cases = [
        (
            "gemini-escaped",
            include_str!("fixtures/raw/gemini-escaped.txt"),
            include_str!("fixtures/expected/gemini-escaped.txt"),
        ),
        (
            "multiline-answer",
            include_str!("fixtures/raw/multiline-answer.txt"),
            include_str!("fixtures/expected/multiline-answer.txt"),
        ),
        (
            "tabbed-list",
            include_str!("fixtures/raw/tabbed-list.txt"),
            include_str!("fixtures/expected/tabbed-list.txt"),
        ),
    ];

    for (name, raw, expected) in cases {
        let actual = clean_caption(raw);
        assert_eq!(
            actual,
            expected.trim_end_matches('\n'),
            "fixture mismatch: {name}"
        );
    }
}

#[test]
fn cleaning_is_idempotent() {
    for raw in [
        include_str!("fixtures/raw/gemini-escaped.txt"),
        include_str!("fixtures/raw/multiline-answer.txt"),
        include_str!("fixtures/raw/tabbed-list.txt"),
    ] {
        let once = clean_caption(raw);
        assert_eq!(clean_caption(&once), once);
    }
}
