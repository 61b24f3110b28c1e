//! Pure text passes applied to raw extractor output.
//!
//! Everything here is a function from text to text with no carried
//! state; the only context-sensitive piece is a bounded look-ahead over
//! the leading lines to find the vertical arXiv margin stamp. That
//! keeps each pass independently testable against literal input/output
//! pairs.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

pub mod psv;

/// Horizontal submission stamp, e.g. `arXiv:1802.00125v1 [cs.DL] 1 Feb 2018`.
static RE_STAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"arXiv:.{20,60}\s\d{1,2}\s[A-Z][a-z]{2}\s\d{4}").unwrap_or_else(|e| panic!("{e}"))
});

/// Junk sequences produced by broken font maps: `(cid:NNN)` runs,
/// repeated fill characters, dot/star leaders.
static RE_REPEATS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\(cid:\d+\)|lllll|\.\.\.\.\.|\*\*\*\*\*)").unwrap_or_else(|e| panic!("{e}"))
});

/// How many leading lines may belong to a vertical margin stamp.
const STAMP_SCAN_LINES: usize = 60;

/// Fold unicode artifacts of PDF text extraction down to plain forms.
///
/// - drops the vertical margin stamp (one character per line down the
///   left edge of the first page) when one is present
/// - expands typographic ligatures and folds slashed/ring characters
///   that NFKC leaves alone
/// - applies NFKC normalization to the remainder
pub fn fixunicode(txt: &str) -> String {
    let lines: Vec<&str> = txt.split('\n').collect();
    let stamp_lines = vertical_stamp_extent(&lines);

    let mut output = String::with_capacity(txt.len());
    for (i, line) in lines.iter().enumerate() {
        if i < stamp_lines {
            continue;
        }
        dumbdown_into(line, &mut output);
        output.push('\n');
    }
    output.nfkc().collect()
}

/// Detect a vertical stamp in the leading lines.
///
/// The stamp renders as a run of one-or-two character lines near the
/// top of the first page which, concatenated, read `arXiv:...` (or
/// `:viXra` when the text column came out bottom-to-top). Returns the
/// number of leading lines to drop, 0 when no stamp is found.
fn vertical_stamp_extent(lines: &[&str]) -> usize {
    // A horizontal stamp on the second line means there is no vertical one.
    if lines.len() > 1 && RE_STAMP.is_match(lines[1]) {
        return 0;
    }

    let mut stamp = String::new();
    let mut extent = 0;
    for (i, line) in lines.iter().enumerate() {
        if i >= STAMP_SCAN_LINES {
            break;
        }
        let trimmed = line.trim();
        if trimmed.chars().count() < 3 {
            stamp.push_str(trimmed);
            extent = i + 1;
            continue;
        }
        break;
    }

    if stamp.contains("arXiv:") || stamp.contains(":viXra") {
        extent
    } else {
        0
    }
}

/// Fold a single line, expanding ligatures and stripping accent debris
/// that xpdf-era converters emit as stray combining marks.
fn dumbdown_into(line: &str, out: &mut String) {
    for c in line.chars() {
        match c {
            '\u{FB00}' => out.push_str("ff"),
            '\u{FB01}' => out.push_str("fi"),
            '\u{FB02}' => out.push_str("fl"),
            '\u{FB03}' => out.push_str("ffi"),
            '\u{FB04}' => out.push_str("ffl"),
            '\u{FB05}' | '\u{FB06}' => out.push_str("st"),
            'ø' => out.push('o'),
            'Ø' => out.push('O'),
            'ß' => out.push_str("ss"),
            'æ' => out.push_str("ae"),
            'Æ' => out.push_str("AE"),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{201C}' | '\u{201D}' => out.push('"'),
            '\u{2013}' | '\u{2014}' => out.push('-'),
            // stray spacing accents left behind by garbled composition
            '\u{A8}' | '\u{B4}' | '\u{B8}' | '\u{B0}' => {}
            _ => out.push(c),
        }
    }
}

/// Character count, word count, and average word length of `txt`,
/// with repeat junk removed first. A very high average word length
/// indicates the converter produced garbage rather than prose.
pub fn average_word_length(txt: &str) -> (usize, usize, f64) {
    let cleaned = RE_REPEATS.replace_all(txt, "");
    let nw = cleaned.split_whitespace().count();
    let nc = cleaned.chars().count();
    (nc, nw, nc as f64 / (nw as f64 + 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ligatures_expand() {
        assert_eq!(fixunicode("e\u{FB03}cient \u{FB01}eld"), "efficient field\n");
    }

    #[test]
    fn slashed_o_and_sharp_s_fold() {
        assert_eq!(fixunicode("Høst strøm ß"), "Host strom ss\n");
    }

    #[test]
    fn vertical_stamp_is_dropped() {
        // One stamp character per line, then real content.
        let mut input = String::new();
        for c in "arXiv:1802.00125v1".chars() {
            input.push(c);
            input.push('\n');
        }
        input.push_str("Introduction\nBody text here\n");
        let fixed = fixunicode(&input);
        assert!(!fixed.contains("a\nr\nX"));
        assert!(fixed.starts_with("Introduction"));
    }

    #[test]
    fn horizontal_stamp_is_kept_as_text() {
        let input = "Title of the Paper\narXiv:1802.00125v1 [cs.DL] 1 Feb 2018\nAbstract\n";
        let fixed = fixunicode(input);
        assert!(fixed.contains("arXiv:1802.00125v1"));
    }

    #[test]
    fn short_lines_without_stamp_survive() {
        let input = "a\nb\nc\nRegular opening paragraph\n";
        let fixed = fixunicode(input);
        assert!(fixed.contains("a\nb\nc\n"));
    }

    #[test]
    fn word_length_ignores_cid_junk() {
        let (_, nw, avg) = average_word_length("(cid:123)(cid:456) one two three");
        assert_eq!(nw, 3);
        assert!(avg < 4.0);
    }

    #[test]
    fn garbage_has_high_average_word_length() {
        let garbage = "Kqzxwvplmnbtrd".repeat(40);
        let (_, _, avg) = average_word_length(&garbage);
        assert!(avg > 45.0);
    }
}
