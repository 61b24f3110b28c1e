//! Conversion of extracted plain text to PSV: ASCII-only, lowercased
//! sentences, one per line, with the reference section split off.
//!
//! Port of arXiv's TidyText pass (the docsim-era Perl, by way of the
//! Python `process/psv.py`). The pipeline deliberately mirrors the
//! historical order of operations so that PSV output stays comparable
//! across extractor versions.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_REFSECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[^a-zA-Z]*(References?|Bibliography)[^\w]*$").unwrap_or_else(|e| panic!("{e}"))
});
static RE_SYMBOLS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.\w ]|_").unwrap_or_else(|e| panic!("{e}")));
static RE_FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\.?\d+/").unwrap_or_else(|e| panic!("{e}")));
static RE_ABBREV3: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s\w\.\w\.\w\.\s").unwrap_or_else(|e| panic!("{e}")));
static RE_ABBREV2: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s\w\.\w\.\s").unwrap_or_else(|e| panic!("{e}")));
static RE_ABBREV1: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s\w\.\s").unwrap_or_else(|e| panic!("{e}")));
static RE_SINGLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s[a-zA-Z]\s").unwrap_or_else(|e| panic!("{e}")));
static RE_SINGLE_DOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s[a-zA-Z]\.").unwrap_or_else(|e| panic!("{e}")));
static RE_SPACES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").unwrap_or_else(|e| panic!("{e}")));
static RE_ACCENT_MULTI: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{a8}\u{b4}\u{b8}\u{b0}]\u{0a}?").unwrap_or_else(|e| panic!("{e}")));
static RE_ACCENT_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\\^`~]\u{0a}").unwrap_or_else(|e| panic!("{e}")));
static RE_UNIVERSITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)university|institute").unwrap_or_else(|e| panic!("{e}")));

/// If the "References" heading sits in the first half of the document
/// it is almost certainly a false positive, so nothing is split off.
const MAX_REFS_FRACTION: f64 = 0.5;

/// Normalize text to PSV, discarding the reference section, with
/// sentences joined by single spaces.
pub fn normalize(txt: &str) -> String {
    let (psv, _refs) = process_text(txt);
    psv.replace('\n', " ")
}

/// Convert raw article text to `(psv, references)`, both newline
/// separated sentence lists.
pub fn process_text(txt: &str) -> (String, String) {
    let txt = recover_accents(txt);

    let lines: Vec<String> = txt
        .split(|c| ('\u{0a}'..='\u{0d}').contains(&c))
        .filter(|l| !l.is_empty())
        .map(|l| format!("{l}\n"))
        .collect();

    let (psv, refs) = split_on_references(&lines);
    (tidy(psv).join("\n"), tidy(refs).join("\n"))
}

/// The TidyText cleanup pipeline over a group of lines.
fn tidy(lines: Vec<String>) -> Vec<String> {
    let lines = remove_keywords(lines);
    let lines = remove_whitespace(lines);
    let mut lines = remove_bad_eol(lines);

    for line in lines.iter_mut() {
        let mut l = expand_words(line);
        l = RE_FRACTION.replace_all(&l, " ").into_owned();
        l = RE_SYMBOLS.replace_all(&l, " ").into_owned();
        l = l.chars().map(|c| if c.is_ascii_digit() { ' ' } else { c }).collect();
        l = remove_abbrev(&l);
        l = remove_single_alphabet(&l);
        *line = squeeze(&l);
    }

    let lines = remove_whitespace(lines);
    let lines = remove_bad_eol(lines);

    clean_sentences(split_sentences(lines))
}

/// Change whitespace, including EOLs, to plain spaces.
fn remove_whitespace(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .map(|l| {
            l.chars()
                .map(|c| if matches!(c, '\n' | '\r' | '\x0c' | '\t') { ' ' } else { c })
                .collect()
        })
        .collect()
}

/// Join lines broken mid-sentence: a line starting lowercase continues
/// the previous line unless that line ended a sentence.
fn remove_bad_eol(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = vec![String::new()];
    let mut prev = String::new();

    for line in lines {
        let line = line.strip_suffix("- ").map(|s| s.to_string()).unwrap_or(line);
        let starts_lower = line.chars().next().is_some_and(|c| c.is_ascii_lowercase());
        let prev_ended = prev.ends_with(". ");

        if starts_lower && !prev_ended {
            let tail = out.pop().unwrap_or_default();
            out.push(tail + &line);
        } else {
            out.push(line.clone());
        }
        prev = line;
    }
    out
}

/// Drop boilerplate lines (stamps, editorial placeholders, affiliation
/// lines following a bare footnote number).
fn remove_keywords(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut prev = String::new();

    for line in lines {
        let lower = line.to_lowercase();
        let prev_line = std::mem::replace(&mut prev, line.clone());

        if lower.starts_with("arxiv") {
            continue;
        }
        if lower.contains("will be inserted by hand later") {
            continue;
        }
        if lower.contains("was prepared with the aas") {
            continue;
        }
        let prev_is_number =
            !prev_line.trim().is_empty() && prev_line.trim().chars().all(|c| c.is_ascii_digit());
        if prev_is_number && RE_UNIVERSITY.is_match(&line) {
            continue;
        }
        out.push(line);
    }
    out
}

/// Expand common abbreviations so the sentence splitter does not break
/// on their trailing dots.
fn expand_words(line: &str) -> String {
    static RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
        vec![
            (Regex::new(r"(?i)Figs?\.?\s").unwrap_or_else(|e| panic!("{e}")), "Figure "),
            (Regex::new(r"(?i)Eqs?\.?\s").unwrap_or_else(|e| panic!("{e}")), "Equation "),
            (Regex::new(r"(?i)Sects?\.?\s").unwrap_or_else(|e| panic!("{e}")), "Section "),
            (Regex::new(r"(?i)Refs?\.?\s").unwrap_or_else(|e| panic!("{e}")), "Reference "),
            (Regex::new(r"(?i)Prof\.").unwrap_or_else(|e| panic!("{e}")), "Prof"),
            (Regex::new(r"(?i)Dr\.").unwrap_or_else(|e| panic!("{e}")), "Dr"),
        ]
    });
    let mut line = line.to_string();
    for (re, repl) in RULES.iter() {
        line = re.replace_all(&line, *repl).into_owned();
    }
    line
}

/// Remove dotted abbreviations (U.S., U.S.A., e.g. single initials)
/// which otherwise confuse sentence splitting.
fn remove_abbrev(line: &str) -> String {
    let line = RE_ABBREV3.replace_all(line, " ");
    let line = RE_ABBREV2.replace_all(&line, " ");
    RE_ABBREV1.replace_all(&line, " ").into_owned()
}

fn remove_single_alphabet(line: &str) -> String {
    // Two passes: adjacent singles share the separating space.
    let line = RE_SINGLE.replace_all(line, " ");
    let line = RE_SINGLE.replace_all(&line, " ");
    RE_SINGLE_DOT.replace_all(&line, ".").into_owned()
}

fn squeeze(line: &str) -> String {
    RE_SPACES.replace_all(line, " ").trim_start().to_string()
}

fn split_sentences(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for line in lines {
        out.extend(line.split(". ").map(|s| s.to_string()));
    }
    out
}

/// Strip non-alphabetics, lowercase, and drop sentences of three or
/// fewer characters.
fn clean_sentences(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for line in lines {
        if !line.chars().next().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            continue;
        }
        let line: String = line
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
            .collect();
        let line = squeeze(&line);
        let line = line.trim();
        if line.len() <= 3 {
            continue;
        }
        out.push(line.to_lowercase());
    }
    out
}

/// Split lines at the *last* "References"/"Bibliography" heading,
/// unless the would-be reference section spans more than half the
/// document.
fn split_on_references(lines: &[String]) -> (Vec<String>, Vec<String>) {
    let total = lines.len();
    let mut last_refs = 0usize;
    for (i, line) in lines.iter().enumerate() {
        if RE_REFSECTION.is_match(line.trim_end()) {
            last_refs = i + 1;
        }
    }

    if total > 0 && last_refs > 0 {
        let refs_fraction = 1.0 - last_refs as f64 / total as f64;
        if refs_fraction > MAX_REFS_FRACTION {
            last_refs = 0;
        }
    }

    if last_refs == 0 {
        return (lines.to_vec(), Vec::new());
    }
    let (psv, refs) = lines.split_at(last_refs - 1);
    (psv.to_vec(), refs.to_vec())
}

/// Recover plain text from xpdf-style garbled accents: spacing accents
/// (often followed by a linefeed) are deleted, slashed/ligature bytes
/// are substituted.
fn recover_accents(txt: &str) -> String {
    let txt = RE_ACCENT_MULTI.replace_all(txt, "");
    let txt = RE_ACCENT_LITERAL.replace_all(&txt, "");
    txt.replace('\u{f8}', "o")
        .replace('\u{d8}', "O")
        .replace('\u{df}', "ss")
        .replace('\u{e6}', "ae")
        .replace('\u{c6}', "AE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_strips_symbols() {
        let out = normalize("The quick brown fox jumps over the lazy dog.\n");
        assert_eq!(out, "the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn digits_and_short_fragments_dropped() {
        let out = normalize("Results shown in 1923 and 2008 were confirmed.\nOk.\n");
        assert!(!out.contains("1923"));
        assert!(!out.contains("ok"));
    }

    #[test]
    fn abbreviations_expand_before_split() {
        let out = normalize("As shown in Fig. 3 the flux increases rapidly.\n");
        assert!(out.contains("figure"), "got: {out}");
    }

    #[test]
    fn reference_section_is_split_off() {
        let mut doc = String::new();
        for i in 0..20 {
            doc.push_str(&format!("This is substantial body sentence number {i} of the paper.\n"));
        }
        doc.push_str("References\n");
        doc.push_str("Famous Author, An Important Paper, Journal of Results.\n");
        let (psv, refs) = process_text(&doc);
        assert!(psv.contains("substantial body sentence"));
        assert!(!psv.contains("famous author"));
        assert!(refs.contains("famous author"));
    }

    #[test]
    fn early_references_heading_not_split() {
        let doc = "References\nA body that mostly follows the heading with plenty of text.\n\
                   More body text continues here for a while longer sentence.\n";
        let (psv, refs) = process_text(doc);
        assert!(refs.is_empty());
        assert!(psv.contains("body"));
    }

    #[test]
    fn garbled_accents_recovered() {
        let out = recover_accents("str\u{f8}m \u{b4}\ne");
        assert_eq!(out, "strom e");
    }
}
