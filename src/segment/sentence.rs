//! Fast rule-based sentence splitter
//!
//! A boundary sits after terminal punctuation (plus any closing quotes or
//! brackets) when whitespace follows and the next word can start a sentence.
//! No boundary is placed:
//! - after a known abbreviation (`e.g.`, `et al.`, `Fig.`, ...)
//! - after an initial followed by a capitalised word (`J. Smith`)
//! - after a leading enumerator (`1.` at paragraph start)
//! - before a bracketed citation marker, which stays with the sentence it follows

use regex_lite::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// Lowercased abbreviations that never end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g.", "i.e.", "al.", "cf.", "vs.", "viz.", "approx.", "ca.", "dr.", "mr.", "mrs.", "ms.",
    "prof.", "st.", "jr.", "sr.", "fig.", "figs.", "eq.", "eqs.", "no.", "nos.", "vol.", "vols.",
    "pp.", "p.", "ed.", "eds.", "ch.", "sec.", "ref.", "refs.", "inc.", "ltd.", "co.", "corp.",
    "dept.", "univ.", "u.s.", "u.k.", "jan.", "feb.", "mar.", "apr.", "jun.", "jul.", "aug.",
    "sep.", "sept.", "oct.", "nov.", "dec.",
];

fn citation_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[\s*\d+(?:\s*[-–,]\s*\d+)*\s*\]").expect("valid citation marker pattern")
    })
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | '”' | '’' | ')' | ']' | '»')
}

fn starts_sentence(c: char) -> bool {
    (c.is_alphanumeric() && !c.is_lowercase())
        || matches!(c, '(' | '[' | '"' | '\'' | '“' | '‘' | '«' | '¿' | '¡')
}

/// Byte length of a bracketed citation marker at the start of `text`, if any.
pub fn citation_marker_len(text: &str) -> Option<usize> {
    citation_marker().find(text).map(|m| m.end())
}

fn is_initials(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').filter(|p| !p.is_empty()).collect();
    !parts.is_empty()
        && parts.iter().all(|p| {
            let mut chars = p.chars();
            matches!((chars.next(), chars.next()), (Some(c), None) if c.is_uppercase())
        })
}

fn is_enumerator(token: &str) -> bool {
    let digits = token.trim_end_matches('.');
    !digits.is_empty() && digits.len() + 1 == token.len() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Whether the `.` ending `token` is not a sentence end.
fn period_is_internal(token: &str, token_is_first: bool, next: char) -> bool {
    let token = token.trim_start_matches(&['(', '"', '\'', '“', '‘', '['][..]);
    let lower = token.to_lowercase();
    if ABBREVIATIONS.contains(&lower.as_str()) {
        return true;
    }
    if is_initials(token) && next.is_uppercase() {
        return true;
    }
    token_is_first && is_enumerator(token)
}

/// Sentence spans as byte ranges into `text`, each trimmed and non-empty.
pub fn split_sentence_spans(text: &str) -> Vec<Range<usize>> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let byte_at = |i: usize| chars.get(i).map(|(b, _)| *b).unwrap_or(text.len());
    let index_of = |byte: usize| chars.partition_point(|(b, _)| *b < byte);

    let mut raw: Vec<Range<usize>> = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if !is_terminal(c) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < chars.len() && (is_terminal(chars[j].1) || is_closer(chars[j].1)) {
            j += 1;
        }
        if j >= chars.len() {
            break;
        }
        if !chars[j].1.is_whitespace() {
            i = j;
            continue;
        }
        let mut k = j;
        while k < chars.len() && chars[k].1.is_whitespace() {
            k += 1;
        }
        if k >= chars.len() {
            break;
        }

        if c == '.' {
            let head = &text[start..pos + c.len_utf8()];
            let token = head.rsplit(char::is_whitespace).next().unwrap_or(head);
            let token_is_first = head.len() == token.len();
            if period_is_internal(token, token_is_first, chars[k].1) {
                i = k;
                continue;
            }
        }

        // citation markers after the terminal stay with this sentence
        let mut end = byte_at(j);
        let mut next = k;
        while next < chars.len() {
            let Some(len) = citation_marker_len(&text[byte_at(next)..]) else {
                break;
            };
            end = byte_at(next) + len;
            next = index_of(end);
            while next < chars.len() && chars[next].1.is_whitespace() {
                next += 1;
            }
        }
        if next >= chars.len() {
            break;
        }
        if !starts_sentence(chars[next].1) {
            i = next;
            continue;
        }

        raw.push(start..end);
        start = byte_at(next);
        i = next;
    }
    raw.push(start..text.len());

    raw.into_iter()
        .filter_map(|span| {
            let slice = &text[span.clone()];
            let trimmed = slice.trim();
            if trimmed.is_empty() {
                return None;
            }
            let lead = slice.len() - slice.trim_start().len();
            Some(span.start + lead..span.start + lead + trimmed.len())
        })
        .collect()
}

/// Split text into trimmed sentence fragments.
pub fn split_sentences(text: &str) -> Vec<String> {
    split_sentence_spans(text)
        .into_iter()
        .map(|span| text[span].to_string())
        .collect()
}
