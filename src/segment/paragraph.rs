//! Paragraph splitting
//!
//! Every non-empty line is a paragraph. Exceptions, each kept as a single
//! paragraph spanning several lines:
//! - fenced code blocks and headings (located with pulldown-cmark)
//! - continuation lines of a numbered reference inside a references section

use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag};
use regex_lite::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// Headings that open a references section.
const REFERENCE_HEADINGS: &[&str] = &[
    "references",
    "reference list",
    "bibliography",
    "works cited",
    "literature cited",
    "sources",
    "citations",
    "notes",
    "footnotes",
];

/// What a paragraph is, for splitting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParagraphKind {
    /// Ordinary text, split into sentences
    Prose,
    /// A heading line, never split
    Heading,
    /// A fenced code block, never split
    CodeBlock,
    /// A numbered reference entry (plus its continuation lines), never split
    Reference,
}

impl ParagraphKind {
    /// Whether the fast splitter may cut this paragraph into sentences.
    pub fn is_splittable(self) -> bool {
        self == Self::Prose
    }
}

/// One paragraph: an exact, trimmed slice of the source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Paragraph {
    pub index: usize,
    pub kind: ParagraphKind,
    pub text: String,
    /// Byte range of `text` in the source document
    pub span: Range<usize>,
}

fn bracketed_reference() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[\d{1,4}\]\s*\S").expect("valid bracketed reference pattern"))
}

fn numbered_reference() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,4}[.)]\s+\S").expect("valid numbered reference pattern"))
}

/// True for a line starting with `[n]`, which reads as a reference entry
/// anywhere in a document.
pub fn is_bracketed_reference(line: &str) -> bool {
    bracketed_reference().is_match(line.trim_start())
}

/// True for a line starting with `n.` or `n)`. Only counts as a reference
/// inside a references section.
pub fn is_numbered_reference(line: &str) -> bool {
    numbered_reference().is_match(line.trim_start())
}

/// True if the line is a heading that opens a references section.
pub fn is_references_heading(line: &str) -> bool {
    let label = line
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_lowercase();
    REFERENCE_HEADINGS.contains(&label.as_str())
}

/// Fenced code blocks and headings, as byte ranges.
fn block_ranges(document: &str) -> Vec<(Range<usize>, ParagraphKind)> {
    Parser::new(document)
        .into_offset_iter()
        .filter_map(|(event, range)| match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(_))) => {
                Some((range, ParagraphKind::CodeBlock))
            }
            Event::Start(Tag::Heading { .. }) => Some((range, ParagraphKind::Heading)),
            _ => None,
        })
        .collect()
}

/// Non-empty lines as trimmed byte ranges.
fn line_spans(document: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for raw in document.split('\n') {
        let line_start = offset;
        offset += raw.len() + 1;

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let start = line_start + (raw.len() - raw.trim_start().len());
        spans.push(start..start + trimmed.len());
    }
    spans
}

/// Split a document into paragraphs.
pub fn split_paragraphs(document: &str) -> Vec<Paragraph> {
    let blocks = block_ranges(document);
    let mut spans: Vec<(Range<usize>, ParagraphKind)> = Vec::new();
    let mut current_block: Option<usize> = None;
    let mut in_references = false;

    for line in line_spans(document) {
        let block = blocks
            .iter()
            .position(|(range, _)| line.start < range.end && line.end > range.start);

        if let Some(b) = block {
            if current_block == Some(b) {
                if let Some(last) = spans.last_mut() {
                    last.0.end = line.end;
                }
                continue;
            }
            current_block = Some(b);
            let kind = blocks[b].1;
            if kind == ParagraphKind::Heading {
                in_references = is_references_heading(&document[line.clone()]);
            }
            spans.push((line, kind));
            continue;
        }
        current_block = None;

        let text = &document[line.clone()];
        let kind = if is_references_heading(text) {
            in_references = true;
            ParagraphKind::Heading
        } else if is_bracketed_reference(text) || (in_references && is_numbered_reference(text)) {
            ParagraphKind::Reference
        } else if in_references && matches!(spans.last(), Some((_, ParagraphKind::Reference))) {
            // continuation of the previous reference entry
            if let Some(last) = spans.last_mut() {
                last.0.end = line.end;
            }
            continue;
        } else {
            ParagraphKind::Prose
        };
        spans.push((line, kind));
    }

    spans
        .into_iter()
        .enumerate()
        .map(|(index, (span, kind))| Paragraph {
            index,
            kind,
            text: document[span.clone()].to_string(),
            span,
        })
        .collect()
}
