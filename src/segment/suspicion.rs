//! Suspicion scoring for fast-split output
//!
//! Fragments that look like a bibliographic entry, a citation, or leaked
//! markup cut into pieces push the score up. At or above the threshold the
//! paragraph is handed to a fallback tokenizer.
//!
//! Adding a very short fragment to a paragraph never lowers its score: the
//! fragment's own penalty is at least as large as any aggregate penalty it
//! can cancel. [`SuspicionPolicy::validate`] enforces the point ordering that
//! makes this hold.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Tunable constants of the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspicionPolicy {
    /// Score at or above which a fallback runs
    pub threshold: u32,
    /// Fragments shorter than this (chars) are very short
    pub very_short_len: usize,
    pub very_short_points: u32,
    /// Fragments shorter than this are extremely short (replaces very short)
    pub extremely_short_len: usize,
    pub extremely_short_points: u32,
    /// A fragment at least this long, next to a very short one, is bimodal
    pub bimodal_long_len: usize,
    /// Minimum longest / shortest ratio for bimodality
    pub bimodal_ratio: f64,
    pub bimodal_points: u32,
    /// Coefficient of variation above which lengths are erratic
    pub cv_threshold: f64,
    pub cv_points: u32,
    /// Short fragments opening with `(` below this length look like citations
    pub parenthetical_max_len: usize,
    pub parenthetical_points: u32,
    /// Fragments opening with two or more symbol characters
    pub markup_prefix_points: u32,
}

impl Default for SuspicionPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            very_short_len: 20,
            very_short_points: 2,
            extremely_short_len: 10,
            extremely_short_points: 3,
            bimodal_long_len: 60,
            bimodal_ratio: 4.0,
            bimodal_points: 2,
            cv_threshold: 0.6,
            cv_points: 1,
            parenthetical_max_len: 30,
            parenthetical_points: 1,
            markup_prefix_points: 2,
        }
    }
}

/// Why a policy was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("threshold must be positive")]
    ZeroThreshold,

    #[error("extremely_short_len ({extremely}) must not exceed very_short_len ({very})")]
    LengthOrder { extremely: usize, very: usize },

    #[error("extremely_short_points ({extremely}) must be at least very_short_points ({very})")]
    PointOrder { extremely: u32, very: u32 },

    #[error("cv_points ({cv}) must not exceed very_short_points ({very})")]
    VariationOutweighsShortness { cv: u32, very: u32 },

    #[error("bimodal_ratio must be at least 1.0, got {0}")]
    BimodalRatio(f64),
}

/// One contribution to a suspicion score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspicionReason {
    VeryShort { fragment: usize, len: usize },
    ExtremelyShort { fragment: usize, len: usize },
    Bimodal { shortest: usize, longest: usize },
    ErraticLengths { cv: f64 },
    Parenthetical { fragment: usize },
    StandaloneMarker { fragment: usize },
    MarkupPrefix { fragment: usize },
}

impl fmt::Display for SuspicionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VeryShort { fragment, len } => {
                write!(f, "fragment {} is very short ({} chars)", fragment, len)
            }
            Self::ExtremelyShort { fragment, len } => {
                write!(f, "fragment {} is extremely short ({} chars)", fragment, len)
            }
            Self::Bimodal { shortest, longest } => {
                write!(f, "bimodal lengths ({} vs {} chars)", shortest, longest)
            }
            Self::ErraticLengths { cv } => write!(f, "erratic lengths (cv {:.2})", cv),
            Self::Parenthetical { fragment } => {
                write!(f, "fragment {} is a short parenthetical", fragment)
            }
            Self::StandaloneMarker { fragment } => {
                write!(f, "fragment {} is a standalone marker", fragment)
            }
            Self::MarkupPrefix { fragment } => {
                write!(f, "fragment {} opens with markup", fragment)
            }
        }
    }
}

/// Score and the reasons behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspicionReport {
    pub score: u32,
    pub threshold: u32,
    pub reasons: Vec<SuspicionReason>,
}

impl SuspicionReport {
    pub fn triggered(&self) -> bool {
        self.score >= self.threshold
    }
}

fn footnote_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[\s*\d+(?:\s*[-–,]\s*\d+)*\s*\]|\^\d+|[¹²³⁴⁵⁶⁷⁸⁹⁰]+)[.,;:]?$")
            .expect("valid footnote marker pattern")
    })
}

/// True for a fragment that is only punctuation or a footnote marker.
pub fn is_standalone_marker(fragment: &str) -> bool {
    let fragment = fragment.trim();
    !fragment.is_empty()
        && (!fragment.chars().any(char::is_alphanumeric) || footnote_marker().is_match(fragment))
}

/// True when the fragment opens with two consecutive symbol characters.
pub fn has_markup_prefix(fragment: &str) -> bool {
    let mut chars = fragment.trim_start().chars();
    let is_symbol = |c: char| !c.is_alphanumeric() && !c.is_whitespace();
    matches!((chars.next(), chars.next()), (Some(a), Some(b)) if is_symbol(a) && is_symbol(b))
}

fn char_len(fragment: &str) -> usize {
    fragment.trim().chars().count()
}

impl SuspicionPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.threshold == 0 {
            return Err(PolicyError::ZeroThreshold);
        }
        if self.extremely_short_len > self.very_short_len {
            return Err(PolicyError::LengthOrder {
                extremely: self.extremely_short_len,
                very: self.very_short_len,
            });
        }
        if self.extremely_short_points < self.very_short_points {
            return Err(PolicyError::PointOrder {
                extremely: self.extremely_short_points,
                very: self.very_short_points,
            });
        }
        if self.cv_points > self.very_short_points {
            return Err(PolicyError::VariationOutweighsShortness {
                cv: self.cv_points,
                very: self.very_short_points,
            });
        }
        if self.bimodal_ratio < 1.0 {
            return Err(PolicyError::BimodalRatio(self.bimodal_ratio));
        }
        Ok(())
    }

    /// Whether a fragment is short enough to count against its paragraph.
    pub fn is_very_short(&self, fragment: &str) -> bool {
        char_len(fragment) < self.very_short_len
    }

    pub fn is_parenthetical(&self, fragment: &str) -> bool {
        let fragment = fragment.trim();
        fragment.starts_with('(') && char_len(fragment) < self.parenthetical_max_len
    }

    /// Score the fast splitter's output for one paragraph.
    ///
    /// A single fragment scores zero: there is nothing to have been split
    /// wrongly.
    pub fn score<S: AsRef<str>>(&self, fragments: &[S]) -> SuspicionReport {
        let mut report = SuspicionReport {
            score: 0,
            threshold: self.threshold,
            reasons: Vec::new(),
        };
        if fragments.len() < 2 {
            return report;
        }

        let lengths: Vec<usize> = fragments.iter().map(|f| char_len(f.as_ref())).collect();
        let mut add = |points: u32, reason: SuspicionReason| {
            report.score += points;
            report.reasons.push(reason);
        };

        for (i, fragment) in fragments.iter().enumerate() {
            let fragment = fragment.as_ref();
            let len = lengths[i];

            if len < self.extremely_short_len {
                add(
                    self.extremely_short_points,
                    SuspicionReason::ExtremelyShort { fragment: i, len },
                );
            } else if len < self.very_short_len {
                add(
                    self.very_short_points,
                    SuspicionReason::VeryShort { fragment: i, len },
                );
            }
            if self.is_parenthetical(fragment) {
                add(
                    self.parenthetical_points,
                    SuspicionReason::Parenthetical { fragment: i },
                );
            }
            if is_standalone_marker(fragment) {
                add(self.threshold, SuspicionReason::StandaloneMarker { fragment: i });
            }
            if has_markup_prefix(fragment) {
                add(
                    self.markup_prefix_points,
                    SuspicionReason::MarkupPrefix { fragment: i },
                );
            }
        }

        let shortest = lengths.iter().copied().min().unwrap_or(0);
        let longest = lengths.iter().copied().max().unwrap_or(0);
        if shortest < self.very_short_len
            && longest >= self.bimodal_long_len
            && longest as f64 >= self.bimodal_ratio * shortest.max(1) as f64
        {
            add(
                self.bimodal_points,
                SuspicionReason::Bimodal { shortest, longest },
            );
        }

        let any_very_short = shortest < self.very_short_len;
        let cv = coefficient_of_variation(&lengths);
        if any_very_short && cv >= self.cv_threshold {
            add(self.cv_points, SuspicionReason::ErraticLengths { cv });
        }

        report
    }
}

/// Population standard deviation over mean; zero for a zero mean.
fn coefficient_of_variation(lengths: &[usize]) -> f64 {
    if lengths.is_empty() {
        return 0.0;
    }
    let n = lengths.len() as f64;
    let mean = lengths.iter().sum::<usize>() as f64 / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = lengths
        .iter()
        .map(|&l| {
            let d = l as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt() / mean
}
