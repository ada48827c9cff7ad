//! Fuzzy question matching
//!
//! Exact lookup first; otherwise every entry is scored with a blend of
//! Levenshtein-based ratios (whole string, best substring window, sorted
//! tokens, token sets) and the top-K are kept.

use super::{QuestionEntry, QuestionIndex};
use crate::config::MatchingSettings;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use strsim::normalized_levenshtein;
use tracing::debug;

const WEIGHT_RATIO: f64 = 0.2;
const WEIGHT_PARTIAL: f64 = 0.3;
const WEIGHT_TOKEN_SORT: f64 = 0.25;
const WEIGHT_TOKEN_SET: f64 = 0.25;

/// One ranked candidate
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub entry: QuestionEntry,
    pub score: f64,
    pub priority: i32,
}

/// Result of one query
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// The confident match, `None` when the best score is under the threshold
    pub entry: Option<QuestionEntry>,
    /// Score of the best candidate (0.0 for an empty index)
    pub score: f64,
    /// Top-K candidates, best first
    pub rank: Vec<MatchCandidate>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.entry.is_some()
    }
}

/// Matches normalized OCR text against a question index
#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    threshold: f64,
    top_k: usize,
}

impl FuzzyMatcher {
    pub fn new(threshold: f64, top_k: usize) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            top_k: top_k.max(1),
        }
    }

    pub fn from_settings(settings: &MatchingSettings) -> Self {
        Self::new(settings.threshold, settings.top_k)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn find(&self, normalized: &str, index: &QuestionIndex) -> MatchResult {
        if let Some(i) = index.lookup_exact_index(normalized) {
            let entry = index.entries()[i].clone();
            debug!("Exact match in '{}' row {}", entry.source_id, entry.row);
            let mut rank = vec![MatchCandidate {
                entry: entry.clone(),
                score: 1.0,
                priority: index.priority(i),
            }];
            rank.extend(
                self.ranked(normalized, index)
                    .into_iter()
                    .filter(|c| c.0 != i)
                    .take(self.top_k - 1)
                    .map(|(j, score)| MatchCandidate {
                        entry: index.entries()[j].clone(),
                        score,
                        priority: index.priority(j),
                    }),
            );
            return MatchResult {
                entry: Some(entry),
                score: 1.0,
                rank,
            };
        }

        let rank: Vec<MatchCandidate> = self
            .ranked(normalized, index)
            .into_iter()
            .take(self.top_k)
            .map(|(i, score)| MatchCandidate {
                entry: index.entries()[i].clone(),
                score,
                priority: index.priority(i),
            })
            .collect();

        let score = rank.first().map(|c| c.score).unwrap_or(0.0);
        let entry = rank
            .first()
            .filter(|c| c.score >= self.threshold)
            .map(|c| c.entry.clone());

        debug!(
            "Best fuzzy score {:.3} (threshold {:.2}), {} candidates",
            score,
            self.threshold,
            rank.len()
        );

        MatchResult { entry, score, rank }
    }

    /// All entries scored, best first; ties go to higher priority, then
    /// load order
    fn ranked(&self, normalized: &str, index: &QuestionIndex) -> Vec<(usize, f64)> {
        let query = normalized.to_lowercase();
        let mut scored: Vec<(usize, f64)> = index
            .entries()
            .iter()
            .enumerate()
            .map(|(i, e)| (i, similarity(&query, &e.question_text.to_lowercase())))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| index.priority(b.0).cmp(&index.priority(a.0)))
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}

/// Blended similarity in [0, 1]
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let score = WEIGHT_RATIO * ratio(a, b)
        + WEIGHT_PARTIAL * partial_ratio(a, b)
        + WEIGHT_TOKEN_SORT * token_sort_ratio(a, b)
        + WEIGHT_TOKEN_SET * token_set_ratio(a, b);
    score.clamp(0.0, 1.0)
}

pub fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    normalized_levenshtein(a, b)
}

/// Best ratio of the shorter string against equal-length windows of the
/// longer one
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let (short, long) = if a_chars.len() <= b_chars.len() {
        (a_chars, b_chars)
    } else {
        (b_chars, a_chars)
    };

    if short.is_empty() {
        return 0.0;
    }
    if short.len() == long.len() {
        return ratio(a, b);
    }

    let short_str: String = short.iter().collect();
    let mut best = 0.0f64;
    for window in long.windows(short.len()) {
        let window: String = window.iter().collect();
        best = best.max(normalized_levenshtein(&short_str, &window));
        if best >= 1.0 {
            break;
        }
    }
    best
}

fn sorted_tokens(s: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens
}

pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sorted_tokens(a).join(" "), &sorted_tokens(b).join(" "))
}

pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let set_a: BTreeSet<&str> = a.split_whitespace().collect();
    let set_b: BTreeSet<&str> = b.split_whitespace().collect();

    let common: Vec<&str> = set_a.intersection(&set_b).copied().collect();
    let only_a: Vec<&str> = set_a.difference(&set_b).copied().collect();
    let only_b: Vec<&str> = set_b.difference(&set_a).copied().collect();

    let base = common.join(" ");
    let join = |extra: &[&str]| {
        if base.is_empty() {
            extra.join(" ")
        } else if extra.is_empty() {
            base.clone()
        } else {
            format!("{} {}", base, extra.join(" "))
        }
    };
    let with_a = join(&only_a);
    let with_b = join(&only_b);

    let mut best = ratio(&with_a, &with_b);
    if !base.is_empty() {
        best = best.max(ratio(&base, &with_a)).max(ratio(&base, &with_b));
    }
    best
}
