use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A raw term as produced by an upstream keyword extractor.
///
/// Scores are expected in [0, 1] but are not trusted; see [`normalize_keywords`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTerm {
    pub term: String,
    pub score: f32,
}

impl ScoredTerm {
    pub fn new(term: impl Into<String>, score: f32) -> Self {
        Self {
            term: term.into(),
            score,
        }
    }
}

/// A normalized, scored and ranked term used to query knowledge sources.
///
/// Rank 0 is the most important keyword of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    term: String,
    score: f32,
    rank: usize,
}

impl Keyword {
    /// Build a keyword directly. The term is normalized and the score clamped;
    /// returns `None` when nothing is left of the term.
    pub fn new(term: &str, score: f32, rank: usize) -> Option<Self> {
        let term = normalize_term(term);
        if term.is_empty() {
            return None;
        }
        Some(Self {
            term,
            score: clamp_score(score),
            rank,
        })
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// Lowercase, collapse inner whitespace and trim surrounding punctuation.
pub fn normalize_term(raw: &str) -> String {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

/// Upstream scores are not guaranteed to be normalized.
fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Turn upstream terms into the ranked keyword list for one request.
///
/// - terms are normalized; empty results are dropped
/// - duplicates (by normalized term) collapse into one, keeping the highest score
/// - ranks are assigned by descending score; equal scores keep upstream order
pub fn normalize_keywords(terms: &[ScoredTerm]) -> Vec<Keyword> {
    // normalized term -> (first upstream position, best score)
    let mut seen: HashMap<String, (usize, f32)> = HashMap::new();
    for (position, raw) in terms.iter().enumerate() {
        let term = normalize_term(&raw.term);
        if term.is_empty() {
            continue;
        }
        let score = clamp_score(raw.score);
        seen.entry(term)
            .and_modify(|entry| entry.1 = entry.1.max(score))
            .or_insert((position, score));
    }

    let mut ordered: Vec<(String, usize, f32)> = seen
        .into_iter()
        .map(|(term, (position, score))| (term, position, score))
        .collect();
    ordered.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    ordered
        .into_iter()
        .enumerate()
        .map(|(rank, (term, _, score))| Keyword { term, score, rank })
        .collect()
}
