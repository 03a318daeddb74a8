//! Pure merge step: filter, deduplicate, score, order and cap.
//!
//! The result depends only on the set of input items, never on the order in
//! which queries completed.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{EvidenceItem, EvidenceSet, EvidenceSource, ScoredEvidence};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeLimits {
    pub min_relevance: f32,
    pub max_items: usize,
    pub max_chars: usize,
}

/// Aggregation score: relevance discounted by keyword rank.
pub fn score(item: &EvidenceItem) -> f32 {
    item.relevance() / (1.0 + item.retrieved_for().rank() as f32)
}

/// Whether `candidate` should replace `current` for the same `(source, url)`.
fn prefer(candidate: &EvidenceItem, current: &EvidenceItem) -> bool {
    let by_relevance = candidate
        .relevance()
        .partial_cmp(&current.relevance())
        .unwrap_or(Ordering::Equal);
    match by_relevance {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => {
            let key = |i: &EvidenceItem| (i.retrieved_for().rank(), i.title().to_string(), i.snippet().to_string());
            key(candidate) < key(current)
        }
    }
}

fn ordering(a: &ScoredEvidence, b: &ScoredEvidence) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.item.retrieved_for().rank().cmp(&b.item.retrieved_for().rank()))
        .then_with(|| a.item.source().cmp(&b.item.source()))
        .then_with(|| a.item.url().cmp(b.item.url()))
}

pub fn merge(items: Vec<EvidenceItem>, limits: &MergeLimits) -> EvidenceSet {
    let mut best: HashMap<(EvidenceSource, String), EvidenceItem> = HashMap::new();
    for item in items {
        if item.relevance() < limits.min_relevance {
            continue;
        }
        let key = (item.source(), item.url().to_string());
        match best.get(&key) {
            Some(current) if !prefer(&item, current) => {}
            _ => {
                best.insert(key, item);
            }
        }
    }

    let mut scored: Vec<ScoredEvidence> = best
        .into_values()
        .map(|item| ScoredEvidence {
            score: score(&item),
            item,
        })
        .collect();
    scored.sort_by(ordering);

    let mut total_chars = 0usize;
    let mut kept = Vec::new();
    for entry in scored {
        if kept.len() >= limits.max_items {
            break;
        }
        let chars = entry.item.snippet_chars();
        if total_chars + chars > limits.max_chars {
            break;
        }
        total_chars += chars;
        kept.push(entry);
    }

    EvidenceSet::from_ranked(kept)
}
