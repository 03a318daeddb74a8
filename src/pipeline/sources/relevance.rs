//! Relevance of a retrieved item to the keyword it was found for.
//!
//! Term-frequency cosine similarity between the keyword and the item text,
//! blended with the source's own ordering.

use std::collections::HashMap;

const SIMILARITY_WEIGHT: f32 = 0.7;
const POSITION_WEIGHT: f32 = 0.3;

/// Lowercased alphanumeric tokens of at least two characters.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<&str, f32> {
    let mut freq = HashMap::new();
    for t in tokens {
        *freq.entry(t.as_str()).or_insert(0.0) += 1.0;
    }
    freq
}

/// Cosine similarity of the term-frequency vectors of `a` and `b`, in `[0, 1]`.
pub fn cosine_similarity(a: &str, b: &str) -> f32 {
    let a_tokens = tokenize(a);
    let b_tokens = tokenize(b);
    if a_tokens.is_empty() || b_tokens.is_empty() {
        return 0.0;
    }
    let a_freq = term_frequencies(&a_tokens);
    let b_freq = term_frequencies(&b_tokens);

    let dot: f32 = a_freq
        .iter()
        .filter_map(|(term, wa)| b_freq.get(term).map(|wb| wa * wb))
        .sum();
    let norm_a = a_freq.values().map(|w| w * w).sum::<f32>().sqrt();
    let norm_b = b_freq.values().map(|w| w * w).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Relevance in `[0, 1]` for the item at `position` (0-based) in a source's
/// result list.
pub fn relevance(keyword: &str, title: &str, snippet: &str, position: usize) -> f32 {
    let similarity = cosine_similarity(keyword, &format!("{title} {snippet}"));
    let position_score = 1.0 / (1.0 + position as f32);
    (SIMILARITY_WEIGHT * similarity + POSITION_WEIGHT * position_score).clamp(0.0, 1.0)
}
