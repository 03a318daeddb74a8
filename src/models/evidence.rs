use serde::{Deserialize, Serialize};

use super::keyword::Keyword;

/// Which kind of external knowledge source produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    /// Scientific abstract index (Europe PMC).
    ArticleIndex,
    /// Encyclopedic reference (Wikipedia).
    Encyclopedia,
    /// Food composition database (USDA FoodData Central).
    NutritionDatabase,
}

impl EvidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArticleIndex => "article_index",
            Self::Encyclopedia => "encyclopedia",
            Self::NutritionDatabase => "nutrition_database",
        }
    }
}

impl std::fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArticleIndex => write!(f, "Scientific literature"),
            Self::Encyclopedia => write!(f, "Encyclopedia"),
            Self::NutritionDatabase => write!(f, "Nutrition database"),
        }
    }
}

/// One retrieved piece of external knowledge, tied to the keyword it was found for.
///
/// Immutable once built: fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    source: EvidenceSource,
    title: String,
    snippet: String,
    url: String,
    retrieved_for: Keyword,
    relevance: f32,
}

impl EvidenceItem {
    /// Returns `None` for items that could never be attributed or shown:
    /// an empty url, or both title and snippet empty.
    pub fn new(
        source: EvidenceSource,
        title: impl Into<String>,
        snippet: impl Into<String>,
        url: impl Into<String>,
        retrieved_for: Keyword,
        relevance: f32,
    ) -> Option<Self> {
        let title = title.into().trim().to_string();
        let snippet = snippet.into().trim().to_string();
        let url = url.into().trim().to_string();
        if url.is_empty() || (title.is_empty() && snippet.is_empty()) {
            return None;
        }
        let relevance = if relevance.is_nan() {
            0.0
        } else {
            relevance.clamp(0.0, 1.0)
        };
        Some(Self {
            source,
            title,
            snippet,
            url,
            retrieved_for,
            relevance,
        })
    }

    pub fn source(&self) -> EvidenceSource {
        self.source
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn snippet(&self) -> &str {
        &self.snippet
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn retrieved_for(&self) -> &Keyword {
        &self.retrieved_for
    }

    pub fn relevance(&self) -> f32 {
        self.relevance
    }

    /// Snippet length in characters, the unit of the evidence cap.
    pub fn snippet_chars(&self) -> usize {
        self.snippet.chars().count()
    }

    /// The same source result, attributed to `keyword` instead.
    pub fn for_keyword(&self, keyword: &Keyword) -> Self {
        Self {
            retrieved_for: keyword.clone(),
            ..self.clone()
        }
    }

    /// Title to show when the source gave none.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }
}

/// An evidence item with its aggregation score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEvidence {
    pub item: EvidenceItem,
    pub score: f32,
}

/// The deduplicated, capped, ranked evidence for one pipeline run.
///
/// Only the aggregator builds non-empty sets (see `aggregation::merge`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSet {
    items: Vec<ScoredEvidence>,
}

impl EvidenceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_ranked(items: Vec<ScoredEvidence>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ScoredEvidence] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_snippet_chars(&self) -> usize {
        self.items.iter().map(|e| e.item.snippet_chars()).sum()
    }

    pub fn urls(&self) -> Vec<String> {
        self.items.iter().map(|e| e.item.url().to_string()).collect()
    }
}
