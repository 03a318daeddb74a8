use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suitability verdict for the scanned product, for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suitability {
    Suitable,
    ModeratelySuitable,
    NotSuitable,
    Unknown,
}

impl Suitability {
    /// Parse the verdict keyword the model is asked to emit.
    /// Accepts the short labels `S`, `MS`, `NS` as well.
    pub fn parse(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
            .replace([' ', '-'], "_");
        match normalized.as_str() {
            "suitable" | "s" => Self::Suitable,
            "moderately_suitable" | "ms" => Self::ModeratelySuitable,
            "not_suitable" | "unsuitable" | "ns" => Self::NotSuitable,
            _ => Self::Unknown,
        }
    }
}

/// How much the recommendation can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Normal,
    /// Degraded path: no evidence, or the model output was unusable.
    Low,
}

/// Final user-facing output of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub run_id: Uuid,
    pub summary: String,
    pub attributions: Vec<String>,
    pub warnings: Vec<String>,
    pub suitability: Suitability,
    pub confidence: ConfidenceLevel,
    pub generated_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn is_low_confidence(&self) -> bool {
        self.confidence == ConfidenceLevel::Low
    }
}
