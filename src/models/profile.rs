use serde::{Deserialize, Serialize};

/// Biological sex as entered by the user; affects reference intakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Female,
    Male,
    Unspecified,
}

impl Sex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Female => "female",
            Self::Male => "male",
            Self::Unspecified => "unspecified",
        }
    }
}

/// Personal health details used to personalize a recommendation.
///
/// Every field is optional; an empty profile yields a general recommendation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub age_years: Option<u8>,
    pub sex: Option<Sex>,
    pub weight_kg: Option<f32>,
    pub height_cm: Option<f32>,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub conditions: Vec<String>,
    pub dietary_goals: Vec<String>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.age_years.is_none()
            && self.sex.is_none()
            && self.weight_kg.is_none()
            && self.height_cm.is_none()
            && self.allergies.is_empty()
            && self.medications.is_empty()
            && self.conditions.is_empty()
            && self.dietary_goals.is_empty()
    }

    /// Body-mass index, when both weight and height are plausible.
    pub fn bmi(&self) -> Option<f32> {
        let weight = self.weight_kg.filter(|w| *w > 0.0 && *w < 500.0)?;
        let height_m = self.height_cm.filter(|h| *h > 30.0 && *h < 300.0)? / 100.0;
        Some(weight / (height_m * height_m))
    }
}
