//! USDA FoodData Central search: nutrient composition of ingredients.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::{acquire, get_json};
use super::relevance::relevance;
use super::{clean_snippet, validate_query, RateLimiter, SourceClient, SourceError};
use crate::models::{EvidenceItem, EvidenceSource, Keyword};

const NAME: &str = "fooddata_central";

/// Nutrients listed per food in the snippet.
const KEY_NUTRIENTS: usize = 3;

pub struct FoodDataClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    limiter: Arc<dyn RateLimiter>,
    max_snippet_chars: usize,
}

impl FoodDataClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        client: reqwest::Client,
        limiter: Arc<dyn RateLimiter>,
        max_snippet_chars: usize,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            limiter,
            max_snippet_chars,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    foods: Vec<Food>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Food {
    fdc_id: Option<u64>,
    description: Option<String>,
    brand_owner: Option<String>,
    #[serde(default)]
    food_nutrients: Vec<FoodNutrient>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FoodNutrient {
    nutrient_name: Option<String>,
    value: Option<f64>,
    unit_name: Option<String>,
}

fn describe(food: &Food) -> String {
    let description = food.description.as_deref().unwrap_or("Unknown food");
    let brand = food.brand_owner.as_deref().unwrap_or("N/A");
    let nutrients: Vec<String> = food
        .food_nutrients
        .iter()
        .filter_map(|n| {
            let name = n.nutrient_name.as_deref()?;
            let value = n.value?;
            let unit = n.unit_name.as_deref().unwrap_or("").to_lowercase();
            Some(format!("{name}: {value} {unit}").trim_end().to_string())
        })
        .take(KEY_NUTRIENTS)
        .collect();
    if nutrients.is_empty() {
        format!("{description} (Brand: {brand}).")
    } else {
        format!("{description} (Brand: {brand}). Key nutrients: {}.", nutrients.join(", "))
    }
}

fn to_evidence(response: SearchResponse, keyword: &Keyword, limit: usize, max_snippet_chars: usize) -> Vec<EvidenceItem> {
    response
        .foods
        .into_iter()
        .take(limit)
        .enumerate()
        .filter_map(|(position, food)| {
            let id = food.fdc_id?;
            let url = format!("https://fdc.nal.usda.gov/fdc-app.html#/food-details/{id}/nutrients");
            let title = food.description.clone().unwrap_or_default();
            let snippet = clean_snippet(&describe(&food), max_snippet_chars);
            let score = relevance(keyword.term(), &title, &snippet, position);
            EvidenceItem::new(EvidenceSource::NutritionDatabase, title, snippet, url, keyword.clone(), score)
        })
        .collect()
}

#[async_trait]
impl SourceClient for FoodDataClient {
    fn source(&self) -> EvidenceSource {
        EvidenceSource::NutritionDatabase
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn search(&self, keyword: &Keyword, limit: usize) -> Result<Vec<EvidenceItem>, SourceError> {
        validate_query(keyword, limit)?;
        acquire(self.limiter.as_ref(), NAME)?;

        let page_size = limit.to_string();
        let request = self
            .client
            .get(format!("{}/fdc/v1/foods/search", self.base_url))
            .query(&[
                ("query", keyword.term()),
                ("pageSize", page_size.as_str()),
                ("api_key", self.api_key.as_str()),
            ]);
        let response: SearchResponse = get_json(request).await?;
        let items = to_evidence(response, keyword, limit, self.max_snippet_chars);
        tracing::debug!(source = NAME, keyword = keyword.term(), count = items.len(), "FoodData search complete");
        Ok(items)
    }
}
