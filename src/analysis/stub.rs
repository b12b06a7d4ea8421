//! Deterministic engine for offline runs and tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AnalysisEngine, AnalysisError, AnalysisInput};

#[derive(Debug, Clone)]
pub struct StubAnalysisEngine {
    latency: Duration,
}

impl StubAnalysisEngine {
    /// `latency` simulates inference time so clients can observe `processing`.
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    #[cfg(test)]
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }
}

fn sample_responses() -> [Value; 3] {
    [
        json!({
            "calories": 520,
            "macros": { "protein": 32, "carbs": 48, "fat": 22 },
            "items": [
                { "name": "Grilled chicken", "quantity": 1, "unit": "plate" },
                { "name": "Roasted vegetables", "quantity": 1, "unit": "cup" },
                { "name": "Brown rice", "quantity": 1, "unit": "cup" }
            ]
        }),
        json!({
            "calories": 360,
            "macros": { "protein": 18, "carbs": 42, "fat": 12 },
            "items": [
                { "name": "Greek yogurt", "quantity": 1, "unit": "bowl" },
                { "name": "Granola", "quantity": 0.5, "unit": "cup" },
                { "name": "Mixed berries", "quantity": 0.75, "unit": "cup" }
            ]
        }),
        json!({
            "calories": 610,
            "macros": { "protein": 26, "carbs": 55, "fat": 28 },
            "items": [
                { "name": "Salmon fillet", "quantity": 1, "unit": "piece" },
                { "name": "Mashed potatoes", "quantity": 1, "unit": "cup" },
                { "name": "Side salad", "quantity": 1, "unit": "bowl" }
            ]
        }),
    ]
}

/// First image byte, or the byte-sum of the lower-cased label.
fn seed(input: &AnalysisInput<'_>) -> u8 {
    if let Some(&first) = input.image.and_then(|bytes| bytes.first()) {
        return first;
    }

    input
        .label
        .map(|label| label.trim().to_lowercase())
        .map(|label| {
            label
                .bytes()
                .fold(0u8, |acc, b| acc.wrapping_add(b))
        })
        .unwrap_or(0)
}

#[async_trait]
impl AnalysisEngine for StubAnalysisEngine {
    async fn analyze(&self, input: AnalysisInput<'_>) -> Result<Value, AnalysisError> {
        if input.image.is_none() && input.label.is_none() {
            return Err(AnalysisError::EmptyInput);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let responses = sample_responses();
        let index = usize::from(seed(&input)) % responses.len();
        Ok(responses[index].clone())
    }

    fn engine_name(&self) -> &'static str {
        "stub"
    }
}
