//! Nutrition analysis: the engine abstraction and the estimate it yields.
//!
//! Engines return the raw JSON they produced; [`MealAnalysis::from_raw`]
//! turns that into a sanitized estimate so a malformed response never fails
//! the draft pipeline on its own.

mod normalize;
mod openai;
mod stub;

pub use openai::OpenAiAnalysisEngine;
pub use stub::StubAnalysisEngine;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AnalysisConfig, AnalysisProvider};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Macros {
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisItem {
    pub name: String,
    pub quantity: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MealAnalysis {
    pub calories: f64,
    pub macros: Macros,
    pub items: Vec<AnalysisItem>,
}

/// What an engine is asked to look at. At least one side is present.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    pub image: Option<&'a [u8]>,
    pub label: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("nothing to analyze: neither image nor label given")]
    EmptyInput,

    #[error("API request failed: {0}")]
    RequestFailed(String),

    #[error("API returned error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Produce a raw nutrition estimate for the image and/or label.
    async fn analyze(&self, input: AnalysisInput<'_>) -> Result<serde_json::Value, AnalysisError>;

    fn engine_name(&self) -> &'static str;
}

pub fn engine_from_config(cfg: &AnalysisConfig) -> Result<Arc<dyn AnalysisEngine>, AnalysisError> {
    match cfg.provider {
        AnalysisProvider::Stub => Ok(Arc::new(StubAnalysisEngine::new(Duration::from_millis(
            cfg.stub_latency_ms,
        )))),
        AnalysisProvider::OpenAi => {
            let api_key = cfg
                .openai_api_key
                .clone()
                .ok_or_else(|| AnalysisError::NotConfigured("OPENAI_API_KEY not set".into()))?;
            Ok(Arc::new(OpenAiAnalysisEngine::new(
                api_key,
                cfg.openai_model.clone(),
                Duration::from_secs(cfg.request_timeout_secs),
            )?))
        }
    }
}
