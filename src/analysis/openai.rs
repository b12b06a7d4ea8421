//! Model-backed engine using the OpenAI Responses API.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{AnalysisEngine, AnalysisError, AnalysisInput};

const RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

#[derive(Debug)]
pub struct OpenAiAnalysisEngine {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiAnalysisEngine {
    /// `timeout` bounds the whole request, so a hung call ends as a failed
    /// analysis instead of holding the draft in `processing`.
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::NotConfigured(format!("HTTP client: {e}")))?;
        Ok(Self {
            api_key,
            model,
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

fn meal_analysis_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "calories": { "type": "number" },
            "macros": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "protein": { "type": "number" },
                    "carbs": { "type": "number" },
                    "fat": { "type": "number" }
                },
                "required": ["protein", "carbs", "fat"]
            },
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "name": { "type": "string" },
                        "quantity": { "type": "number" },
                        "unit": { "type": "string" }
                    },
                    "required": ["name", "quantity", "unit"]
                }
            }
        },
        "required": ["calories", "macros", "items"]
    })
}

fn request_body(model: &str, input: &AnalysisInput<'_>) -> Value {
    let mut content = Vec::new();

    if let Some(label) = input.label.map(str::trim).filter(|l| !l.is_empty()) {
        content.push(json!({ "type": "input_text", "text": format!("Meal name: {label}") }));
    }

    if let Some(image) = input.image.filter(|bytes| !bytes.is_empty()) {
        content.push(json!({
            "type": "input_image",
            "image_url": format!("data:image/jpeg;base64,{}", STANDARD.encode(image)),
        }));
    }

    json!({
        "model": model,
        "temperature": 0,
        "input": [{ "role": "user", "content": content }],
        "text": {
            "format": {
                "type": "json_schema",
                "name": "MealAnalysis",
                "schema": meal_analysis_schema(),
                "strict": true
            }
        }
    })
}

/// Pull the structured JSON out of a Responses payload. A response without
/// text yields an empty estimate rather than an error.
fn parse_output(body: &str) -> Result<Value, AnalysisError> {
    let parsed: ResponsesBody =
        serde_json::from_str(body).map_err(|e| AnalysisError::ParseError(e.to_string()))?;

    let text = parsed
        .output
        .into_iter()
        .flat_map(|item| item.content)
        .find(|c| c.kind == "output_text")
        .and_then(|c| c.text);

    match text {
        Some(text) => {
            serde_json::from_str(&text).map_err(|e| AnalysisError::ParseError(e.to_string()))
        }
        None => Ok(json!({
            "calories": 0,
            "macros": { "protein": 0, "carbs": 0, "fat": 0 },
            "items": []
        })),
    }
}

#[async_trait]
impl AnalysisEngine for OpenAiAnalysisEngine {
    async fn analyze(&self, input: AnalysisInput<'_>) -> Result<Value, AnalysisError> {
        if input.image.is_none() && input.label.is_none() {
            return Err(AnalysisError::EmptyInput);
        }

        let response = self
            .client
            .post(RESPONSES_URL)
            .bearer_auth(&self.api_key)
            .json(&request_body(&self.model, &input))
            .send()
            .await
            .map_err(|e| AnalysisError::RequestFailed(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AnalysisError::RequestFailed(e.to_string()))?;

        if status != 200 {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(AnalysisError::ApiError { status, message });
        }

        parse_output(&body)
    }

    fn engine_name(&self) -> &'static str {
        "openai"
    }
}
