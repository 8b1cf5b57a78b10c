//! HTTP vision client speaking a chat-completions style API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{prompts, Detection, PageExtraction, VisionError, VisionExtractor};
use crate::models::{Schema, Value};

/// Vision API connection settings.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

/// Vision extractor backed by an OpenAI-compatible chat endpoint.
pub struct HttpVisionExtractor {
    config: VisionConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl HttpVisionExtractor {
    pub fn new(config: VisionConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send one prompt + image to the model and return the raw content.
    async fn call_model(&self, prompt: &str, page_png: &[u8]) -> Result<String, VisionError> {
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(page_png)
        );
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: prompt.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                ],
            }],
            max_tokens: 4096,
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VisionError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VisionError::InvalidResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| VisionError::InvalidResponse("empty choices".to_string()))?;

        debug!(model = %self.config.model, bytes = content.len(), "vision response received");
        Ok(content)
    }
}

fn classify_transport_error(e: reqwest::Error) -> VisionError {
    if e.is_timeout() {
        VisionError::Timeout
    } else {
        VisionError::Unavailable(e.to_string())
    }
}

/// Strip Markdown code fences the model may wrap JSON in.
pub(crate) fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language tag on the opening fence.
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim().strip_suffix("```").unwrap_or(inner).trim()
}

/// Parse a `{"fields": ..., "confidence": ...}` model response.
pub(crate) fn parse_extraction(content: &str) -> Result<PageExtraction, VisionError> {
    let json: serde_json::Value = serde_json::from_str(strip_code_fences(content))
        .map_err(|e| VisionError::InvalidResponse(format!("not JSON: {e}")))?;

    let object = json
        .as_object()
        .ok_or_else(|| VisionError::InvalidResponse("expected a JSON object".to_string()))?;

    let raw_fields = object
        .get("fields")
        .and_then(|f| f.as_object())
        .ok_or_else(|| VisionError::InvalidResponse("missing 'fields' object".to_string()))?;

    let mut fields = BTreeMap::new();
    for (name, value) in raw_fields {
        if value.is_null() {
            continue;
        }
        fields.insert(name.clone(), Value::from_json(value.clone()));
    }

    let mut confidence = BTreeMap::new();
    if let Some(raw_confidence) = object.get("confidence").and_then(|c| c.as_object()) {
        for (name, value) in raw_confidence {
            if let Some(score) = value.as_f64() {
                confidence.insert(name.clone(), score.clamp(0.0, 1.0));
            }
        }
    }
    // Fields the model scored nothing for get a neutral confidence.
    for name in fields.keys() {
        confidence.entry(name.clone()).or_insert(0.5);
    }
    confidence.retain(|name, _| fields.contains_key(name));

    Ok(PageExtraction { fields, confidence })
}

/// Parse a schema-detection response.
pub(crate) fn parse_detection(content: &str) -> Result<Detection, VisionError> {
    serde_json::from_str(strip_code_fences(content))
        .map_err(|e| VisionError::InvalidResponse(format!("bad detection response: {e}")))
}

#[async_trait]
impl VisionExtractor for HttpVisionExtractor {
    async fn extract(
        &self,
        page_png: &[u8],
        schema: &Schema,
    ) -> Result<PageExtraction, VisionError> {
        let prompt = prompts::extraction_prompt(schema);
        let content = self.call_model(&prompt, page_png).await?;
        parse_extraction(&content)
    }

    async fn detect(
        &self,
        page_png: &[u8],
        known_schemas: &[String],
        hint: Option<&str>,
    ) -> Result<Detection, VisionError> {
        let prompt = prompts::detection_prompt(known_schemas, hint);
        let content = self.call_model(&prompt, page_png).await?;
        let mut detection = parse_detection(&content)?;
        detection.confidence = detection.confidence.clamp(0.0, 1.0);
        Ok(detection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn parse_extraction_types_and_filters() {
        let content = r#"{
            "fields": {
                "invoice_number": "INV-42",
                "invoice_date": "2024-06-01",
                "total": 199.5,
                "notes": null
            },
            "confidence": {"invoice_number": 0.98, "total": 1.4}
        }"#;

        let extraction = parse_extraction(content).unwrap();
        assert_eq!(
            extraction.fields["invoice_number"],
            Value::Text("INV-42".to_string())
        );
        assert!(matches!(extraction.fields["invoice_date"], Value::Date(_)));
        assert_eq!(extraction.fields["total"], Value::Number(199.5));
        // Nulls are dropped, not stored as empty strings.
        assert!(!extraction.fields.contains_key("notes"));
        // Confidence is clamped and backfilled for unscored fields.
        assert_eq!(extraction.confidence["total"], 1.0);
        assert_eq!(extraction.confidence["invoice_date"], 0.5);
    }

    #[test]
    fn parse_extraction_rejects_malformed() {
        assert!(parse_extraction("totally not json").is_err());
        assert!(parse_extraction(r#"{"no_fields": {}}"#).is_err());
        assert!(parse_extraction(r#"[1,2,3]"#).is_err());
    }

    #[test]
    fn parse_detection_reads_fenced_response() {
        let content = "```json\n{\"schema_name\": \"invoice\", \"confidence\": 0.91, \"suggested_fields\": [\"total\"]}\n```";
        let detection = parse_detection(content).unwrap();
        assert_eq!(detection.schema_name, "invoice");
        assert_eq!(detection.confidence, 0.91);
        assert_eq!(detection.suggested_fields, vec!["total".to_string()]);
    }
}
