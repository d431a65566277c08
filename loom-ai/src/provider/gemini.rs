//! Gemini-style `generateContent` client

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use loom_common::config::ProviderConfig;
use serde_json::{json, Value};

use super::{ImageOutput, ImageRequest, ModelProvider, ProviderError, TextOutput, TextRequest};

const USER_AGENT: &str = concat!("storyloom/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the generative model provider
pub struct GeminiProvider {
    http_client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    text_model: String,
    image_model: String,
}

impl GeminiProvider {
    /// `api_key` is the resolved key; when None every call fails with
    /// `MissingCredentials` without touching the network
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self, model: &str) -> String {
        let model_path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        format!("{}/{}:generateContent", self.base_url, model_path)
    }

    async fn post(&self, model: &str, body: Value) -> Result<Value, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ProviderError::MissingCredentials("no provider API key configured".to_string())
        })?;

        tracing::debug!(model = %model, "Calling generateContent");

        let response = self
            .http_client
            .post(self.endpoint(model))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !status.is_success() {
            tracing::warn!(model = %model, status = status.as_u16(), "Provider call failed");
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        serde_json::from_str(&text).map_err(|e| ProviderError::Upstream {
            status: status.as_u16(),
            message: format!("malformed provider envelope: {}", e),
        })
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn complete_text(&self, request: TextRequest) -> Result<TextOutput, ProviderError> {
        let model = request.model.clone().unwrap_or_else(|| self.text_model.clone());
        let body = text_request_body(&request);
        let envelope = self.post(&model, body).await?;
        let text = extract_text(&envelope).ok_or(ProviderError::EmptyResponse)?;

        Ok(TextOutput { text, model })
    }

    async fn complete_image(&self, request: ImageRequest) -> Result<ImageOutput, ProviderError> {
        let model = request.model.clone().unwrap_or_else(|| self.image_model.clone());
        let body = image_request_body(&request.prompt);
        let envelope = self.post(&model, body).await?;
        let (image, mime_type) = extract_inline_image(&envelope)?.ok_or(ProviderError::EmptyResponse)?;

        Ok(ImageOutput {
            image,
            mime_type,
            text: extract_text(&envelope),
            model,
        })
    }
}

fn text_request_body(request: &TextRequest) -> Value {
    let mut generation_config = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if request.json {
        generation_config.insert("responseMimeType".to_string(), json!("application/json"));
    }

    let mut body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
    });
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    body
}

fn image_request_body(prompt: &str) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
    })
}

fn first_candidate_parts(envelope: &Value) -> &[Value] {
    envelope
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Concatenated text parts of the first candidate
fn extract_text(envelope: &Value) -> Option<String> {
    let text: String = first_candidate_parts(envelope)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// First inline image part, decoded
fn extract_inline_image(envelope: &Value) -> Result<Option<(Vec<u8>, String)>, ProviderError> {
    for part in first_candidate_parts(envelope) {
        let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
            continue;
        };
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let data = inline.get("data").and_then(Value::as_str).unwrap_or("");
        let bytes = BASE64
            .decode(data)
            .map_err(|e| ProviderError::Upstream {
                status: 200,
                message: format!("invalid base64 image data: {}", e),
            })?;
        return Ok(Some((bytes, mime_type)));
    }
    Ok(None)
}

/// Provider error message from `{"error": {"message": …}}`, else the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
