//! Model invoker
//!
//! One outbound call per operation against the generative model provider.
//! Structured output goes through a fallback parse chain and image output is
//! checked against a MIME allow-list. No retries happen at this layer; retry
//! policy belongs to the job worker.

pub mod gemini;
pub mod parse;

pub use gemini::GeminiProvider;
pub use parse::{extract_fenced_block, normalize_mime_type, parse_structured, ALLOWED_IMAGE_MIME_TYPES};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Model invoker errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// No API key configured; raised before any network I/O
    #[error("Provider credentials not configured: {0}")]
    MissingCredentials(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Non-success response from the provider
    #[error("Provider returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Provider returned no usable content")]
    EmptyResponse,

    /// Structured output that is not JSON even after fenced-block recovery
    #[error("Unparseable AI response: {0}")]
    Unparseable(String),

    #[error("Unsupported image MIME type: {0}")]
    InvalidMimeType(String),
}

impl ProviderError {
    /// Output that violates the expected format (as opposed to an outage)
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, ProviderError::Unparseable(_) | ProviderError::InvalidMimeType(_))
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::MissingCredentials(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub prompt: String,
    /// Provider default when None
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for JSON-formatted output
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextOutput {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput<T> {
    pub data: T,
    pub raw: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageOutput {
    pub image: Vec<u8>,
    pub mime_type: String,
    /// Any accompanying text the model returned
    pub text: Option<String>,
    pub model: String,
}

impl ImageOutput {
    /// File extension for the (already validated) MIME type
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

/// Text and image completion capabilities of a generative model provider
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete_text(&self, request: TextRequest) -> Result<TextOutput, ProviderError>;

    async fn complete_image(&self, request: ImageRequest) -> Result<ImageOutput, ProviderError>;
}

/// Plain text generation
pub async fn generate_text(
    provider: &dyn ModelProvider,
    prompt: &str,
    model: Option<&str>,
    max_tokens: Option<u32>,
) -> Result<TextOutput, ProviderError> {
    let output = provider
        .complete_text(TextRequest {
            prompt: prompt.to_string(),
            model: model.map(str::to_string),
            max_tokens,
            json: false,
        })
        .await?;

    if output.text.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(output)
}

/// JSON generation decoded into `T`
pub async fn generate_structured<T: DeserializeOwned>(
    provider: &dyn ModelProvider,
    prompt: &str,
    model: Option<&str>,
    max_tokens: Option<u32>,
) -> Result<StructuredOutput<T>, ProviderError> {
    let output = provider
        .complete_text(TextRequest {
            prompt: prompt.to_string(),
            model: model.map(str::to_string),
            max_tokens,
            json: true,
        })
        .await?;

    let data = parse_structured::<T>(&output.text)?;
    Ok(StructuredOutput {
        data,
        raw: output.text,
        model: output.model,
    })
}

/// Image generation with MIME allow-list enforcement
pub async fn generate_image(
    provider: &dyn ModelProvider,
    prompt: &str,
    model: Option<&str>,
) -> Result<ImageOutput, ProviderError> {
    let mut output = provider
        .complete_image(ImageRequest {
            prompt: prompt.to_string(),
            model: model.map(str::to_string),
        })
        .await?;

    let mime_type = normalize_mime_type(&output.mime_type);
    if !ALLOWED_IMAGE_MIME_TYPES.contains(&mime_type.as_str()) {
        tracing::warn!(mime_type = %output.mime_type, model = %output.model, "Provider returned disallowed image type");
        return Err(ProviderError::InvalidMimeType(output.mime_type));
    }
    if output.image.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }

    output.mime_type = mime_type;
    Ok(output)
}
