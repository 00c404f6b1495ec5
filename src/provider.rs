use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::ProviderError;

/// One structured-output call: a fixed system prompt plus a single JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub system_prompt: String,
    pub payload: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub content: String,
    /// Model name as reported by the endpoint.
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// External text-generation endpoint.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError>;
}

pub struct OpenAiCompatibleGenerator {
    client: Client,
    base_url: String,
    api_key: String,
}

/// HTTPS is required unless the endpoint runs on this machine.
fn validate_base_url(base_url: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(base_url)
        .with_context(|| format!("Invalid base_url '{base_url}'"))?;

    let host = parsed.host_str().unwrap_or("");
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";
            if !is_localhost {
                bail!("HTTP is not allowed for remote URLs (base_url: '{base_url}'). Use HTTPS.");
            }
            warn!(base_url, "Using unencrypted HTTP for a local model server");
            Ok(())
        }
        scheme => bail!(
            "Unsupported URL scheme '{scheme}' in base_url '{base_url}'. Only http and https are allowed."
        ),
    }
}

impl OpenAiCompatibleGenerator {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        validate_base_url(base_url)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

/// Pull the assistant message out of a chat-completions response body.
fn parse_completion(data: &Value, requested_model: &str) -> Result<GenerationOutput, ProviderError> {
    let content = data["choices"]
        .get(0)
        .and_then(|choice| choice["message"]["content"].as_str())
        .map(str::to_string)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| ProviderError::malformed("response carried no message content"))?;

    let usage = data.get("usage").and_then(|u| {
        Some(TokenUsage {
            input_tokens: u.get("prompt_tokens")?.as_u64()? as u32,
            output_tokens: u.get("completion_tokens")?.as_u64()? as u32,
        })
    });

    Ok(GenerationOutput {
        content,
        model: data["model"]
            .as_str()
            .unwrap_or(requested_model)
            .to_string(),
        usage,
    })
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        let body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.payload},
            ],
        });

        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %request.model, url = %url, payload_bytes = request.payload.len(), "Calling text generation endpoint");

        let resp = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("HTTP request failed: {}", e);
                return Err(ProviderError::network(&e));
            }
        };

        let status = resp.status();
        let text = resp.text().await.map_err(|e| ProviderError::network(&e))?;

        if !status.is_success() {
            error!(status = %status, "Provider API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::malformed(format!("response body is not JSON: {e}")))?;
        let output = parse_completion(&data, &request.model)?;
        if let Some(usage) = &output.usage {
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Token usage"
            );
        }
        Ok(output)
    }
}
