//! Chat-completions classifier built on rig-core's OpenAI client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{LlmBackend, LlmConfig};
use crate::collaborators::{Classification, Classifier};
use crate::error::LlmError;

const SYSTEM_PROMPT: &str = "You are an email categorization assistant. Always respond with a valid JSON object containing 'category' and 'explanation' fields.";

const TEMPERATURE: f64 = 0.3;
const MAX_TOKENS: u64 = 500;

/// Ollama ignores the bearer token, but the client still sends one.
const KEYLESS_API_KEY: &str = "ollama";

pub struct OpenAiClassifier {
    config: LlmConfig,
    client: openai::CompletionsClient,
}

impl OpenAiClassifier {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_else(|| KEYLESS_API_KEY.to_string());

        let client: openai::CompletionsClient = openai::CompletionsClient::builder()
            .api_key(api_key)
            .base_url(&config.base_url)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.backend.to_string(),
                reason: format!("Failed to create client: {e}"),
            })?;

        info!(provider = %config.backend, model = %config.model, "Using classifier");
        Ok(Self { config, client })
    }

    fn provider(&self) -> String {
        self.config.backend.to_string()
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// User message for one classification.
fn user_prompt(text: &str, categories: &[String]) -> String {
    format!(
        "Categorize this email into exactly ONE of these categories:\n\n{}\n\n\
         Email content:\n{text}\n\n\
         Respond with a JSON object:\n\
         {{\n    \"explanation\": \"<brief reason for this categorization>\",\n    \
         \"category\": \"<exact category name from the list>\"\n}}",
        categories.join(", ")
    )
}

/// Extra request fields. Only OpenAI supports JSON mode.
fn additional_params(backend: LlmBackend) -> Option<serde_json::Value> {
    (backend == LlmBackend::OpenAi).then(|| json!({ "response_format": { "type": "json_object" } }))
}

/// Map a transport error onto the error taxonomy by its status text.
fn request_error(provider: &str, reason: String) -> LlmError {
    let lowered = reason.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lowered.contains("401")
        || lowered.contains("unauthorized")
        || lowered.contains("invalid api key")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    category: String,
    #[serde(default)]
    explanation: String,
}

/// Pull the JSON object out of a model reply that may wrap it in prose or a
/// code fence.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```")
            && after[..end].trim().starts_with('{')
        {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Interpret a reply. Non-JSON replies fall back to the first category named
/// anywhere in the text.
pub fn parse_classification(
    provider: &str,
    reply: &str,
    categories: &[String],
) -> Result<Classification, LlmError> {
    match serde_json::from_str::<RawClassification>(&extract_json_object(reply)) {
        Ok(raw) if !raw.category.trim().is_empty() => Ok(Classification {
            category: raw.category.trim().to_string(),
            explanation: raw.explanation,
        }),
        Ok(_) => Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "reply has no category".into(),
        }),
        Err(_) => {
            warn!(provider, "Reply is not JSON, scanning text for a category");
            let lowered = reply.to_lowercase();
            categories
                .iter()
                .find(|c| lowered.contains(&c.to_lowercase()))
                .map(|c| Classification {
                    category: c.clone(),
                    explanation: "Extracted from response".into(),
                })
                .ok_or_else(|| LlmError::InvalidResponse {
                    provider: provider.to_string(),
                    reason: format!("unparseable reply: {}", preview(reply)),
                })
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        text: &str,
        categories: &[String],
    ) -> Result<Classification, LlmError> {
        let started = Instant::now();
        let mut builder = self
            .client
            .agent(&self.config.model)
            .preamble(SYSTEM_PROMPT)
            .temperature(TEMPERATURE)
            .max_tokens(MAX_TOKENS);
        if let Some(params) = additional_params(self.config.backend) {
            builder = builder.additional_params(params);
        }
        let agent = builder.build();

        let prompt = user_prompt(text, categories);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let reply = tokio::time::timeout(timeout, async { agent.prompt(prompt).await })
            .await
            .map_err(|_| LlmError::RequestFailed {
                provider: self.provider(),
                reason: format!("timed out after {}s", self.config.timeout_secs),
            })?
            .map_err(|e| request_error(&self.provider(), e.to_string()))?;

        debug!(
            model = %self.config.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            reply = %preview(&reply),
            "Classifier replied"
        );
        parse_classification(&self.provider(), &reply, categories)
    }
}
