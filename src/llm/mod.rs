//! LLM integration for mail-sorter.
//!
//! Supports:
//! - **OpenAI**: `https://api.openai.com/v1`, bearer-key auth, JSON mode
//! - **Ollama**: `http://localhost:11434/v1`, no key, free-form output
//!
//! Both go through rig-core's OpenAI chat-completions client.
//! [`OpenAiClassifier`] is the [`Classifier`](crate::collaborators::Classifier)
//! the transform stage uses.

mod classifier;

pub use classifier::{OpenAiClassifier, extract_json_object, parse_classification};

use std::fmt;

use secrecy::SecretString;

use crate::config::TransformConfig;
use crate::error::ConfigError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    OpenAi,
    Ollama,
}

impl LlmBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for creating a classifier.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

impl LlmConfig {
    /// Combine the transform settings with `OPENAI_API_KEY` from the
    /// environment.
    pub fn from_env(transform: &TransformConfig) -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY").ok().map(SecretString::from);
        Self::new(transform, api_key)
    }

    /// The OpenAI backend requires a key; Ollama does not.
    pub fn new(
        transform: &TransformConfig,
        api_key: Option<SecretString>,
    ) -> Result<Self, ConfigError> {
        let backend =
            LlmBackend::parse(&transform.provider).ok_or_else(|| ConfigError::InvalidValue {
                key: "transform.provider".into(),
                message: format!("unsupported provider '{}'", transform.provider),
            })?;

        if backend == LlmBackend::OpenAi && api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("OPENAI_API_KEY".into()));
        }

        Ok(Self {
            backend,
            model: transform.model.clone(),
            base_url: transform.base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_secs: transform.timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_requires_key() {
        let transform = TransformConfig::default();
        let err = LlmConfig::new(&transform, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "OPENAI_API_KEY"));

        let config = LlmConfig::new(&transform, Some(SecretString::from("sk-test"))).unwrap();
        assert_eq!(config.backend, LlmBackend::OpenAi);
        assert_eq!(config.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn ollama_needs_no_key() {
        let transform = TransformConfig {
            provider: "Ollama".into(),
            base_url: "http://localhost:11434/v1/".into(),
            ..Default::default()
        };
        let config = LlmConfig::new(&transform, None).unwrap();
        assert_eq!(config.backend, LlmBackend::Ollama);
        assert_eq!(config.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn unknown_provider_is_invalid() {
        let transform = TransformConfig {
            provider: "carrier-pigeon".into(),
            ..Default::default()
        };
        assert!(matches!(
            LlmConfig::new(&transform, None),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
