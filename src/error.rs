//! Error types for the mail sorter.

use std::time::Duration;

use crate::pipeline::types::RunResult;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Metrics export error: {0}")]
    Export(#[from] ExportError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Unknown stage: {name}")]
    UnknownStage { name: String },

    #[error("Stage {name} is already registered")]
    DuplicateStage { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// IMAP mailbox errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {username}")]
    AuthFailed { username: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Label {label} could not be resolved: {reason}")]
    LabelFailed { label: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metrics sink errors.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to obtain or use an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Collaborator {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl CollaboratorError {
    pub fn unavailable(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by a single stage's `execute`.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Failed to normalize email {record_id}: {reason}")]
    Normalization { record_id: String, reason: String },

    #[error("Failed to categorize email {record_id}: {reason}")]
    Classification { record_id: String, reason: String },

    #[error("Failed to persist outcome for {record_id}: {reason}")]
    Persistence { record_id: String, reason: String },

    #[error("Expected {expected} input, got {found}")]
    UnexpectedInput {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0}")]
    Custom(String),
}

/// Orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid input for stage '{stage}': got {found}")]
    InvalidInput { stage: String, found: &'static str },

    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    /// A run stopped on a failure the configuration does not tolerate.
    /// `partial` is the result as it stood when the run stopped.
    #[error("Pipeline run aborted: {cause}")]
    RunAborted {
        #[source]
        cause: Box<PipelineError>,
        partial: Box<RunResult>,
    },
}

impl PipelineError {
    /// The partial run result carried by an aborted run.
    pub fn partial(&self) -> Option<&RunResult> {
        match self {
            Self::RunAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
