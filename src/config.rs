//! Configuration types.
//!
//! Every section carries its defaults through `Default`, so a TOML file only
//! needs the keys it wants to change. Environment variables override both.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where the extract stage reads messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractSource {
    #[default]
    Mailbox,
    Store,
}

impl fmt::Display for ExtractSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox => write!(f, "mailbox"),
            Self::Store => write!(f, "store"),
        }
    }
}

impl FromStr for ExtractSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mailbox" | "gmail" | "imap" => Ok(Self::Mailbox),
            "store" | "database" | "db" => Ok(Self::Store),
            other => Err(ConfigError::InvalidValue {
                key: "extract.source".to_string(),
                message: format!("unknown source '{other}' (expected mailbox or store)"),
            }),
        }
    }
}

/// How a classifier's free-text answer is mapped onto the category set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryMatching {
    /// Only an exact (trimmed) match is accepted.
    Exact,
    /// Case-insensitive match, then substring containment either way.
    #[default]
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub source: ExtractSource,
    /// Mailbox search expression (IMAP SEARCH syntax).
    pub query: String,
    pub batch_size: usize,
    /// Overrides `batch_size` as the mailbox fetch limit when set.
    pub max_results: Option<usize>,
    /// Drop records that fail normalization instead of aborting the stage.
    pub skip_on_error: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            source: ExtractSource::Mailbox,
            query: "UNSEEN".to_string(),
            batch_size: 100,
            max_results: None,
            skip_on_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// `openai` or `ollama`.
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Message bodies longer than this many characters are truncated.
    pub max_content_length: usize,
    pub timeout_secs: u64,
    pub skip_on_error: bool,
    pub categories: Vec<String>,
    pub fallback_category: String,
    /// Categories that get the higher base confidence.
    pub high_confidence_categories: Vec<String>,
    pub matching: CategoryMatching,
}

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Marketing",
    "Response Needed / High Priority",
    "Bills",
    "Subscriptions",
    "Newsletters",
    "Personal",
    "Work",
    "Events",
    "Travel",
    "Receipts",
    "Low quality",
    "Notifications",
    "Other",
];

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_content_length: 4000,
            timeout_secs: 30,
            skip_on_error: true,
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            fallback_category: "Other".to_string(),
            high_confidence_categories: vec![
                "Response Needed / High Priority".to_string(),
                "Bills".to_string(),
            ],
            matching: CategoryMatching::Fuzzy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// When false, `apply_label` succeeds without touching the mailbox.
    pub apply_labels: bool,
    /// Resolve (and create) every category label before the first record.
    pub create_missing_labels: bool,
    /// Actions for categories without an entry in `category_actions`.
    pub default_actions: Vec<String>,
    /// Category name to ordered action names.
    pub category_actions: BTreeMap<String, Vec<String>>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        let actions = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let category_actions = BTreeMap::from([
            ("Marketing".to_string(), actions(&["apply_label", "archive"])),
            (
                "Response Needed / High Priority".to_string(),
                actions(&["apply_label", "star"]),
            ),
            ("Bills".to_string(), actions(&["apply_label", "star"])),
            ("Newsletters".to_string(), actions(&["apply_label", "archive"])),
            (
                "Low quality".to_string(),
                actions(&["apply_label", "archive", "mark_as_read"]),
            ),
            (
                "Notifications".to_string(),
                actions(&["apply_label", "mark_as_read"]),
            ),
        ]);

        Self {
            apply_labels: true,
            create_missing_labels: true,
            default_actions: actions(&["apply_label"]),
            category_actions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_path: String,
    pub save_metrics: bool,
    pub track_history: bool,
    pub batch_size: usize,
    pub track_metrics: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/mail-sorter.db".to_string(),
            save_metrics: true,
            track_history: true,
            batch_size: 100,
            track_metrics: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// `json` or `csv`.
    pub metrics_export: String,
    pub metrics_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_export: "json".to_string(),
            metrics_path: "pipeline_metrics.json".to_string(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dry_run: bool,
    /// Tolerate stage and record failures instead of aborting the run.
    pub continue_on_error: bool,
    pub extract: ExtractConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
    pub sync: SyncConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            continue_on_error: true,
            extract: ExtractConfig::default(),
            transform: TransformConfig::default(),
            load: LoadConfig::default(),
            sync: SyncConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `MAIL_SORTER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a TOML file; keys it omits keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Optional file, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_bool("MAIL_SORTER_DRY_RUN") {
            self.dry_run = v;
        }
        if let Some(v) = env_bool("MAIL_SORTER_CONTINUE_ON_ERROR") {
            self.continue_on_error = v;
        }

        if let Ok(source) = std::env::var("MAIL_SORTER_SOURCE") {
            self.extract.source = source.parse()?;
        }
        if let Ok(query) = std::env::var("MAIL_SORTER_QUERY") {
            self.extract.query = query;
        }
        if let Some(v) = env_parse("MAIL_SORTER_BATCH_SIZE") {
            self.extract.batch_size = v;
        }
        if let Some(v) = env_parse("MAIL_SORTER_MAX_RESULTS") {
            self.extract.max_results = Some(v);
        }

        if let Ok(provider) = std::env::var("MAIL_SORTER_LLM_PROVIDER") {
            self.transform.provider = provider.trim().to_lowercase();
            if self.transform.provider == "ollama" && std::env::var("OPENAI_BASE_URL").is_err() {
                self.transform.base_url = "http://localhost:11434/v1".to_string();
            }
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            self.transform.model = model;
        }
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            self.transform.base_url = base_url;
        }
        if let Some(v) = env_parse("MAIL_SORTER_MAX_CONTENT_LENGTH") {
            self.transform.max_content_length = v;
        }

        if let Ok(path) = std::env::var("MAIL_SORTER_DB_PATH") {
            self.sync.database_path = path;
        }

        if let Ok(level) = std::env::var("MAIL_SORTER_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
        if let Ok(format) = std::env::var("MAIL_SORTER_METRICS_EXPORT") {
            self.monitoring.metrics_export = format;
        }
        if let Ok(path) = std::env::var("MAIL_SORTER_METRICS_PATH") {
            self.monitoring.metrics_path = path;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.extract.batch_size == 0 {
            return Err(invalid("extract.batch_size", "must be greater than zero"));
        }
        if self.extract.max_results == Some(0) {
            return Err(invalid("extract.max_results", "must be greater than zero"));
        }
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size", "must be greater than zero"));
        }
        if self.transform.categories.is_empty() {
            return Err(invalid("transform.categories", "at least one category is required"));
        }
        if !self
            .transform
            .categories
            .contains(&self.transform.fallback_category)
        {
            return Err(invalid(
                "transform.fallback_category",
                "must be one of transform.categories",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transform.categories.len(), 13);
        assert_eq!(config.transform.fallback_category, "Other");
        assert!(config.continue_on_error);
        assert!(!config.dry_run);
    }

    #[test]
    fn default_actions_match_categories() {
        let load = LoadConfig::default();
        assert_eq!(
            load.category_actions["Low quality"],
            vec!["apply_label", "archive", "mark_as_read"]
        );
        assert_eq!(load.category_actions["Bills"], vec!["apply_label", "star"]);
        assert!(!load.category_actions.contains_key("Personal"));
        assert_eq!(load.default_actions, vec!["apply_label"]);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            continue_on_error = false

            [extract]
            source = "store"
            batch_size = 5

            [monitoring]
            metrics_export = "csv"
        "#;
        let config = PipelineConfig::from_toml_str(raw).unwrap();
        assert!(!config.continue_on_error);
        assert_eq!(config.extract.source, ExtractSource::Store);
        assert_eq!(config.extract.batch_size, 5);
        assert_eq!(config.extract.query, "UNSEEN");
        assert_eq!(config.monitoring.metrics_export, "csv");
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn generated_toml_parses_back() {
        let config = PipelineConfig::default();
        let raw = config.to_toml_string().unwrap();
        assert!(raw.contains("[transform]"));
        assert_eq!(PipelineConfig::from_toml_str(&raw).unwrap(), config);
    }

    #[test]
    fn validate_rejects_fallback_outside_categories() {
        let mut config = PipelineConfig::default();
        config.transform.fallback_category = "Misc".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transform.fallback_category"));
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let mut config = PipelineConfig::default();
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn source_parses_aliases() {
        assert_eq!("gmail".parse::<ExtractSource>().unwrap(), ExtractSource::Mailbox);
        assert_eq!(" Database ".parse::<ExtractSource>().unwrap(), ExtractSource::Store);
        assert!("ftp".parse::<ExtractSource>().is_err());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = PipelineConfig::from_toml_str("dry_run = [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
