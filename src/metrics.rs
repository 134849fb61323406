//! Run summaries and the sinks that export them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MonitoringConfig;
use crate::error::ExportError;
use crate::pipeline::context::{MetricValue, RunContext};
use crate::pipeline::stage::StageMetrics;
use crate::pipeline::types::ActionResult;

/// How many of the most recent errors a summary keeps.
pub const SUMMARY_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryTotals {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub categories: BTreeMap<String, u64>,
    pub actions: BTreeMap<String, u64>,
}

/// The document written at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub pipeline_metrics: BTreeMap<String, MetricValue>,
    pub stage_metrics: BTreeMap<String, StageMetrics>,
    pub summary: SummaryTotals,
    pub errors: Vec<String>,
}

impl RunSummary {
    /// Summarize the run so far from the sync stage's point of view.
    pub fn build(ctx: &RunContext, sync_metrics: &StageMetrics, results: &[ActionResult]) -> Self {
        let count = |key: &str| ctx.metric(key).map(MetricValue::as_u64).unwrap_or(0);
        let (categories, actions) = tally(results);
        let errors = ctx.errors();
        let keep_from = errors.len().saturating_sub(SUMMARY_ERROR_LIMIT);

        Self {
            run_id: ctx.run_id(),
            start_time: ctx.started_at(),
            end_time: Utc::now(),
            pipeline_metrics: ctx.metrics().clone(),
            stage_metrics: BTreeMap::from([("sync".to_string(), sync_metrics.clone())]),
            summary: SummaryTotals {
                total_processed: count("extract_emails_count"),
                successful: count("load_success_count"),
                failed: count("load_error_count"),
                categories,
                actions,
            },
            errors: errors[keep_from..].to_vec(),
        }
    }
}

/// Count outcomes per category and per action (mode prefixes removed).
pub fn tally(results: &[ActionResult]) -> (BTreeMap<String, u64>, BTreeMap<String, u64>) {
    let mut categories = BTreeMap::new();
    let mut actions = BTreeMap::new();
    for result in results {
        *categories.entry(result.category.clone()).or_insert(0) += 1;
        for name in result.action_names() {
            *actions.entry(name.to_string()).or_insert(0) += 1;
        }
    }
    (categories, actions)
}

/// Destination for run summaries.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn export(&self, summary: &RunSummary) -> Result<(), ExportError>;
}

/// Supported `monitoring.metrics_export` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

/// The sink selected by the monitoring configuration, or `None` (with a
/// warning) for an unsupported format.
pub fn sink_for(config: &MonitoringConfig) -> Option<Arc<dyn MetricsSink>> {
    let path = PathBuf::from(&config.metrics_path);
    match ExportFormat::parse(&config.metrics_export) {
        Some(ExportFormat::Json) => Some(Arc::new(JsonFileSink::new(path))),
        Some(ExportFormat::Csv) => Some(Arc::new(CsvFileSink::new(path.with_extension("csv")))),
        None => {
            warn!(format = %config.metrics_export, "Unsupported metrics export format");
            None
        }
    }
}

/// Writes the summary as pretty-printed JSON.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetricsSink for JsonFileSink {
    async fn export(&self, summary: &RunSummary) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(summary)?;
        write_file(&self.path, json).await?;
        info!(path = %self.path.display(), "Exported metrics");
        Ok(())
    }
}

/// Writes flat `run_id,timestamp,type,name,count` rows.
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetricsSink for CsvFileSink {
    async fn export(&self, summary: &RunSummary) -> Result<(), ExportError> {
        write_file(&self.path, csv_rows(summary)).await?;
        info!(path = %self.path.display(), "Exported metrics");
        Ok(())
    }
}

fn csv_rows(summary: &RunSummary) -> String {
    let run_id = summary.run_id.to_string();
    let timestamp = summary.end_time.to_rfc3339();
    let totals = &summary.summary;

    let mut out = String::from("run_id,timestamp,type,name,count\n");
    let mut row = |kind: &str, name: &str, count: u64| {
        let fields = [run_id.as_str(), timestamp.as_str(), kind, name];
        let escaped: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&format!("{},{count}\n", escaped.join(",")));
    };

    row("total", "processed", totals.total_processed);
    row("total", "successful", totals.successful);
    row("total", "failed", totals.failed);
    for (name, count) in &totals.categories {
        row("category", name, *count);
    }
    for (name, count) in &totals.actions {
        row("action", name, *count);
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

async fn write_file(path: &Path, contents: String) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}

/// Load a JSON summary written by `JsonFileSink`.
pub async fn read_summary(path: &Path) -> Result<RunSummary, ExportError> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}
