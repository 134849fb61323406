//! Records that flow between stages, and the result of a run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::context::{MetricValue, RunContext};

/// Category assigned in preview mode instead of calling the classifier.
pub const PREVIEW_CATEGORY: &str = "[Preview Mode]";
pub const PREVIEW_EXPLANATION: &str = "[Preview Mode - No actual categorization]";

/// Action-name prefixes used when no external call is made.
pub const PREVIEW_PREFIX: &str = "[preview] ";
pub const DRY_RUN_PREFIX: &str = "[dry-run] ";

/// A message as it came out of the extract stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// A raw record plus its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub raw: RawRecord,
    pub category: String,
    pub explanation: String,
    /// Always within `[0.0, 1.0]`, rounded to two decimals.
    pub confidence: f64,
    /// Seconds spent classifying this record.
    pub processing_time: f64,
}

impl EnrichedRecord {
    pub fn new(
        raw: RawRecord,
        category: impl Into<String>,
        explanation: impl Into<String>,
        confidence: f64,
        processing_time: f64,
    ) -> Self {
        Self {
            raw,
            category: category.into(),
            explanation: explanation.into(),
            confidence: round2(confidence.clamp(0.0, 1.0)),
            processing_time: processing_time.max(0.0),
        }
    }

    /// The record preview mode emits in place of a classification.
    pub fn placeholder(raw: RawRecord) -> Self {
        Self::new(raw, PREVIEW_CATEGORY, PREVIEW_EXPLANATION, 0.0, 0.0)
    }

    pub fn id(&self) -> &str {
        &self.raw.id
    }
}

/// Outcome of applying a category's actions to one record.
///
/// Success is derived from `errors`, so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub record_id: String,
    pub category: String,
    pub actions_taken: Vec<String>,
    pub errors: Vec<String>,
}

impl ActionResult {
    pub fn new(
        record_id: impl Into<String>,
        category: impl Into<String>,
        actions_taken: Vec<String>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            category: category.into(),
            actions_taken,
            errors,
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Action names with any preview/dry-run prefix removed.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions_taken.iter().map(|a| strip_mode_prefix(a))
    }
}

/// Remove a `[preview] ` or `[dry-run] ` prefix from an action name.
pub fn strip_mode_prefix(action: &str) -> &str {
    action
        .strip_prefix(PREVIEW_PREFIX)
        .or_else(|| action.strip_prefix(DRY_RUN_PREFIX))
        .unwrap_or(action)
}

/// Data handed from one stage to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "records", rename_all = "snake_case")]
pub enum StageData {
    /// No data: the run's initial input and a failed stage's replacement output.
    #[default]
    Empty,
    Raw(Vec<RawRecord>),
    Enriched(Vec<EnrichedRecord>),
    Actions(Vec<ActionResult>),
}

impl StageData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Raw(_) => "raw",
            Self::Enriched(_) => "enriched",
            Self::Actions(_) => "actions",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Raw(v) => v.len(),
            Self::Enriched(v) => v.len(),
            Self::Actions(v) => v.len(),
        }
    }

    /// True for `Empty` and for any empty record list.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub stages_completed: Vec<String>,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: Vec<String>,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl RunResult {
    /// Snapshot a context into a result. Counts come from the
    /// `extract_emails_count`, `load_success_count` and `load_error_count`
    /// metrics, defaulting to zero when a stage never ran.
    pub fn from_context(
        ctx: &RunContext,
        end_time: DateTime<Utc>,
        stages_completed: Vec<String>,
    ) -> Self {
        let count = |key: &str| ctx.metric(key).map(MetricValue::as_u64).unwrap_or(0);
        Self {
            run_id: ctx.run_id(),
            start_time: ctx.started_at(),
            end_time,
            stages_completed,
            processed: count("extract_emails_count"),
            successful: count("load_success_count"),
            failed: count("load_error_count"),
            errors: ctx.errors().to_vec(),
            metrics: ctx.metrics().clone(),
        }
    }

    /// True when no error was recorded during the run.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    /// Fraction of processed records that were loaded successfully.
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.successful as f64 / self.processed as f64
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            subject: "Hello".into(),
            sender: "a@example.com".into(),
            body: "Body".into(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn confidence_is_clamped_and_rounded() {
        assert_eq!(EnrichedRecord::new(raw("1"), "Bills", "", 1.7, 0.0).confidence, 1.0);
        assert_eq!(EnrichedRecord::new(raw("1"), "Bills", "", -0.2, 0.0).confidence, 0.0);
        assert_eq!(EnrichedRecord::new(raw("1"), "Bills", "", 0.7345, 0.0).confidence, 0.73);
    }

    #[test]
    fn placeholder_has_zero_confidence() {
        let record = EnrichedRecord::placeholder(raw("p"));
        assert_eq!(record.category, PREVIEW_CATEGORY);
        assert_eq!(record.explanation, PREVIEW_EXPLANATION);
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.id(), "p");
    }

    #[test]
    fn action_result_success_follows_errors() {
        let ok = ActionResult::new("1", "Bills", vec!["apply_label".into()], vec![]);
        assert!(ok.success());
        let failed = ActionResult::new("1", "Bills", vec![], vec!["star: denied".into()]);
        assert!(!failed.success());
    }

    #[test]
    fn action_names_strip_mode_prefixes() {
        let result = ActionResult::new(
            "1",
            "Marketing",
            vec!["[preview] apply_label".into(), "[dry-run] archive".into(), "star".into()],
            vec![],
        );
        let names: Vec<_> = result.action_names().collect();
        assert_eq!(names, vec!["apply_label", "archive", "star"]);
    }

    #[test]
    fn stage_data_emptiness() {
        assert!(StageData::Empty.is_empty());
        assert!(StageData::Raw(vec![]).is_empty());
        assert!(!StageData::Raw(vec![raw("1")]).is_empty());
        assert_eq!(StageData::Raw(vec![raw("1")]).kind(), "raw");
    }

    #[test]
    fn stage_data_json_is_tagged() {
        let data = StageData::Actions(vec![ActionResult::new("7", "Bills", vec![], vec![])]);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "actions");
        assert_eq!(json["records"][0]["record_id"], "7");

        let empty: StageData = serde_json::from_str(r#"{"kind":"empty"}"#).unwrap();
        assert_eq!(empty, StageData::Empty);
    }

    #[test]
    fn enriched_json_flattens_raw_fields() {
        let record = EnrichedRecord::new(raw("9"), "Work", "x", 0.7, 0.1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "9");
        assert_eq!(json["category"], "Work");
    }

    #[test]
    fn success_rate_handles_zero() {
        let now = Utc::now();
        let mut result = RunResult {
            run_id: Uuid::new_v4(),
            start_time: now,
            end_time: now,
            stages_completed: vec![],
            processed: 0,
            successful: 0,
            failed: 0,
            errors: vec![],
            metrics: BTreeMap::new(),
        };
        assert_eq!(result.success_rate(), 0.0);
        result.processed = 4;
        result.successful = 3;
        assert_eq!(result.success_rate(), 0.75);
        assert!(result.success());
    }
}
