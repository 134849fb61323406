//! Load stage: apply each category's configured actions to the mailbox.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Lazy, MailSource, STARRED_LABEL, UNREAD_LABEL};
use crate::config::LoadConfig;
use crate::error::{CollaboratorError, StageError};
use crate::pipeline::context::{MetricValue, RunContext};
use crate::pipeline::stage::{Stage, StageMetrics};
use crate::pipeline::types::{
    ActionResult, DRY_RUN_PREFIX, EnrichedRecord, PREVIEW_PREFIX, StageData,
};

/// A mailbox action a category can be mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ApplyLabel,
    Archive,
    Star,
    MarkAsRead,
}

impl Action {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "apply_label" => Some(Self::ApplyLabel),
            "archive" => Some(Self::Archive),
            "star" => Some(Self::Star),
            "mark_as_read" => Some(Self::MarkAsRead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplyLabel => "apply_label",
            Self::Archive => "archive",
            Self::Star => "star",
            Self::MarkAsRead => "mark_as_read",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct LoadStage {
    config: LoadConfig,
    mailbox: Arc<Lazy<dyn MailSource>>,
    /// Category name to resolved label id, kept across runs.
    label_cache: HashMap<String, String>,
    metrics: StageMetrics,
}

impl LoadStage {
    pub fn new(config: LoadConfig, mailbox: Arc<Lazy<dyn MailSource>>) -> Self {
        Self {
            config,
            mailbox,
            label_cache: HashMap::new(),
            metrics: StageMetrics::new(),
        }
    }

    fn actions_for(&self, category: &str) -> &[String] {
        self.config
            .category_actions
            .get(category)
            .unwrap_or(&self.config.default_actions)
    }

    async fn label_id(
        &mut self,
        mailbox: &dyn MailSource,
        category: &str,
    ) -> Result<String, CollaboratorError> {
        if let Some(id) = self.label_cache.get(category) {
            return Ok(id.clone());
        }
        let id = mailbox.resolve_or_create_label(category).await?;
        debug!(category = %category, label_id = %id, "Resolved label");
        self.label_cache.insert(category.to_string(), id.clone());
        Ok(id)
    }

    /// Resolve the label of every category in the batch before any record
    /// is touched. Failures are recorded and retried per record.
    async fn prepare_labels(&mut self, records: &[EnrichedRecord], ctx: &mut RunContext) {
        let mailbox = match self.mailbox.ensure_ready().await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                warn!(error = %e, "Cannot prepare labels");
                ctx.add_error(format!("Failed to prepare labels: {e}"));
                return;
            }
        };

        let mut categories: Vec<&str> = records.iter().map(|r| r.category.as_str()).collect();
        categories.sort_unstable();
        categories.dedup();

        for category in categories {
            if let Err(e) = self.label_id(mailbox.as_ref(), category).await {
                warn!(category = %category, error = %e, "Failed to resolve label");
                ctx.add_error(format!("Failed to resolve label {category}: {e}"));
            }
        }
    }

    async fn apply(&mut self, action: Action, record: &EnrichedRecord) -> Result<(), CollaboratorError> {
        if action == Action::ApplyLabel && !self.config.apply_labels {
            return Ok(());
        }

        let mailbox = self.mailbox.ensure_ready().await?;
        let id = record.id();
        match action {
            Action::ApplyLabel => {
                let label = self.label_id(mailbox.as_ref(), &record.category).await?;
                mailbox.apply_labels(id, &[label]).await?;
            }
            Action::Archive => mailbox.archive(id).await?,
            Action::Star => mailbox.apply_labels(id, &[STARRED_LABEL.to_string()]).await?,
            Action::MarkAsRead => mailbox.remove_labels(id, &[UNREAD_LABEL.to_string()]).await?,
        }
        Ok(())
    }

    async fn process(&mut self, record: &EnrichedRecord, ctx: &RunContext) -> ActionResult {
        let mode = ctx.mode();
        let names = self.actions_for(&record.category).to_vec();
        let mut taken = Vec::new();
        let mut errors = Vec::new();

        for name in &names {
            let Some(action) = Action::parse(name) else {
                warn!(record_id = %record.id(), action = %name, "Unknown action, skipping");
                continue;
            };

            if mode.preview {
                taken.push(format!("{PREVIEW_PREFIX}{action}"));
                continue;
            }
            if mode.dry_run {
                taken.push(format!("{DRY_RUN_PREFIX}{action}"));
                continue;
            }

            match self.apply(action, record).await {
                Ok(()) => taken.push(action.to_string()),
                Err(e) => {
                    error!(record_id = %record.id(), action = %action, error = %e, "Action failed");
                    errors.push(format!("{action}: {e}"));
                }
            }
        }

        ActionResult::new(record.id(), record.category.clone(), taken, errors)
    }

    fn record_metrics(&mut self, results: &[ActionResult], elapsed: f64, ctx: &mut RunContext) {
        let success = results.iter().filter(|r| r.success()).count();
        let failed = results.len() - success;

        let mut applied: BTreeMap<String, u64> = BTreeMap::new();
        for result in results {
            for name in result.action_names() {
                *applied.entry(name.to_string()).or_default() += 1;
            }
        }

        self.metrics = StageMetrics::from([
            ("emails_loaded".to_string(), success.into()),
            ("load_errors".to_string(), failed.into()),
            ("load_time".to_string(), elapsed.into()),
            ("actions_applied".to_string(), MetricValue::counts(&applied)),
        ]);
        ctx.merge_metric("load_success_count", success);
        ctx.merge_metric("load_error_count", failed);
        ctx.merge_metric("load_time", elapsed);
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn validate_input(&self, input: &StageData) -> bool {
        matches!(input, StageData::Enriched(_))
    }

    async fn execute(
        &mut self,
        input: StageData,
        ctx: &mut RunContext,
    ) -> Result<StageData, StageError> {
        let records = match input {
            StageData::Enriched(records) => records,
            other => {
                return Err(StageError::UnexpectedInput {
                    expected: "enriched",
                    found: other.kind(),
                });
            }
        };
        if records.is_empty() {
            info!("No emails to load");
            return Ok(StageData::Actions(Vec::new()));
        }

        let started = Instant::now();
        let mode = ctx.mode();
        info!(count = records.len(), "Applying actions");

        if self.config.apply_labels && self.config.create_missing_labels && !mode.dry_run {
            self.prepare_labels(&records, ctx).await;
        }

        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            let result = self.process(record, ctx).await;
            for e in &result.errors {
                ctx.add_error(format!("Failed to process email {}: {e}", result.record_id));
            }
            results.push(result);
        }

        self.record_metrics(&results, started.elapsed().as_secs_f64(), ctx);
        let failed = results.iter().filter(|r| !r.success()).count();
        info!(loaded = results.len() - failed, failed, "Load complete");

        Ok(StageData::Actions(results))
    }

    fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    fn reset_metrics(&mut self) {
        self.metrics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::context::RunMode;
    use crate::pipeline::testing::{self, MockMailbox};

    fn stage_with(config: LoadConfig, mailbox: Arc<MockMailbox>) -> LoadStage {
        LoadStage::new(config, Arc::new(Lazy::ready("mailbox", mailbox as Arc<dyn MailSource>)))
    }

    fn results(data: StageData) -> Vec<ActionResult> {
        match data {
            StageData::Actions(results) => results,
            other => panic!("expected action results, got {}", other.kind()),
        }
    }

    fn input(records: &[(&str, &str)]) -> StageData {
        StageData::Enriched(records.iter().map(|(id, cat)| testing::enriched(id, cat)).collect())
    }

    #[tokio::test]
    async fn applies_category_actions_in_order() {
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(LoadConfig::default(), mailbox.clone());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = results(stage.execute(input(&[("1", "Low quality")]), &mut ctx).await.unwrap());

        assert_eq!(out[0].actions_taken, vec!["apply_label", "archive", "mark_as_read"]);
        assert!(out[0].success());
        assert_eq!(
            mailbox.calls(),
            vec![
                "resolve Low quality",
                "apply 1 Label_Low quality",
                "archive 1",
                "remove 1 UNREAD",
            ]
        );
    }

    #[tokio::test]
    async fn star_uses_reserved_label() {
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(LoadConfig::default(), mailbox.clone());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        stage.execute(input(&[("9", "Bills")]), &mut ctx).await.unwrap();
        assert!(mailbox.calls().contains(&"apply 9 STARRED".to_string()));
    }

    #[tokio::test]
    async fn unmapped_category_uses_default_actions() {
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(LoadConfig::default(), mailbox);
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = results(stage.execute(input(&[("1", "Personal")]), &mut ctx).await.unwrap());
        assert_eq!(out[0].actions_taken, vec!["apply_label"]);
    }

    #[tokio::test]
    async fn labels_resolve_once_per_category() {
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(LoadConfig::default(), mailbox.clone());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        stage
            .execute(input(&[("1", "Work"), ("2", "Work"), ("3", "Personal")]), &mut ctx)
            .await
            .unwrap();
        stage.execute(input(&[("4", "Work")]), &mut ctx).await.unwrap();

        let resolves = mailbox.calls().iter().filter(|c| c.starts_with("resolve")).count();
        assert_eq!(resolves, 2);
    }

    #[tokio::test]
    async fn unknown_action_is_a_noop() {
        let mut config = LoadConfig::default();
        config
            .category_actions
            .insert("Work".into(), vec!["teleport".into(), "archive".into()]);
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(config, mailbox.clone());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = results(stage.execute(input(&[("1", "Work")]), &mut ctx).await.unwrap());
        assert_eq!(out[0].actions_taken, vec!["archive"]);
        assert!(out[0].success());
        assert_eq!(ctx.error_count(), 0);
    }

    #[tokio::test]
    async fn failures_are_collected_per_record() {
        let mailbox = Arc::new(MockMailbox {
            failing_ids: ["2".to_string()].into(),
            ..Default::default()
        });
        let mut stage = stage_with(LoadConfig::default(), mailbox);
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = results(
            stage
                .execute(input(&[("1", "Marketing"), ("2", "Marketing"), ("3", "Marketing")]), &mut ctx)
                .await
                .unwrap(),
        );

        assert_eq!(out.len(), 3);
        assert!(out[0].success() && out[2].success());
        assert!(!out[1].success());
        assert_eq!(out[1].errors.len(), 2);
        assert!(out[1].actions_taken.is_empty());
        assert_eq!(ctx.metric("load_error_count").unwrap().as_u64(), 1);
        assert_eq!(ctx.metric("load_success_count").unwrap().as_u64(), 2);
        assert_eq!(ctx.error_count(), 2);
    }

    #[tokio::test]
    async fn preview_and_dry_run_prefix_without_actions() {
        for (mode, prefix, calls) in [
            (RunMode { preview: true, ..Default::default() }, PREVIEW_PREFIX, vec!["resolve Marketing"]),
            (RunMode { dry_run: true, ..Default::default() }, DRY_RUN_PREFIX, vec![]),
            (RunMode { preview: true, dry_run: true, ..Default::default() }, PREVIEW_PREFIX, vec![]),
        ] {
            let mailbox = Arc::new(MockMailbox::default());
            let mut stage = stage_with(LoadConfig::default(), mailbox.clone());
            let mut ctx = testing::context(PipelineConfig::default(), mode);

            let out = results(stage.execute(input(&[("1", "Marketing")]), &mut ctx).await.unwrap());

            assert_eq!(
                out[0].actions_taken,
                vec![format!("{prefix}apply_label"), format!("{prefix}archive")]
            );
            assert_eq!(mailbox.calls(), calls);
        }
    }

    #[tokio::test]
    async fn preview_resolves_each_category_once() {
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(LoadConfig::default(), mailbox.clone());
        let mode = RunMode { preview: true, ..Default::default() };
        let mut ctx = testing::context(PipelineConfig::default(), mode);

        let out = results(
            stage
                .execute(input(&[("1", "Bills"), ("2", "Bills"), ("3", "Work")]), &mut ctx)
                .await
                .unwrap(),
        );

        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.success()));
        assert_eq!(mailbox.calls(), vec!["resolve Bills", "resolve Work"]);
    }

    #[tokio::test]
    async fn apply_labels_off_skips_labelling() {
        let config = LoadConfig {
            apply_labels: false,
            ..Default::default()
        };
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(config, mailbox.clone());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = results(stage.execute(input(&[("1", "Marketing")]), &mut ctx).await.unwrap());
        assert_eq!(out[0].actions_taken, vec!["apply_label", "archive"]);
        assert_eq!(mailbox.calls(), vec!["archive 1"]);
    }

    #[tokio::test]
    async fn counts_actions_without_prefixes() {
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(LoadConfig::default(), mailbox);
        let mode = RunMode { preview: true, ..Default::default() };
        let mut ctx = testing::context(PipelineConfig::default(), mode);

        stage
            .execute(input(&[("1", "Marketing"), ("2", "Bills")]), &mut ctx)
            .await
            .unwrap();

        let MetricValue::Map(applied) = &stage.metrics()["actions_applied"] else {
            panic!("actions_applied should be a map");
        };
        assert_eq!(applied["apply_label"], MetricValue::Int(2));
        assert_eq!(applied["archive"], MetricValue::Int(1));
        assert_eq!(applied["star"], MetricValue::Int(1));
    }

    #[test]
    fn parses_known_actions() {
        assert_eq!(Action::parse("mark_as_read"), Some(Action::MarkAsRead));
        assert_eq!(Action::parse("Archive"), None);
        assert_eq!(Action::Star.to_string(), "star");
    }
}
