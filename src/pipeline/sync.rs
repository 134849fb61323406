//! Sync stage: persist outcomes, record history and metrics, export a run
//! summary.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Lazy, MessageStore};
use crate::config::SyncConfig;
use crate::error::StageError;
use crate::metrics::{self, MetricsSink, RunSummary, tally};
use crate::pipeline::context::RunContext;
use crate::pipeline::load::Action;
use crate::pipeline::stage::{Stage, StageMetrics};
use crate::pipeline::types::{ActionResult, StageData};

/// How many errors the dry-run summary lists.
const DRY_RUN_ERROR_PREVIEW: usize = 5;

pub struct SyncStage {
    config: SyncConfig,
    store: Arc<Lazy<dyn MessageStore>>,
    /// Overrides the sink chosen from the monitoring configuration.
    sink: Option<Arc<dyn MetricsSink>>,
    metrics: StageMetrics,
}

impl SyncStage {
    pub fn new(config: SyncConfig, store: Arc<Lazy<dyn MessageStore>>) -> Self {
        Self {
            config,
            store,
            sink: None,
            metrics: StageMetrics::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    async fn sync_one(
        &self,
        store: Option<&dyn MessageStore>,
        result: &ActionResult,
        ctx: &RunContext,
    ) -> Result<(), StageError> {
        let labels = derived_labels(result);

        match store {
            Some(store) => store
                .record_outcome(&result.record_id, &result.category, &labels)
                .await
                .map_err(|e| StageError::Persistence {
                    record_id: result.record_id.clone(),
                    reason: e.to_string(),
                })?,
            None => info!(
                record_id = %result.record_id,
                category = %result.category,
                labels = ?labels,
                "PREVIEW: would record outcome"
            ),
        }

        if self.config.track_history {
            debug!(
                run_id = %ctx.run_id(),
                record_id = %result.record_id,
                category = %result.category,
                actions = ?result.actions_taken,
                success = result.success(),
                errors = ?result.errors,
                timestamp = %Utc::now().to_rfc3339(),
                "Processing history"
            );
        }
        Ok(())
    }

    fn log_dry_run_summary(&self, results: &[ActionResult], errors: &[String]) {
        let (categories, actions) = tally(results);
        let failed = results.iter().filter(|r| !r.success()).count();

        info!(
            results = results.len(),
            successful = results.len() - failed,
            failed,
            errors = errors.len(),
            "DRY RUN: sync summary"
        );
        for (category, count) in &categories {
            info!(category = %category, count, "DRY RUN: category");
        }
        for (action, count) in &actions {
            info!(action = %action, count, "DRY RUN: action");
        }
        for e in error_preview(errors) {
            info!(error = %e, "DRY RUN: error");
        }
    }

    fn track_counts(&self, results: &[ActionResult], ctx: &mut RunContext) {
        let (categories, actions) = tally(results);
        for (category, count) in categories {
            ctx.merge_metric(format!("sync_category_{category}"), count);
        }
        for (action, count) in actions {
            ctx.merge_metric(format!("sync_action_{action}"), count);
        }
    }

    fn record_metrics(&mut self, synced: usize, errors: usize, elapsed: f64, ctx: &mut RunContext) {
        self.metrics = StageMetrics::from([
            ("results_synced".to_string(), synced.into()),
            ("sync_errors".to_string(), errors.into()),
            ("sync_time".to_string(), elapsed.into()),
        ]);
        ctx.merge_metric("sync_success_count", synced);
        ctx.merge_metric("sync_error_count", errors);
        ctx.merge_metric("sync_time", elapsed);
    }

    async fn export_summary(&self, results: &[ActionResult], ctx: &mut RunContext) {
        let Some(sink) = self
            .sink
            .clone()
            .or_else(|| metrics::sink_for(&ctx.config().monitoring))
        else {
            return;
        };

        let summary = RunSummary::build(ctx, &self.metrics, results);
        if let Err(e) = sink.export(&summary).await {
            warn!(error = %e, "Failed to export metrics");
            ctx.add_error(format!("Failed to export metrics: {e}"));
        }
    }
}

/// The run errors a dry-run summary lists, oldest first.
fn error_preview(errors: &[String]) -> &[String] {
    &errors[..errors.len().min(DRY_RUN_ERROR_PREVIEW)]
}

#[async_trait]
impl Stage for SyncStage {
    fn validate_input(&self, input: &StageData) -> bool {
        matches!(input, StageData::Actions(_))
    }

    async fn execute(
        &mut self,
        input: StageData,
        ctx: &mut RunContext,
    ) -> Result<StageData, StageError> {
        let results = match input {
            StageData::Actions(results) => results,
            other => {
                return Err(StageError::UnexpectedInput {
                    expected: "actions",
                    found: other.kind(),
                });
            }
        };
        if results.is_empty() {
            info!("No results to sync");
            return Ok(StageData::Empty);
        }

        let started = Instant::now();
        let mode = ctx.mode();

        if mode.dry_run {
            self.log_dry_run_summary(&results, ctx.errors());
            if self.config.track_metrics {
                self.track_counts(&results, ctx);
            }
            self.record_metrics(0, 0, started.elapsed().as_secs_f64(), ctx);
            return Ok(StageData::Empty);
        }

        let store = if mode.preview {
            None
        } else {
            Some(self.store.ensure_ready().await?)
        };

        let mut synced = 0usize;
        let mut errors = 0usize;
        let batch_size = self.config.batch_size.max(1);

        for (batch_no, batch) in results.chunks(batch_size).enumerate() {
            debug!(batch = batch_no + 1, size = batch.len(), "Syncing batch");
            for result in batch {
                match self.sync_one(store.as_deref(), result, ctx).await {
                    Ok(()) => synced += 1,
                    Err(e) => {
                        errors += 1;
                        error!(record_id = %result.record_id, error = %e, "Sync failed");
                        ctx.add_error(e.to_string());
                        if !ctx.config().continue_on_error {
                            self.record_metrics(synced, errors, started.elapsed().as_secs_f64(), ctx);
                            return Err(e);
                        }
                    }
                }
            }
        }

        if self.config.track_metrics {
            self.track_counts(&results, ctx);
        }
        self.record_metrics(synced, errors, started.elapsed().as_secs_f64(), ctx);

        if self.config.save_metrics {
            self.export_summary(&results, ctx).await;
        }

        info!(synced, errors, "Sync complete");
        Ok(StageData::Empty)
    }

    fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    fn reset_metrics(&mut self) {
        self.metrics.clear();
    }
}

/// Labels recorded for an outcome: its category when a label was applied.
pub fn derived_labels(result: &ActionResult) -> Vec<String> {
    if result
        .action_names()
        .any(|name| name == Action::ApplyLabel.as_str())
    {
        vec![result.category.clone()]
    } else {
        Vec::new()
    }
}
