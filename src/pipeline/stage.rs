//! The stage contract every pipeline step implements.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StageError;
use crate::pipeline::context::{MetricValue, RunContext};
use crate::pipeline::types::StageData;

/// Metrics a stage reports about its most recent execution.
pub type StageMetrics = BTreeMap<String, MetricValue>;

/// One step of the pipeline.
///
/// The orchestrator calls `validate_input` first and only executes the
/// stage when it returns true. Stages may append to the run's errors and
/// metrics through the context; returning `Err` means the stage as a
/// whole failed.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Whether this stage accepts `input`.
    fn validate_input(&self, input: &StageData) -> bool;

    async fn execute(
        &mut self,
        input: StageData,
        ctx: &mut RunContext,
    ) -> Result<StageData, StageError>;

    /// Metrics from the last execution.
    fn metrics(&self) -> &StageMetrics;

    fn reset_metrics(&mut self);
}
