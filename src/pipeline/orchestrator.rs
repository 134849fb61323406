//! Runs an ordered list of named stages over a shared context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, StageError};
use crate::pipeline::context::{RunContext, RunMode};
use crate::pipeline::extract::ExtractStage;
use crate::pipeline::load::LoadStage;
use crate::pipeline::stage::{Stage, StageMetrics};
use crate::pipeline::sync::SyncStage;
use crate::pipeline::transform::TransformStage;
use crate::pipeline::types::{RunResult, StageData};

pub const EXTRACT: &str = "extract";
pub const TRANSFORM: &str = "transform";
pub const LOAD: &str = "load";
pub const SYNC: &str = "sync";

/// Stages whose failure ends the run even when errors are tolerated.
pub const CRITICAL_STAGES: &[&str] = &[EXTRACT, TRANSFORM];

/// A run stops early once more than this many errors have accumulated.
pub const MAX_ERRORS: usize = 100;

/// Where `add_stage` inserts a new stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagePosition {
    End,
    After(String),
    Before(String),
}

/// Per-run overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Overrides `PipelineConfig::dry_run` when set.
    pub dry_run: Option<bool>,
    pub preview: bool,
    pub test: bool,
}

/// Why a run stopped before the last stage.
enum Abort {
    Invalid { stage: String, found: &'static str },
    Failed { stage: String, source: StageError },
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    stages: Vec<(String, Box<dyn Stage>)>,
}

impl Pipeline {
    /// The default extract → transform → load → sync pipeline.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let stages: Vec<(String, Box<dyn Stage>)> = vec![
            (
                EXTRACT.to_string(),
                Box::new(ExtractStage::new(
                    config.extract.clone(),
                    Arc::clone(&collaborators.mailbox),
                    Arc::clone(&collaborators.store),
                )),
            ),
            (
                TRANSFORM.to_string(),
                Box::new(TransformStage::new(
                    config.transform.clone(),
                    Arc::clone(&collaborators.classifier),
                )),
            ),
            (
                LOAD.to_string(),
                Box::new(LoadStage::new(
                    config.load.clone(),
                    Arc::clone(&collaborators.mailbox),
                )),
            ),
            (
                SYNC.to_string(),
                Box::new(SyncStage::new(
                    config.sync.clone(),
                    Arc::clone(&collaborators.store),
                )),
            ),
        ];

        Self {
            config: Arc::new(config),
            stages,
        }
    }

    /// A pipeline with no stages.
    pub fn empty(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            stages: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn position_of(&self, name: &str) -> Result<usize, ConfigError> {
        self.stages
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| ConfigError::UnknownStage {
                name: name.to_string(),
            })
    }

    /// Insert a stage. Names must be unique; `After`/`Before` must name an
    /// existing stage.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        stage: Box<dyn Stage>,
        position: StagePosition,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.stages.iter().any(|(n, _)| *n == name) {
            return Err(ConfigError::DuplicateStage { name });
        }

        let index = match &position {
            StagePosition::End => self.stages.len(),
            StagePosition::After(anchor) => self.position_of(anchor)? + 1,
            StagePosition::Before(anchor) => self.position_of(anchor)?,
        };
        info!(stage = %name, ?position, "Added stage");
        self.stages.insert(index, (name, stage));
        Ok(())
    }

    pub fn remove_stage(&mut self, name: &str) -> Result<Box<dyn Stage>, ConfigError> {
        let index = self.position_of(name)?;
        let (_, stage) = self.stages.remove(index);
        info!(stage = %name, "Removed stage");
        Ok(stage)
    }

    /// Run every stage in order.
    ///
    /// Failures the configuration tolerates are reported through the
    /// returned result's `errors`. With `continue_on_error` off, the first
    /// validation or stage failure aborts with `PipelineError::RunAborted`,
    /// which carries the partial result.
    pub async fn run(&mut self, options: RunOptions) -> Result<RunResult, PipelineError> {
        let mode = RunMode {
            dry_run: options.dry_run.unwrap_or(self.config.dry_run),
            preview: options.preview,
            test: options.test,
        };
        let mut ctx = RunContext::new(Arc::clone(&self.config), mode);
        let continue_on_error = self.config.continue_on_error;

        info!(
            run_id = %ctx.run_id(),
            dry_run = mode.dry_run,
            preview = mode.preview,
            test = mode.test,
            stages = ?self.stage_names(),
            "Starting pipeline run"
        );

        let mut data = StageData::Empty;
        let mut completed = Vec::new();
        let mut abort = None;

        for (name, stage) in self.stages.iter_mut() {
            if !stage.validate_input(&data) {
                let found = data.kind();
                error!(stage = %name, found, "Invalid input for stage");
                ctx.add_error(format!("Invalid input for stage '{name}': got {found}"));
                abort = Some(Abort::Invalid {
                    stage: name.clone(),
                    found,
                });
                break;
            }

            info!(stage = %name, records = data.len(), "Executing stage");
            let started = Instant::now();

            match stage.execute(std::mem::take(&mut data), &mut ctx).await {
                Ok(output) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    data = output;
                    completed.push(name.clone());

                    ctx.merge_metric(format!("{name}_elapsed"), elapsed);
                    for (key, value) in stage.metrics() {
                        ctx.merge_metric(format!("{name}_{key}"), value.clone());
                    }
                    info!(
                        stage = %name,
                        records = data.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Stage complete"
                    );

                    if data.is_empty() {
                        info!(stage = %name, "No data left, stopping");
                        break;
                    }
                    if ctx.error_count() > MAX_ERRORS {
                        warn!(errors = ctx.error_count(), "Too many errors, stopping");
                        break;
                    }
                }
                Err(e) => {
                    error!(stage = %name, error = %e, "Stage failed");
                    ctx.add_error(format!("Stage '{name}' failed: {e}"));

                    if !continue_on_error {
                        abort = Some(Abort::Failed {
                            stage: name.clone(),
                            source: e,
                        });
                        break;
                    }
                    if CRITICAL_STAGES.contains(&name.as_str()) {
                        error!(stage = %name, "Critical stage failed, stopping pipeline");
                        break;
                    }
                    warn!(stage = %name, "Continuing with no data");
                }
            }
        }

        let result = RunResult::from_context(&ctx, Utc::now(), completed);
        log_summary(&result);

        match abort {
            None => Ok(result),
            Some(Abort::Invalid { .. }) if continue_on_error => Ok(result),
            Some(Abort::Invalid { stage, found }) => Err(PipelineError::RunAborted {
                cause: Box::new(PipelineError::InvalidInput { stage, found }),
                partial: Box::new(result),
            }),
            Some(Abort::Failed { stage, source }) => Err(PipelineError::RunAborted {
                cause: Box::new(PipelineError::StageFailed { stage, source }),
                partial: Box::new(result),
            }),
        }
    }

    /// Run one named stage against `input` with a fresh context.
    pub async fn run_stage(
        &mut self,
        name: &str,
        input: StageData,
        dry_run: bool,
    ) -> Result<StageData, PipelineError> {
        let index = self.position_of(name)?;
        let mode = RunMode {
            dry_run,
            ..Default::default()
        };
        let mut ctx = RunContext::new(Arc::clone(&self.config), mode);
        let (_, stage) = &mut self.stages[index];

        if !stage.validate_input(&input) {
            return Err(PipelineError::InvalidInput {
                stage: name.to_string(),
                found: input.kind(),
            });
        }

        info!(stage = %name, run_id = %ctx.run_id(), dry_run, "Running single stage");
        let output = stage
            .execute(input, &mut ctx)
            .await
            .map_err(|source| PipelineError::StageFailed {
                stage: name.to_string(),
                source,
            })?;

        for e in ctx.errors() {
            warn!(stage = %name, error = %e, "Stage reported error");
        }
        Ok(output)
    }

    /// Each stage's metrics from its last execution.
    pub fn stage_metrics(&self) -> BTreeMap<String, StageMetrics> {
        self.stages
            .iter()
            .map(|(name, stage)| (name.clone(), stage.metrics().clone()))
            .collect()
    }

    pub fn reset_metrics(&mut self) {
        for (_, stage) in self.stages.iter_mut() {
            stage.reset_metrics();
        }
    }
}

fn log_summary(result: &RunResult) {
    info!(
        run_id = %result.run_id,
        duration_ms = result.duration().num_milliseconds(),
        stages = ?result.stages_completed,
        processed = result.processed,
        successful = result.successful,
        failed = result.failed,
        errors = result.errors.len(),
        "Pipeline run finished"
    );
    for e in result.errors.iter().take(5) {
        warn!(run_id = %result.run_id, error = %e, "Run error");
    }
    if result.errors.len() > 5 {
        warn!(more = result.errors.len() - 5, "Further errors omitted");
    }
}
