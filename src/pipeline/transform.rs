//! Transform stage: classify raw records into enriched records.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Classification, Classifier, Lazy};
use crate::config::TransformConfig;
use crate::error::StageError;
use crate::mailbox::strip_html;
use crate::pipeline::category::{CategoryMatcher, confidence_score, matcher_for};
use crate::pipeline::context::RunContext;
use crate::pipeline::stage::{Stage, StageMetrics};
use crate::pipeline::types::{EnrichedRecord, RawRecord, StageData};

/// Classification used in test mode instead of calling the classifier.
pub const TEST_CATEGORY: &str = "Test Category";
pub const TEST_EXPLANATION: &str = "Test mode - mock categorization";

pub struct TransformStage {
    config: TransformConfig,
    classifier: Arc<Lazy<dyn Classifier>>,
    matcher: Box<dyn CategoryMatcher>,
    metrics: StageMetrics,
}

impl TransformStage {
    pub fn new(config: TransformConfig, classifier: Arc<Lazy<dyn Classifier>>) -> Self {
        let matcher = matcher_for(config.matching);
        Self {
            config,
            classifier,
            matcher,
            metrics: StageMetrics::new(),
        }
    }

    /// Swap the category matching strategy.
    pub fn with_matcher(mut self, matcher: Box<dyn CategoryMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Map a classifier answer onto the configured categories, falling back
    /// when nothing matches.
    fn resolve_category(&self, record_id: &str, raw: &str) -> String {
        match self.matcher.resolve(raw, &self.config.categories) {
            Some(category) => category,
            None => {
                warn!(
                    record_id = %record_id,
                    returned = %raw,
                    fallback = %self.config.fallback_category,
                    "Classifier returned unknown category"
                );
                self.config.fallback_category.clone()
            }
        }
    }

    async fn classify(
        &self,
        record: &RawRecord,
        classifier: Option<&Arc<dyn Classifier>>,
    ) -> Result<EnrichedRecord, StageError> {
        let started = Instant::now();

        let answer = match classifier {
            Some(classifier) => {
                let prompt = prompt_text(record, self.config.max_content_length);
                classifier
                    .classify(&prompt, &self.config.categories)
                    .await
                    .map_err(|e| StageError::Classification {
                        record_id: record.id.clone(),
                        reason: e.to_string(),
                    })?
            }
            None => Classification {
                category: TEST_CATEGORY.to_string(),
                explanation: TEST_EXPLANATION.to_string(),
            },
        };

        let category = self.resolve_category(&record.id, &answer.category);
        let confidence = confidence_score(
            &category,
            &answer.explanation,
            &self.config.fallback_category,
            &self.config.high_confidence_categories,
        );

        Ok(EnrichedRecord::new(
            record.clone(),
            category,
            answer.explanation,
            confidence,
            started.elapsed().as_secs_f64(),
        ))
    }

    fn record_metrics(&mut self, success: usize, errors: usize, elapsed: f64, ctx: &mut RunContext) {
        self.metrics = StageMetrics::from([
            ("emails_transformed".to_string(), success.into()),
            ("transformation_errors".to_string(), errors.into()),
            ("transformation_time".to_string(), elapsed.into()),
        ]);
        ctx.merge_metric("transform_success_count", success);
        ctx.merge_metric("transform_error_count", errors);
        ctx.merge_metric("transform_time", elapsed);
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn validate_input(&self, input: &StageData) -> bool {
        matches!(input, StageData::Raw(_))
    }

    async fn execute(
        &mut self,
        input: StageData,
        ctx: &mut RunContext,
    ) -> Result<StageData, StageError> {
        let records = match input {
            StageData::Raw(records) => records,
            other => {
                return Err(StageError::UnexpectedInput {
                    expected: "raw",
                    found: other.kind(),
                });
            }
        };
        if records.is_empty() {
            info!("No emails to transform");
            return Ok(StageData::Enriched(Vec::new()));
        }

        let started = Instant::now();
        let mode = ctx.mode();
        info!(count = records.len(), "Transforming emails");

        // The classifier is only needed when records will actually be sent to it.
        let classifier = if mode.preview || mode.dry_run || mode.test {
            None
        } else {
            Some(self.classifier.ensure_ready().await?)
        };

        let mut enriched = Vec::with_capacity(records.len());
        let mut errors = 0usize;

        for record in records {
            if mode.preview {
                enriched.push(EnrichedRecord::placeholder(record));
                continue;
            }
            if mode.dry_run {
                info!(record_id = %record.id, subject = %record.subject, "DRY RUN: would categorize email");
                continue;
            }

            match self.classify(&record, classifier.as_ref()).await {
                Ok(result) => {
                    debug!(
                        record_id = %result.id(),
                        category = %result.category,
                        confidence = result.confidence,
                        "Categorized email"
                    );
                    enriched.push(result);
                }
                Err(e) => {
                    errors += 1;
                    error!(record_id = %record.id, error = %e, "Categorization failed");
                    ctx.add_error(e.to_string());

                    if self.config.skip_on_error {
                        continue;
                    }
                    if !ctx.config().continue_on_error {
                        self.record_metrics(enriched.len(), errors, started.elapsed().as_secs_f64(), ctx);
                        return Err(e);
                    }
                    warn!(
                        passed_on = enriched.len(),
                        "Stopping transform at first failure; later records are not classified"
                    );
                    break;
                }
            }
        }

        self.record_metrics(enriched.len(), errors, started.elapsed().as_secs_f64(), ctx);
        info!(transformed = enriched.len(), errors, "Transform complete");

        Ok(StageData::Enriched(enriched))
    }

    fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    fn reset_metrics(&mut self) {
        self.metrics.clear();
    }
}

/// The text sent to the classifier: subject and sender headers, then the
/// body with markup removed and cut to `max_len` characters.
pub fn prompt_text(record: &RawRecord, max_len: usize) -> String {
    let body = if record.body.contains('<') && record.body.contains('>') {
        strip_html(&record.body)
    } else {
        record.body.clone()
    };

    let body = if body.chars().count() > max_len {
        let mut cut: String = body.chars().take(max_len).collect();
        cut.push_str("...");
        cut
    } else {
        body
    };

    format!("Subject: {}\nFrom: {}\n\n{}", record.subject, record.sender, body)
}
