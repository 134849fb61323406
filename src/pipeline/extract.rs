//! Extract stage: fetch messages and normalize them into raw records.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{error, info, warn};

use crate::collaborators::{FetchedMessage, Lazy, MailSource, MessageStore};
use crate::config::{ExtractConfig, ExtractSource};
use crate::error::{CollaboratorError, StageError};
use crate::pipeline::context::RunContext;
use crate::pipeline::stage::{Stage, StageMetrics};
use crate::pipeline::types::{RawRecord, StageData};

pub struct ExtractStage {
    config: ExtractConfig,
    mailbox: Arc<Lazy<dyn MailSource>>,
    store: Arc<Lazy<dyn MessageStore>>,
    metrics: StageMetrics,
}

impl ExtractStage {
    pub fn new(
        config: ExtractConfig,
        mailbox: Arc<Lazy<dyn MailSource>>,
        store: Arc<Lazy<dyn MessageStore>>,
    ) -> Self {
        Self {
            config,
            mailbox,
            store,
            metrics: StageMetrics::new(),
        }
    }

    async fn fetch(&self, ctx: &RunContext) -> Result<Vec<FetchedMessage>, StageError> {
        match self.config.source {
            ExtractSource::Mailbox => {
                if ctx.mode().dry_run {
                    info!("DRY RUN: skipping mailbox fetch");
                    return Ok(Vec::new());
                }
                let limit = self.config.max_results.unwrap_or(self.config.batch_size);
                let mailbox = self.mailbox.ensure_ready().await?;
                mailbox
                    .fetch_unread(&self.config.query, limit)
                    .await
                    .map_err(|e| CollaboratorError::from(e).into())
            }
            ExtractSource::Store => {
                if ctx.mode().dry_run {
                    info!("DRY RUN: skipping store fetch");
                    return Ok(Vec::new());
                }
                let store = self.store.ensure_ready().await?;
                store
                    .fetch_unprocessed(self.config.batch_size)
                    .await
                    .map_err(|e| CollaboratorError::from(e).into())
            }
        }
    }

    /// Normalize fetched messages, oldest first. Failures are logged and
    /// dropped, or abort the stage when `skip_on_error` is off.
    fn normalize_all(
        &self,
        messages: Vec<FetchedMessage>,
        ctx: &mut RunContext,
    ) -> Result<Vec<RawRecord>, StageError> {
        let mut records = Vec::with_capacity(messages.len());

        for message in messages {
            let id = message.id.clone();
            match normalize(message) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!(record_id = %id, reason = %reason, "Failed to normalize email");
                    ctx.add_error(format!("Failed to normalize email {id}: {reason}"));
                    if !self.config.skip_on_error {
                        return Err(StageError::Normalization {
                            record_id: id,
                            reason,
                        });
                    }
                }
            }
        }

        records.sort_by_key(|r| r.received_at);
        Ok(records)
    }

    fn record_metrics(&mut self, count: usize, elapsed: f64, ctx: &mut RunContext) {
        self.metrics = StageMetrics::from([
            ("emails_extracted".to_string(), count.into()),
            ("extraction_time".to_string(), elapsed.into()),
            ("source".to_string(), self.config.source.to_string().into()),
        ]);
        ctx.merge_metric("extract_emails_count", count);
        ctx.merge_metric("extract_time", elapsed);
    }
}

#[async_trait]
impl Stage for ExtractStage {
    fn validate_input(&self, input: &StageData) -> bool {
        matches!(input, StageData::Empty | StageData::Raw(_))
    }

    async fn execute(
        &mut self,
        _input: StageData,
        ctx: &mut RunContext,
    ) -> Result<StageData, StageError> {
        let started = Instant::now();
        info!(source = %self.config.source, query = %self.config.query, "Extracting emails");

        let messages = match self.fetch(ctx).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Email extraction failed");
                if !ctx.config().continue_on_error {
                    return Err(e);
                }
                ctx.add_error(format!("Extract stage failed: {e}"));
                Vec::new()
            }
        };

        let records = self.normalize_all(messages, ctx)?;

        let elapsed = started.elapsed().as_secs_f64();
        self.record_metrics(records.len(), elapsed, ctx);
        info!(
            count = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extracted emails"
        );

        Ok(StageData::Raw(records))
    }

    fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    fn reset_metrics(&mut self) {
        self.metrics.clear();
    }
}

/// Turn a fetched message into a raw record.
///
/// Missing subject, sender or body become empty strings and a missing date
/// becomes now. An empty id or an unparseable date is an error.
pub fn normalize(message: FetchedMessage) -> Result<RawRecord, String> {
    let id = message.id.trim().to_string();
    if id.is_empty() {
        return Err("missing message id".to_string());
    }

    let received_at = match message.date.as_deref().map(str::trim) {
        None | Some("") => Utc::now(),
        Some(raw) => {
            parse_received_at(raw).ok_or_else(|| format!("unparseable date '{raw}'"))?
        }
    };

    Ok(RawRecord {
        id,
        subject: message.subject.unwrap_or_default(),
        sender: message.sender.unwrap_or_default(),
        body: message.body.unwrap_or_default(),
        received_at,
    })
}

/// Accepts RFC 3339, RFC 2822 and SQLite-style timestamps (taken as UTC).
pub fn parse_received_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::context::RunMode;
    use crate::pipeline::testing::{self, MockMailbox, MockStore};

    fn stage_with(config: ExtractConfig, mailbox: Arc<MockMailbox>, store: Arc<MockStore>) -> ExtractStage {
        ExtractStage::new(
            config,
            Arc::new(Lazy::ready("mailbox", mailbox as Arc<dyn MailSource>)),
            Arc::new(Lazy::ready("store", store as Arc<dyn MessageStore>)),
        )
    }

    fn records(data: StageData) -> Vec<RawRecord> {
        match data {
            StageData::Raw(records) => records,
            other => panic!("expected raw records, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn orders_records_by_received_time() {
        let mailbox = Arc::new(MockMailbox::with_messages(vec![
            testing::message("b", "Second", "2024-03-02T10:00:00Z"),
            testing::message("a", "First", "Fri, 01 Mar 2024 09:00:00 +0000"),
            testing::message("c", "Third", "2024-03-03 08:00:00"),
        ]));
        let mut stage = stage_with(ExtractConfig::default(), mailbox.clone(), Arc::default());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = records(stage.execute(StageData::Empty, &mut ctx).await.unwrap());

        let ids: Vec<_> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(mailbox.calls(), vec!["fetch UNSEEN 100"]);
        assert_eq!(ctx.metric("extract_emails_count").unwrap().as_u64(), 3);
        assert_eq!(stage.metrics()["source"].as_str(), Some("mailbox"));
    }

    #[tokio::test]
    async fn dry_run_never_contacts_mailbox() {
        let mailbox = Arc::new(MockMailbox::with_messages(vec![testing::message(
            "a", "Hi", "2024-03-01T00:00:00Z",
        )]));
        let mut stage = stage_with(ExtractConfig::default(), mailbox.clone(), Arc::default());
        let mode = RunMode { dry_run: true, ..Default::default() };
        let mut ctx = testing::context(PipelineConfig::default(), mode);

        let out = stage.execute(StageData::Empty, &mut ctx).await.unwrap();

        assert!(out.is_empty());
        assert!(mailbox.calls().is_empty());
    }

    #[tokio::test]
    async fn bad_records_are_dropped_when_skipping() {
        let mailbox = Arc::new(MockMailbox::with_messages(vec![
            testing::message("a", "Ok", "2024-03-01T00:00:00Z"),
            testing::message("", "No id", "2024-03-01T00:00:00Z"),
            testing::message("c", "Bad date", "yesterday-ish"),
        ]));
        let mut stage = stage_with(ExtractConfig::default(), mailbox, Arc::default());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = records(stage.execute(StageData::Empty, &mut ctx).await.unwrap());

        assert_eq!(out.len(), 1);
        assert_eq!(ctx.error_count(), 2);
    }

    #[tokio::test]
    async fn bad_record_aborts_without_skip() {
        let mailbox = Arc::new(MockMailbox::with_messages(vec![testing::message(
            "c", "Bad date", "not a date",
        )]));
        let config = ExtractConfig {
            skip_on_error: false,
            ..Default::default()
        };
        let mut stage = stage_with(config, mailbox, Arc::default());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let err = stage.execute(StageData::Empty, &mut ctx).await.unwrap_err();
        assert!(matches!(err, StageError::Normalization { ref record_id, .. } if record_id == "c"));
    }

    #[tokio::test]
    async fn fetch_failure_yields_empty_when_continuing() {
        let mailbox = Arc::new(MockMailbox {
            fail_fetch: true,
            ..Default::default()
        });
        let mut stage = stage_with(ExtractConfig::default(), mailbox, Arc::default());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = stage.execute(StageData::Empty, &mut ctx).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(ctx.error_count(), 1);
        assert!(ctx.errors()[0].contains("offline"));
    }

    #[tokio::test]
    async fn fetch_failure_raises_when_not_continuing() {
        let mailbox = Arc::new(MockMailbox {
            fail_fetch: true,
            ..Default::default()
        });
        let mut stage = stage_with(ExtractConfig::default(), mailbox, Arc::default());
        let config = PipelineConfig {
            continue_on_error: false,
            ..Default::default()
        };
        let mut ctx = testing::context(config, RunMode::default());

        assert!(stage.execute(StageData::Empty, &mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn store_source_uses_batch_size() {
        let store = Arc::new(MockStore {
            unprocessed: vec![
                testing::message("1", "One", "2024-01-01 00:00:00"),
                testing::message("2", "Two", "2024-01-02 00:00:00"),
                testing::message("3", "Three", "2024-01-03 00:00:00"),
            ],
            ..Default::default()
        });
        let config = ExtractConfig {
            source: ExtractSource::Store,
            batch_size: 2,
            ..Default::default()
        };
        let mailbox = Arc::new(MockMailbox::default());
        let mut stage = stage_with(config, mailbox.clone(), store.clone());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        let out = records(stage.execute(StageData::Empty, &mut ctx).await.unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(*store.fetches.lock().unwrap(), 1);
        assert!(mailbox.calls().is_empty());
    }

    #[tokio::test]
    async fn max_results_overrides_batch_size() {
        let mailbox = Arc::new(MockMailbox::default());
        let config = ExtractConfig {
            max_results: Some(7),
            ..Default::default()
        };
        let mut stage = stage_with(config, mailbox.clone(), Arc::default());
        let mut ctx = testing::context(PipelineConfig::default(), RunMode::default());

        stage.execute(StageData::Empty, &mut ctx).await.unwrap();
        assert_eq!(mailbox.calls(), vec!["fetch UNSEEN 7"]);
    }

    #[test]
    fn validates_empty_or_raw_only() {
        let stage = stage_with(ExtractConfig::default(), Arc::default(), Arc::default());
        assert!(stage.validate_input(&StageData::Empty));
        assert!(stage.validate_input(&StageData::Raw(vec![])));
        assert!(!stage.validate_input(&StageData::Enriched(vec![])));
    }

    #[test]
    fn missing_fields_default() {
        let record = normalize(FetchedMessage {
            id: " 42 ".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.subject, "");
        assert!(record.received_at <= Utc::now());
    }

    #[test]
    fn parses_supported_date_formats() {
        assert!(parse_received_at("2024-03-01T10:00:00+02:00").is_some());
        assert!(parse_received_at("Fri, 01 Mar 2024 09:00:00 +0000").is_some());
        assert!(parse_received_at("2024-03-01 10:00:00.123").is_some());
        assert!(parse_received_at("March first").is_none());
    }
}
