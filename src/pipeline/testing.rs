//! Recording mock collaborators for stage and orchestrator tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::collaborators::{
    Classification, Classifier, Collaborators, FetchedMessage, Lazy, MailSource, MessageStore,
};
use crate::config::PipelineConfig;
use crate::error::{DatabaseError, LlmError, MailboxError};
use crate::pipeline::context::{RunContext, RunMode};
use crate::pipeline::types::{EnrichedRecord, RawRecord};

pub fn message(id: &str, subject: &str, date: &str) -> FetchedMessage {
    FetchedMessage {
        id: id.to_string(),
        subject: Some(subject.to_string()),
        sender: Some(format!("{id}@example.com")),
        date: Some(date.to_string()),
        body: Some(format!("Body of {id}")),
    }
}

pub fn raw(id: &str) -> RawRecord {
    RawRecord {
        id: id.to_string(),
        subject: format!("Subject {id}"),
        sender: format!("{id}@example.com"),
        body: format!("Body of {id}"),
        received_at: Utc::now(),
    }
}

pub fn enriched(id: &str, category: &str) -> EnrichedRecord {
    EnrichedRecord::new(raw(id), category, "mock", 0.7, 0.0)
}

pub fn context(config: PipelineConfig, mode: RunMode) -> RunContext {
    RunContext::new(Arc::new(config), mode)
}

// ── Mailbox ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockMailbox {
    pub messages: Vec<FetchedMessage>,
    pub fail_fetch: bool,
    /// Ids for which every mutating call fails.
    pub failing_ids: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockMailbox {
    pub fn with_messages(messages: Vec<FetchedMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String, id: Option<&str>) -> Result<(), MailboxError> {
        self.calls.lock().unwrap().push(call.clone());
        if let Some(id) = id
            && self.failing_ids.contains(id)
        {
            return Err(MailboxError::Command {
                command: call,
                reason: "rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MailSource for MockMailbox {
    async fn fetch_unread(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>, MailboxError> {
        self.record(format!("fetch {query} {limit}"), None)?;
        if self.fail_fetch {
            return Err(MailboxError::Connect {
                host: "mock".to_string(),
                reason: "offline".to_string(),
            });
        }
        Ok(self.messages.iter().take(limit).cloned().collect())
    }

    async fn resolve_or_create_label(&self, name: &str) -> Result<String, MailboxError> {
        self.record(format!("resolve {name}"), None)?;
        Ok(format!("Label_{name}"))
    }

    async fn apply_labels(&self, id: &str, label_ids: &[String]) -> Result<(), MailboxError> {
        self.record(format!("apply {id} {}", label_ids.join(",")), Some(id))
    }

    async fn remove_labels(&self, id: &str, label_ids: &[String]) -> Result<(), MailboxError> {
        self.record(format!("remove {id} {}", label_ids.join(",")), Some(id))
    }

    async fn archive(&self, id: &str) -> Result<(), MailboxError> {
        self.record(format!("archive {id}"), Some(id))
    }
}

// ── Store ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockStore {
    pub unprocessed: Vec<FetchedMessage>,
    pub failing_ids: HashSet<String>,
    pub fetches: Mutex<usize>,
    pub outcomes: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl MockStore {
    pub fn outcomes(&self) -> Vec<(String, String, Vec<String>)> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for MockStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<FetchedMessage>, DatabaseError> {
        *self.fetches.lock().unwrap() += 1;
        Ok(self.unprocessed.iter().take(limit).cloned().collect())
    }

    async fn record_outcome(
        &self,
        id: &str,
        category: &str,
        label_ids: &[String],
    ) -> Result<(), DatabaseError> {
        if self.failing_ids.contains(id) {
            return Err(DatabaseError::Query(format!("insert {id}: disk full")));
        }
        self.outcomes
            .lock()
            .unwrap()
            .push((id.to_string(), category.to_string(), label_ids.to_vec()));
        Ok(())
    }
}

// ── Classifier ──────────────────────────────────────────────────────────

/// Answers from a script, falling back to `default_category` once it runs
/// out. `Err` entries become classifier failures.
pub struct MockClassifier {
    pub script: Mutex<VecDeque<Result<String, String>>>,
    pub default_category: String,
    pub prompts: Mutex<Vec<String>>,
}

impl MockClassifier {
    pub fn answering(default_category: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_category: default_category.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(script: Vec<Result<&str, &str>>) -> Self {
        let classifier = Self::answering("Other");
        *classifier.script.lock().unwrap() = script
            .into_iter()
            .map(|r| r.map(str::to_string).map_err(str::to_string))
            .collect();
        classifier
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(
        &self,
        text: &str,
        _categories: &[String],
    ) -> Result<Classification, LlmError> {
        self.prompts.lock().unwrap().push(text.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| Ok(self.default_category.clone())) {
            Ok(category) => Ok(Classification {
                category,
                explanation: "mock explanation".to_string(),
            }),
            Err(reason) => Err(LlmError::RequestFailed {
                provider: "mock".to_string(),
                reason,
            }),
        }
    }
}

/// Collaborators backed by the given mocks.
pub fn collaborators(
    mailbox: Arc<MockMailbox>,
    store: Arc<MockStore>,
    classifier: Arc<MockClassifier>,
) -> Collaborators {
    Collaborators::new(
        Lazy::ready("mailbox", mailbox as Arc<dyn MailSource>),
        Lazy::ready("store", store as Arc<dyn MessageStore>),
        Lazy::ready("classifier", classifier as Arc<dyn Classifier>),
    )
}
