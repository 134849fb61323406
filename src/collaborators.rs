//! External systems the stages depend on, expressed as narrow async traits,
//! plus the lazily-connected holder that stages share.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{CollaboratorError, DatabaseError, LlmError, MailboxError};

/// Reserved label that marks a message as starred.
pub const STARRED_LABEL: &str = "STARRED";
/// Reserved label whose removal marks a message as read.
pub const UNREAD_LABEL: &str = "UNREAD";

/// A message as delivered by the source system, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    /// Date header or stored timestamp, in whatever form the source uses.
    pub date: Option<String>,
    pub body: Option<String>,
}

/// The mail system messages are read from and acted on.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Up to `limit` messages matching `query`.
    async fn fetch_unread(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>, MailboxError>;

    /// Identifier of the label called `name`, creating it if needed.
    async fn resolve_or_create_label(&self, name: &str) -> Result<String, MailboxError>;

    async fn apply_labels(&self, id: &str, label_ids: &[String]) -> Result<(), MailboxError>;

    async fn remove_labels(&self, id: &str, label_ids: &[String]) -> Result<(), MailboxError>;

    async fn archive(&self, id: &str) -> Result<(), MailboxError>;
}

/// Local record of messages and their processing outcomes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stored messages with no recorded outcome yet.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<FetchedMessage>, DatabaseError>;

    /// Persist the outcome for one message. Must be idempotent per id.
    async fn record_outcome(
        &self,
        id: &str,
        category: &str,
        label_ids: &[String],
    ) -> Result<(), DatabaseError>;
}

/// A classifier's answer, before it is mapped onto the category set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: String,
    pub explanation: String,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, categories: &[String])
    -> Result<Classification, LlmError>;
}

// ── Lazy holder ─────────────────────────────────────────────────────────

type Factory<T> =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<T>, CollaboratorError>> + Send + Sync>;

/// A collaborator that is connected on first use.
///
/// Construction runs at most once successfully; a failed attempt is
/// reported as `CollaboratorError::Unavailable` and retried on the next call.
pub struct Lazy<T: ?Sized + Send + Sync> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    factory: Option<Factory<T>>,
}

impl<T: ?Sized + Send + Sync> Lazy<T> {
    pub fn new<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<T>, CollaboratorError>> + Send + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            factory: Some(Box::new(move || -> BoxFuture<'static, _> {
                Box::pin(factory())
            })),
        }
    }

    /// Wrap an already constructed collaborator.
    pub fn ready(name: &'static str, value: Arc<T>) -> Self {
        Self {
            name,
            cell: OnceCell::new_with(Some(value)),
            factory: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    /// The collaborator, constructing it first if necessary.
    pub async fn ensure_ready(&self) -> Result<Arc<T>, CollaboratorError> {
        let value = self
            .cell
            .get_or_try_init(|| async {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    CollaboratorError::unavailable(self.name, "no factory configured")
                })?;
                info!(collaborator = self.name, "Connecting collaborator");
                factory().await.map_err(|e| {
                    warn!(collaborator = self.name, error = %e, "Collaborator construction failed");
                    match e {
                        CollaboratorError::Unavailable { .. } => e,
                        other => CollaboratorError::unavailable(self.name, other),
                    }
                })
            })
            .await?;
        Ok(Arc::clone(value))
    }
}

/// The collaborators the default stages share.
#[derive(Clone)]
pub struct Collaborators {
    pub mailbox: Arc<Lazy<dyn MailSource>>,
    pub store: Arc<Lazy<dyn MessageStore>>,
    pub classifier: Arc<Lazy<dyn Classifier>>,
}

impl Collaborators {
    pub fn new(
        mailbox: Lazy<dyn MailSource>,
        store: Lazy<dyn MessageStore>,
        classifier: Lazy<dyn Classifier>,
    ) -> Self {
        Self {
            mailbox: Arc::new(mailbox),
            store: Arc::new(store),
            classifier: Arc::new(classifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoClassifier;

    #[async_trait]
    impl Classifier for EchoClassifier {
        async fn classify(
            &self,
            text: &str,
            _categories: &[String],
        ) -> Result<Classification, LlmError> {
            Ok(Classification {
                category: text.to_string(),
                explanation: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn ready_holder_needs_no_factory() {
        let lazy: Lazy<dyn Classifier> = Lazy::ready("classifier", Arc::new(EchoClassifier));
        assert!(lazy.is_ready());
        let classifier = lazy.ensure_ready().await.unwrap();
        let answer = classifier.classify("Work", &[]).await.unwrap();
        assert_eq!(answer.category, "Work");
    }

    #[tokio::test]
    async fn factory_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy: Lazy<dyn Classifier> = Lazy::new("classifier", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(EchoClassifier) as Arc<dyn Classifier>)
            }
        });

        assert!(!lazy.is_ready());
        lazy.ensure_ready().await.unwrap();
        lazy.ensure_ready().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lazy.is_ready());
    }

    #[tokio::test]
    async fn failed_construction_is_unavailable_and_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy: Lazy<dyn Classifier> = Lazy::new("classifier", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CollaboratorError::from(LlmError::AuthFailed {
                    provider: "openai".into(),
                }))
            }
        });

        let err = lazy.ensure_ready().await.err().unwrap();
        assert!(matches!(err, CollaboratorError::Unavailable { ref name, .. } if name == "classifier"));
        assert!(lazy.ensure_ready().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
