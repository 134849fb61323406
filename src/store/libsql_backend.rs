//! libSQL implementation of [`MessageStore`].
//!
//! Supports a local database file and an in-memory database. One connection
//! is opened and reused for every operation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collaborators::{FetchedMessage, MessageStore};
use crate::error::DatabaseError;
use crate::pipeline::extract::parse_received_at;
use crate::store::migrations;

/// One recorded change to a message's label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChange {
    pub email_id: String,
    pub old_labels: Vec<String>,
    pub new_labels: Vec<String>,
    pub category: String,
    pub changed_at: String,
}

pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Message store opened");
        Ok(store)
    }

    /// In-memory database, used by tests and dry runs.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Insert or replace a message so a later store-sourced run can pick it up.
    ///
    /// Parseable dates are stored as RFC 3339 so `fetch_unprocessed` can order
    /// them as text. Anything else is kept verbatim.
    pub async fn save_email(&self, message: &FetchedMessage) -> Result<(), DatabaseError> {
        let date = message.date.as_deref().map(normalize_date);
        self.conn
            .execute(
                "INSERT INTO emails (id, subject, sender, date, body) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    subject = excluded.subject,
                    sender = excluded.sender,
                    date = excluded.date,
                    body = excluded.body",
                params![
                    message.id.clone(),
                    opt_text(message.subject.as_deref()),
                    opt_text(message.sender.as_deref()),
                    opt_text(date.as_deref()),
                    opt_text(message.body.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_email: {e}")))?;

        debug!(email_id = %message.id, "Email saved");
        Ok(())
    }

    /// Whether an outcome has been recorded for `id`.
    pub async fn is_processed(&self, id: &str) -> Result<bool, DatabaseError> {
        Ok(self.processed_category(id).await?.is_some())
    }

    /// Category recorded for `id`, if any.
    pub async fn processed_category(&self, id: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT category FROM processed_emails WHERE email_id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("processed_category: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("processed_category: {e}"))),
        }
    }

    /// Current label set stored for `id`.
    pub async fn labels(&self, id: &str) -> Result<Vec<String>, DatabaseError> {
        read_labels(&self.conn, id).await
    }

    /// Label changes for `id`, oldest first.
    pub async fn label_history(&self, id: &str) -> Result<Vec<LabelChange>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT email_id, old_labels, new_labels, category, changed_at
                 FROM label_history WHERE email_id = ?1 ORDER BY id ASC",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("label_history: {e}")))?;

        let mut history = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let old: String = row.get(1).unwrap_or_default();
            let new: String = row.get(2).unwrap_or_default();
            history.push(LabelChange {
                email_id: row.get(0).unwrap_or_default(),
                old_labels: decode_labels(&old)?,
                new_labels: decode_labels(&new)?,
                category: row.get(3).unwrap_or_default(),
                changed_at: row.get(4).unwrap_or_default(),
            });
        }
        Ok(history)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn normalize_date(raw: &str) -> String {
    parse_received_at(raw)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| raw.to_string())
}

fn decode_labels(raw: &str) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("labels: {e}")))
}

fn encode_labels(labels: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(labels).map_err(|e| DatabaseError::Serialization(format!("labels: {e}")))
}

async fn read_labels(conn: &Connection, id: &str) -> Result<Vec<String>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT labels FROM email_labels WHERE email_id = ?1",
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("read_labels: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let raw: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("read_labels row parse: {e}")))?;
            decode_labels(&raw)
        }
        Ok(None) => Ok(Vec::new()),
        Err(e) => Err(DatabaseError::Query(format!("read_labels: {e}"))),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<FetchedMessage>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.id, e.subject, e.sender, e.date, e.body
                 FROM emails e
                 LEFT JOIN processed_emails p ON p.email_id = e.id
                 WHERE p.email_id IS NULL
                 ORDER BY e.date ASC, e.id ASC
                 LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_unprocessed: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(FetchedMessage {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("fetch_unprocessed row parse: {e}")))?,
                subject: row.get(1).ok(),
                sender: row.get(2).ok(),
                date: row.get(3).ok(),
                body: row.get(4).ok(),
            });
        }
        debug!(count = messages.len(), "Fetched unprocessed emails");
        Ok(messages)
    }

    async fn record_outcome(
        &self,
        id: &str,
        category: &str,
        label_ids: &[String],
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let new_labels = encode_labels(label_ids)?;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_outcome begin: {e}")))?;

        let old_labels = read_labels(&tx, id).await?;
        tx.execute(
            "INSERT INTO label_history (email_id, old_labels, new_labels, category, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, encode_labels(&old_labels)?, new_labels.clone(), category, now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_outcome history: {e}")))?;

        tx.execute(
            "INSERT INTO email_labels (email_id, labels, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(email_id) DO UPDATE SET labels = excluded.labels, updated_at = excluded.updated_at",
            params![id, new_labels, now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_outcome labels: {e}")))?;

        tx.execute(
            "INSERT INTO processed_emails (email_id, category, processed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(email_id) DO UPDATE SET category = excluded.category, processed_at = excluded.processed_at",
            params![id, category, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_outcome processed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_outcome commit: {e}")))?;

        debug!(email_id = %id, category = %category, "Outcome recorded");
        Ok(())
    }
}
