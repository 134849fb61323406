//! IMAP implementation of [`MailSource`].
//!
//! Speaks raw IMAP4rev1 over rustls on a blocking socket; every call runs
//! inside `spawn_blocking`. Messages are addressed by UID. Labels map onto
//! mailboxes (applied with `UID COPY`), except the reserved `STARRED` and
//! `UNREAD` labels, which map onto the `\Flagged` and `\Seen` flags.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::collaborators::{FetchedMessage, MailSource, STARRED_LABEL, UNREAD_LABEL};
use crate::error::{ConfigError, MailboxError};

/// Largest server literal (one raw message) read into memory.
const MAX_LITERAL_BYTES: usize = 32 * 1024 * 1024;

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Mailbox messages are read from.
    pub mailbox: String,
    /// Mailbox `archive` moves messages to.
    pub archive_mailbox: String,
    pub timeout_secs: u64,
}

impl ImapConfig {
    /// Build from `MAIL_SORTER_IMAP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |key: &str| {
            std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
        };

        let host = required("MAIL_SORTER_IMAP_HOST")?;
        let username = required("MAIL_SORTER_IMAP_USERNAME")?;
        let password = SecretString::from(required("MAIL_SORTER_IMAP_PASSWORD")?);

        let port: u16 = std::env::var("MAIL_SORTER_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let timeout_secs: u64 = std::env::var("MAIL_SORTER_IMAP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            host,
            port,
            username,
            password,
            mailbox: std::env::var("MAIL_SORTER_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".into()),
            archive_mailbox: std::env::var("MAIL_SORTER_ARCHIVE_MAILBOX")
                .unwrap_or_else(|_| "Archive".into()),
            timeout_secs,
        })
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Untagged lines and literals of one command's response.
#[derive(Debug, Default)]
struct Reply {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// A logged-in IMAP connection with the source mailbox selected.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn open(config: &ImapConfig) -> Result<Self, MailboxError> {
        let connect_err = |reason: String| MailboxError::Connect {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(config.timeout_secs)))
            .map_err(|e| connect_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        debug!(greeting = %greeting.trim_end(), "IMAP greeting");

        let login = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        session.command(&login).map_err(|_| MailboxError::AuthFailed {
            username: config.username.clone(),
        })?;
        session.command(&format!("SELECT {}", quote(&config.mailbox)))?;

        info!(host = %config.host, mailbox = %config.mailbox, "IMAP session ready");
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailboxError::Io("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(MailboxError::Io(e.to_string())),
            }
        }
    }

    /// Send a tagged command and collect its response. A tagged status other
    /// than `OK` is an error.
    fn command(&mut self, cmd: &str) -> Result<Reply, MailboxError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        self.tls
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|()| self.tls.flush())
            .map_err(|e| MailboxError::Io(e.to_string()))?;

        let mut reply = Reply::default();
        loop {
            let line = self.read_line()?;

            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(reply);
                }
                return Err(MailboxError::Command {
                    command: command_name(cmd),
                    reason: status.to_string(),
                });
            }

            if let Some(len) = checked_literal_len(&line)? {
                let mut literal = vec![0u8; len];
                self.tls
                    .read_exact(&mut literal)
                    .map_err(|e| MailboxError::Io(e.to_string()))?;
                reply.literals.push(literal);
            }
            reply.lines.push(line);
        }
    }

    fn search(&mut self, query: &str) -> Result<Vec<String>, MailboxError> {
        let reply = self.command(&format!("UID SEARCH {query}"))?;
        Ok(parse_search(&reply.lines))
    }

    fn fetch(&mut self, uid: &str) -> Result<Option<FetchedMessage>, MailboxError> {
        let reply = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(reply
            .literals
            .first()
            .and_then(|raw| parse_message(uid, raw)))
    }

    fn mailbox_exists(&mut self, name: &str) -> Result<bool, MailboxError> {
        let reply = self.command(&format!("LIST \"\" {}", quote(name)))?;
        Ok(reply.lines.iter().any(|l| l.starts_with("* LIST")))
    }
}

/// Verb of a command, for error messages that must not echo credentials.
fn command_name(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match words.next() {
        Some("UID") => format!("UID {}", words.next().unwrap_or_default()),
        Some(verb) => verb.to_string(),
        None => String::new(),
    }
}

/// Byte count of a trailing `{N}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.trim_end().strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].parse().ok()
}

/// Like [`literal_len`], but refuses literals larger than
/// [`MAX_LITERAL_BYTES`] before anything is allocated.
fn checked_literal_len(line: &str) -> Result<Option<usize>, MailboxError> {
    match literal_len(line) {
        Some(len) if len > MAX_LITERAL_BYTES => Err(MailboxError::Io(format!(
            "IMAP literal of {len} bytes exceeds the {MAX_LITERAL_BYTES} byte limit"
        ))),
        other => Ok(other),
    }
}

fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

/// Quote an IMAP string argument.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── Message parsing ─────────────────────────────────────────────────

fn parse_message(uid: &str, raw: &[u8]) -> Option<FetchedMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let date = parsed.date().and_then(|d| {
        chrono::NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
            .and_then(|date| {
                date.and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))
            })
            .map(|naive| naive.and_utc().to_rfc3339())
    });

    Some(FetchedMessage {
        id: uid.to_string(),
        subject: parsed.subject().map(str::to_string),
        sender: extract_sender(&parsed),
        date,
        body: Some(extract_text(&parsed)),
    })
}

fn extract_sender(parsed: &mail_parser::Message) -> Option<String> {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
}

/// Plain-text body, else the HTML body with markup removed.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Drop tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── MailSource ──────────────────────────────────────────────────────

pub struct ImapMailbox {
    config: Arc<ImapConfig>,
    session: Arc<Mutex<ImapSession>>,
}

impl ImapMailbox {
    /// Connect, log in and select the source mailbox.
    pub async fn connect(config: ImapConfig) -> Result<Self, MailboxError> {
        let config = Arc::new(config);
        let cfg = Arc::clone(&config);
        let session = tokio::task::spawn_blocking(move || ImapSession::open(&cfg))
            .await
            .map_err(|e| MailboxError::Io(format!("IMAP task failed: {e}")))??;

        Ok(Self {
            config,
            session: Arc::new(Mutex::new(session)),
        })
    }

    async fn with_session<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailboxError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut guard = session
                .lock()
                .map_err(|_| MailboxError::Io("IMAP session lock poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| MailboxError::Io(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_unread(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>, MailboxError> {
        let query = query.to_string();
        self.with_session(move |session| {
            let uids = session.search(&query)?;
            debug!(found = uids.len(), limit, "IMAP search complete");

            let mut messages = Vec::new();
            for uid in uids.iter().take(limit) {
                match session.fetch(uid)? {
                    Some(message) => messages.push(message),
                    None => warn!(uid = %uid, "Could not parse message, skipping"),
                }
            }
            Ok(messages)
        })
        .await
    }

    async fn resolve_or_create_label(&self, name: &str) -> Result<String, MailboxError> {
        let name = name.to_string();
        self.with_session(move |session| {
            let exists = session.mailbox_exists(&name).map_err(|e| MailboxError::LabelFailed {
                label: name.clone(),
                reason: e.to_string(),
            })?;
            if !exists {
                session
                    .command(&format!("CREATE {}", quote(&name)))
                    .map_err(|e| MailboxError::LabelFailed {
                        label: name.clone(),
                        reason: e.to_string(),
                    })?;
                info!(label = %name, "Created mailbox for label");
            }
            Ok(name)
        })
        .await
    }

    async fn apply_labels(&self, id: &str, label_ids: &[String]) -> Result<(), MailboxError> {
        let id = id.to_string();
        let labels = label_ids.to_vec();
        self.with_session(move |session| {
            for label in &labels {
                if label == STARRED_LABEL {
                    session.command(&format!("UID STORE {id} +FLAGS (\\Flagged)"))?;
                } else {
                    session.command(&format!("UID COPY {id} {}", quote(label)))?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn remove_labels(&self, id: &str, label_ids: &[String]) -> Result<(), MailboxError> {
        let id = id.to_string();
        let labels = label_ids.to_vec();
        self.with_session(move |session| {
            for label in &labels {
                match label.as_str() {
                    UNREAD_LABEL => {
                        session.command(&format!("UID STORE {id} +FLAGS (\\Seen)"))?;
                    }
                    STARRED_LABEL => {
                        session.command(&format!("UID STORE {id} -FLAGS (\\Flagged)"))?;
                    }
                    other => {
                        return Err(MailboxError::LabelFailed {
                            label: other.to_string(),
                            reason: "only flag labels can be removed over IMAP".into(),
                        });
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn archive(&self, id: &str) -> Result<(), MailboxError> {
        let cmd = format!("UID MOVE {id} {}", quote(&self.config.archive_mailbox));
        self.with_session(move |session| session.command(&cmd).map(|_| ()))
            .await
    }
}

// ── Tests ───────────────────────────────────────────────────────────
