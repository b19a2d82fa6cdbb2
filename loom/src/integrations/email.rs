//! Email connector: an IMAP poll loop dispatching unseen messages to an
//! agent, replying via SMTP (spec.md §4.7 "Email connector").
//!
//! IMAP/SMTP transport is abstracted behind [`MailFetcher`]/[`MailSender`]
//! so the poll/dispatch/reply discipline can be unit tested without a live
//! mail server; the concrete implementations wrap `imap` (poll, fetch,
//! mark-seen) and `lettre` (SMTP send), with `mail-parser` decoding MIME
//! bodies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::{BackgroundService, CommandHandler, IntegrationContext, RollingLog, SingleFlightDispatcher};
use crate::error::AgentError;
use crate::llm::CancelToken;

const MESSAGE_LOG_CAP_CHARS: usize = 4_000;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("imap error: {0}")]
    Imap(String),
    #[error("smtp error: {0}")]
    Smtp(String),
}

/// One fetched, not-yet-replied-to message.
#[derive(Clone, Debug)]
pub struct IncomingMail {
    pub uid: u32,
    pub message_id: String,
    pub from: String,
    pub subject: String,
    /// Raw RFC822 source; decoded lazily via [`extract_plain_text`] so
    /// tests can exercise MIME handling independently of the transport.
    pub raw_source: Vec<u8>,
}

/// Poll-side transport: search for unseen UIDs, fetch their envelope and
/// source, then mark the whole batch seen in one call (spec.md §4.7:
/// "mark the fetched UIDs as seen in one batch").
#[async_trait]
pub trait MailFetcher: Send + Sync {
    async fn search_unseen(&self) -> Result<Vec<u32>, MailError>;
    async fn fetch(&self, uids: &[u32]) -> Result<Vec<IncomingMail>, MailError>;
    async fn mark_seen(&self, uids: &[u32]) -> Result<(), MailError>;
}

/// Reply-side transport: sends one SMTP reply with `Re:` prefixing and
/// `In-Reply-To`/`References` populated from the incoming message-id
/// (spec.md §4.7).
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send_reply(&self, to: &str, subject: &str, in_reply_to: &str, body: &str) -> Result<(), MailError>;
}

/// Extracts the plain-text body from a raw RFC822 message, handling
/// multipart boundaries and quoted-printable/base64 content-transfer-
/// encoding via `mail-parser`'s decoder (spec.md §4.7).
pub fn extract_plain_text(raw: &[u8]) -> Option<String> {
    let message = mail_parser::MessageParser::default().parse(raw)?;
    message.body_text(0).map(|cow| cow.into_owned())
}

/// `Re: <subject>` unless `subject` is already `Re:`-prefixed (spec.md
/// §4.7).
fn reply_subject(subject: &str) -> String {
    if subject.trim_start().to_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

pub struct EmailConnector {
    fetcher: Arc<dyn MailFetcher>,
    sender: Arc<dyn MailSender>,
    poll_interval: Duration,
    handler: Arc<dyn CommandHandler>,
    dispatcher: SingleFlightDispatcher,
    recent: RollingLog,
}

impl EmailConnector {
    pub fn new(
        fetcher: Arc<dyn MailFetcher>,
        sender: Arc<dyn MailSender>,
        poll_interval: Duration,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            fetcher,
            sender,
            poll_interval,
            handler,
            dispatcher: SingleFlightDispatcher::new(64),
            recent: RollingLog::new(MESSAGE_LOG_CAP_CHARS),
        }
    }

    pub fn get_recent_messages(&self) -> Vec<String> {
        self.recent.snapshot()
    }

    /// One poll cycle: search, fetch, mark-seen, then dispatch+reply to
    /// each message in turn (spec.md §4.7).
    async fn poll_once(&self) -> Result<(), MailError> {
        let uids = self.fetcher.search_unseen().await?;
        if uids.is_empty() {
            return Ok(());
        }

        let mails = self.fetcher.fetch(&uids).await?;
        self.fetcher.mark_seen(&uids).await?;

        for mail in mails {
            let body = extract_plain_text(&mail.raw_source).unwrap_or_default();
            self.recent.push(format!("{}: {}", mail.from, body));

            let meta = serde_json::json!({"message_id": mail.message_id, "subject": mail.subject});
            match self.dispatcher.submit(body, mail.from.clone(), meta, self.handler.clone()).await {
                Ok(reply) => {
                    if let Err(e) = self
                        .sender
                        .send_reply(&mail.from, &reply_subject(&mail.subject), &mail.message_id, &reply)
                        .await
                    {
                        warn!(error = %e, "email connector failed to send reply");
                    }
                }
                Err(e) => warn!(error = %e, "email connector command handler failed"),
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        while !cancel.is_cancelled() {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "email connector poll failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        debug!("email connector stopped");
    }
}

#[async_trait]
impl BackgroundService for EmailConnector {
    fn service_name(&self) -> &str {
        "email_connector"
    }

    async fn run(self: Arc<Self>, cancel: CancelToken) {
        EmailConnector::run(self, cancel).await
    }
}

#[async_trait]
impl IntegrationContext for EmailConnector {
    fn recent_messages(&self) -> Vec<String> {
        self.get_recent_messages()
    }

    /// Email has no channel membership concept; always empty (spec.md §4.7
    /// only requires this for the channel connector's member-list
    /// injection, but both connectors share the [`IntegrationContext`]
    /// interface).
    fn channel_members(&self) -> Vec<String> {
        Vec::new()
    }

    async fn post(&self, _text: &str) -> Result<(), AgentError> {
        Err(AgentError::other("email connector has no standing recipient to post to outside a reply"))
    }
}

/// Live IMAP-backed fetcher. Connects fresh per poll cycle (simplest
/// correct behavior against IMAP servers that drop idle connections) using
/// the `imap` crate over implicit TLS.
pub struct ImapFetcher {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn search_unseen(&self) -> Result<Vec<u32>, MailError> {
        let (host, port, username, password, mailbox) =
            (self.host.clone(), self.port, self.username.clone(), self.password.clone(), self.mailbox.clone());
        tokio::task::spawn_blocking(move || search_unseen_blocking(&host, port, &username, &password, &mailbox))
            .await
            .map_err(|e| MailError::Imap(e.to_string()))?
    }

    async fn fetch(&self, uids: &[u32]) -> Result<Vec<IncomingMail>, MailError> {
        let (host, port, username, password, mailbox) =
            (self.host.clone(), self.port, self.username.clone(), self.password.clone(), self.mailbox.clone());
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || fetch_blocking(&host, port, &username, &password, &mailbox, &uids))
            .await
            .map_err(|e| MailError::Imap(e.to_string()))?
    }

    async fn mark_seen(&self, uids: &[u32]) -> Result<(), MailError> {
        let (host, port, username, password, mailbox) =
            (self.host.clone(), self.port, self.username.clone(), self.password.clone(), self.mailbox.clone());
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen_blocking(&host, port, &username, &password, &mailbox, &uids))
            .await
            .map_err(|e| MailError::Imap(e.to_string()))?
    }
}

fn imap_session(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    mailbox: &str,
) -> Result<imap::Session<native_tls_placeholder::TlsStream>, MailError> {
    // `imap::ClientBuilder` returns a TLS-wrapped stream; the concrete
    // stream type is re-exported below to keep this function's signature
    // short. See `native_tls_placeholder` at the bottom of this file.
    let client = imap::ClientBuilder::new(host, port).connect().map_err(|e| MailError::Imap(e.to_string()))?;
    let mut session = client.login(username, password).map_err(|(e, _)| MailError::Imap(e.to_string()))?;
    session.select(mailbox).map_err(|e| MailError::Imap(e.to_string()))?;
    Ok(session)
}

fn search_unseen_blocking(host: &str, port: u16, username: &str, password: &str, mailbox: &str) -> Result<Vec<u32>, MailError> {
    let mut session = imap_session(host, port, username, password, mailbox)?;
    let uids = session.uid_search("UNSEEN").map_err(|e| MailError::Imap(e.to_string()))?;
    Ok(uids.into_iter().collect())
}

fn fetch_blocking(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    mailbox: &str,
    uids: &[u32],
) -> Result<Vec<IncomingMail>, MailError> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    let mut session = imap_session(host, port, username, password, mailbox)?;
    let uid_set = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
    let messages = session.uid_fetch(&uid_set, "(RFC822 ENVELOPE)").map_err(|e| MailError::Imap(e.to_string()))?;

    let mut out = Vec::new();
    for m in messages.iter() {
        let Some(body) = m.body() else { continue };
        let parsed = mail_parser::MessageParser::default().parse(body);
        let (message_id, from, subject) = match &parsed {
            Some(p) => (
                p.message_id().unwrap_or_default().to_string(),
                p.from().and_then(|f| f.first()).and_then(|a| a.address()).unwrap_or_default().to_string(),
                p.subject().unwrap_or_default().to_string(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        out.push(IncomingMail { uid: m.uid.unwrap_or_default(), message_id, from, subject, raw_source: body.to_vec() });
    }
    Ok(out)
}

fn mark_seen_blocking(host: &str, port: u16, username: &str, password: &str, mailbox: &str, uids: &[u32]) -> Result<(), MailError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut session = imap_session(host, port, username, password, mailbox)?;
    let uid_set = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
    session.uid_store(&uid_set, "+FLAGS (\\Seen)").map_err(|e| MailError::Imap(e.to_string()))?;
    Ok(())
}

/// Live SMTP-backed sender via `lettre`.
pub struct SmtpSender {
    pub relay: String,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send_reply(&self, to: &str, subject: &str, in_reply_to: &str, body: &str) -> Result<(), MailError> {
        let email = lettre::Message::builder()
            .from(self.from.parse().map_err(|e: lettre::address::AddressError| MailError::Smtp(e.to_string()))?)
            .to(to.parse().map_err(|e: lettre::address::AddressError| MailError::Smtp(e.to_string()))?)
            .subject(subject)
            .header(lettre::message::header::ContentType::TEXT_PLAIN)
            .in_reply_to(in_reply_to.to_string())
            .references(in_reply_to.to_string())
            .body(body.to_string())
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        let creds = lettre::transport::smtp::authentication::Credentials::new(self.username.clone(), self.password.clone());
        let mailer = lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::relay(&self.relay)
            .map_err(|e| MailError::Smtp(e.to_string()))?
            .credentials(creds)
            .build();

        use lettre::AsyncTransport;
        mailer.send(email).await.map_err(|e| MailError::Smtp(e.to_string()))?;
        Ok(())
    }
}

/// `imap`'s `Session` is generic over its TLS stream type; this alias
/// keeps `imap_session`'s signature readable without re-deriving the
/// native-tls wrapper type at every call site.
mod native_tls_placeholder {
    pub type TlsStream = native_tls::TlsStream<std::net::TcpStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn reply_subject_adds_re_prefix_once() {
        assert_eq!(reply_subject("hello"), "Re: hello");
        assert_eq!(reply_subject("Re: hello"), "Re: hello");
        assert_eq!(reply_subject("re: hello"), "re: hello");
    }

    #[test]
    fn extract_plain_text_handles_plain_message() {
        let raw = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: hi\r\nContent-Type: text/plain\r\n\r\nhello world";
        assert_eq!(extract_plain_text(raw).as_deref(), Some("hello world"));
    }

    struct MockFetcher {
        unseen: Vec<u32>,
        mails: Vec<IncomingMail>,
        marked: AsyncMutex<Vec<u32>>,
    }

    #[async_trait]
    impl MailFetcher for MockFetcher {
        async fn search_unseen(&self) -> Result<Vec<u32>, MailError> {
            Ok(self.unseen.clone())
        }
        async fn fetch(&self, _uids: &[u32]) -> Result<Vec<IncomingMail>, MailError> {
            Ok(self.mails.clone())
        }
        async fn mark_seen(&self, uids: &[u32]) -> Result<(), MailError> {
            self.marked.lock().await.extend_from_slice(uids);
            Ok(())
        }
    }

    struct MockSender {
        sent: StdMutex<Vec<(String, String, String, String)>>,
    }

    #[async_trait]
    impl MailSender for MockSender {
        async fn send_reply(&self, to: &str, subject: &str, in_reply_to: &str, body: &str) -> Result<(), MailError> {
            self.sent.lock().unwrap().push((to.into(), subject.into(), in_reply_to.into(), body.into()));
            Ok(())
        }
    }

    struct EchoHandler;
    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, body: String, _sender: String, _meta: serde_json::Value) -> Result<String, AgentError> {
            Ok(format!("reply to: {body}"))
        }
    }

    #[tokio::test]
    async fn poll_once_marks_seen_and_replies_with_re_prefix() {
        let raw = b"From: a@example.com\r\nSubject: question\r\nContent-Type: text/plain\r\n\r\nwhat time is it".to_vec();
        let fetcher = Arc::new(MockFetcher {
            unseen: vec![1, 2],
            mails: vec![IncomingMail {
                uid: 1,
                message_id: "<abc@mail>".into(),
                from: "a@example.com".into(),
                subject: "question".into(),
                raw_source: raw,
            }],
            marked: AsyncMutex::new(Vec::new()),
        });
        let sender = Arc::new(MockSender { sent: StdMutex::new(Vec::new()) });
        let connector = EmailConnector::new(fetcher.clone(), sender.clone(), Duration::from_secs(60), Arc::new(EchoHandler));

        connector.poll_once().await.unwrap();

        assert_eq!(*fetcher.marked.lock().await, vec![1, 2]);
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@example.com");
        assert_eq!(sent[0].1, "Re: question");
        assert_eq!(sent[0].2, "<abc@mail>");
        assert_eq!(sent[0].3, "reply to: what time is it");
    }

    #[tokio::test]
    async fn poll_once_is_noop_when_nothing_unseen() {
        let fetcher = Arc::new(MockFetcher { unseen: vec![], mails: vec![], marked: AsyncMutex::new(Vec::new()) });
        let sender = Arc::new(MockSender { sent: StdMutex::new(Vec::new()) });
        let connector = EmailConnector::new(fetcher, sender.clone(), Duration::from_secs(60), Arc::new(EchoHandler));

        connector.poll_once().await.unwrap();
        assert!(sender.sent.lock().unwrap().is_empty());
    }
}
