//! Outgoing e-mail.
//!
//! Notifications arrive as plain fields plus base64 attachments. They are
//! turned into an [`OutgoingMail`] first, which is where malformed input is
//! caught, and only then handed to a [`Mailer`].

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::Settings;
use crate::wire::Notification;

/// Auth mechanism value meaning "do not authenticate".
pub const NO_AUTH: &str = "NOAUTH";

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// The message itself is unusable; sending it again will not help.
    #[error("Invalid message: {0}")]
    Compose(String),

    /// The SMTP server could not be reached or refused the message.
    #[error("SMTP error: {0}")]
    Transport(String),
}

impl MailError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// A fully resolved message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Resolve the sender, render the body and decode attachments.
pub fn compose(
    notification: &Notification,
    settings: &Settings,
) -> Result<OutgoingMail, MailError> {
    let from = if notification.from.is_empty() {
        settings.message_from.clone()
    } else {
        notification.from.clone()
    };
    if from.is_empty() {
        return Err(MailError::Compose("from cannot be empty".into()));
    }
    if notification.to.is_empty() {
        return Err(MailError::Compose("to cannot be empty".into()));
    }

    let mut attachments = Vec::new();
    for (name, content) in [
        (
            &notification.message_attach_file_name,
            &notification.message_attach_file,
        ),
        (
            &notification.message_attach_file_name2,
            &notification.message_attach_file2,
        ),
    ] {
        if name.is_empty() {
            continue;
        }
        let content = STANDARD
            .decode(content)
            .map_err(|e| MailError::Compose(format!("attachment {name}: {e}")))?;
        attachments.push(Attachment {
            file_name: name.clone(),
            content,
        });
    }

    Ok(OutgoingMail {
        from,
        to: notification.to.clone(),
        subject: notification.subject.clone(),
        body: render_body(notification),
        attachments,
    })
}

fn render_body(notification: &Notification) -> String {
    let mut paragraphs = Vec::new();
    for part in [
        &notification.message_title,
        &notification.message_greeting,
        &notification.message_text,
    ] {
        if !part.is_empty() {
            paragraphs.push(part.clone());
        }
    }
    match (
        notification.message_action.is_empty(),
        notification.message_action_url.is_empty(),
    ) {
        (false, false) => paragraphs.push(format!(
            "{}: {}",
            notification.message_action, notification.message_action_url
        )),
        (true, false) => paragraphs.push(notification.message_action_url.clone()),
        _ => {}
    }
    paragraphs.join("\n\n")
}

/// Build the MIME message for `mail`.
pub fn to_message(mail: &OutgoingMail) -> Result<Message, MailError> {
    let builder = Message::builder()
        .from(mail.from.parse::<Mailbox>().map_err(compose_err)?)
        .to(mail.to.parse::<Mailbox>().map_err(compose_err)?)
        .subject(mail.subject.clone());

    if mail.attachments.is_empty() {
        return builder
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(compose_err);
    }

    let octet_stream =
        ContentType::parse("application/octet-stream").map_err(compose_err)?;
    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(mail.body.clone()));
    for attachment in &mail.attachments {
        parts = parts.singlepart(
            MailAttachment::new(attachment.file_name.clone())
                .body(attachment.content.clone(), octet_stream.clone()),
        );
    }
    builder.multipart(parts).map_err(compose_err)
}

fn compose_err(e: impl std::fmt::Display) -> MailError {
    MailError::Compose(e.to_string())
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// Whether `settings` ask for SMTP authentication.
pub fn needs_auth(settings: &Settings) -> bool {
    !(settings.smtp_auth == NO_AUTH
        || (settings.smtp_user.is_empty() && settings.smtp_password.is_empty()))
}

fn mechanism(name: &str) -> Option<Mechanism> {
    match name.to_ascii_uppercase().as_str() {
        "PLAIN" => Some(Mechanism::Plain),
        "LOGIN" => Some(Mechanism::Login),
        "XOAUTH2" => Some(Mechanism::Xoauth2),
        _ => None,
    }
}

/// SMTP delivery through `lettre`.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn from_settings(settings: &Settings) -> Result<Self, MailError> {
        if settings.smtp_server.is_empty() {
            return Err(MailError::Transport("no SMTP server configured".into()));
        }
        let port = u16::try_from(settings.smtp_port)
            .map_err(|_| {
                MailError::Transport(format!("invalid SMTP port {}", settings.smtp_port))
            })?;

        let mut builder = if settings.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_server)
                .map_err(|e| MailError::Transport(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_server)
        };
        builder = builder.port(port);

        if needs_auth(settings) {
            builder = builder.credentials(Credentials::new(
                settings.smtp_user.clone(),
                settings.smtp_password.clone(),
            ));
            if let Some(mechanism) = mechanism(&settings.smtp_auth) {
                builder = builder.authentication(vec![mechanism]);
            }
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = to_message(mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        debug!(to = %mail.to, "Mail sent");
        Ok(())
    }
}

/// Mailer that keeps every message in memory.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    fail: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MailError::Transport("connection refused".into()));
        }
        to_message(mail)?;
        self.sent.lock().await.push(mail.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            auto_admit_agents: false,
            agent_report_frequency_mins: 60,
            smtp_server: "smtp.example.com".into(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_password: String::new(),
            smtp_auth: "PLAIN".into(),
            smtp_tls: true,
            message_from: "fleet@example.com".into(),
        }
    }

    fn notification() -> Notification {
        Notification {
            to: "ana@example.com".into(),
            subject: "Your certificate".into(),
            message_title: "Fleet | Your certificate".into(),
            message_greeting: "Hi Ana".into(),
            message_text: "Import the attached certificate.".into(),
            ..Notification::default()
        }
    }

    #[test]
    fn sender_falls_back_to_settings() {
        let mail = compose(&notification(), &settings()).unwrap();
        assert_eq!(mail.from, "fleet@example.com");
        assert!(mail.body.starts_with("Fleet | Your certificate\n\nHi Ana"));
    }

    #[test]
    fn missing_sender_is_rejected() {
        let mut s = settings();
        s.message_from.clear();
        let err = compose(&notification(), &s).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn attachments_are_decoded() {
        let mut n = notification();
        n.message_attach_file_name = "ana.pfx".into();
        n.message_attach_file = STANDARD.encode(b"pkcs12");
        n.message_attach_file_name2 = "ca_crt.zip".into();
        n.message_attach_file2 = STANDARD.encode(b"zip");

        let mail = compose(&n, &settings()).unwrap();
        assert_eq!(mail.attachments.len(), 2);
        assert_eq!(mail.attachments[0].content, b"pkcs12");
        assert_eq!(mail.attachments[1].file_name, "ca_crt.zip");

        let formatted =
            String::from_utf8_lossy(&to_message(&mail).unwrap().formatted()).to_string();
        assert!(formatted.contains("ca_crt.zip"));
    }

    #[test]
    fn bad_base64_is_a_compose_error() {
        let mut n = notification();
        n.message_attach_file_name = "broken.bin".into();
        n.message_attach_file = "%%%".into();
        assert!(matches!(compose(&n, &settings()), Err(MailError::Compose(_))));
    }

    #[test]
    fn auth_is_skipped_without_credentials_or_with_noauth() {
        let mut s = settings();
        assert!(!needs_auth(&s));
        s.smtp_user = "mailer".into();
        s.smtp_password = "secret".into();
        assert!(needs_auth(&s));
        s.smtp_auth = NO_AUTH.into();
        assert!(!needs_auth(&s));
    }

    // The pooled transport spawns onto the runtime when built.
    #[tokio::test]
    async fn transport_builds_from_settings() {
        assert!(SmtpMailer::from_settings(&settings()).is_ok());
        let mut s = settings();
        s.smtp_port = 70_000;
        assert!(SmtpMailer::from_settings(&s).is_err());
    }

    #[tokio::test]
    async fn recording_mailer_keeps_messages() {
        let mailer = RecordingMailer::new();
        let mail = compose(&notification(), &settings()).unwrap();
        mailer.send(&mail).await.unwrap();
        mailer.fail_sends(true);
        assert!(mailer.send(&mail).await.unwrap_err().is_transient());
        assert_eq!(mailer.sent().await.len(), 1);
    }
}
