//! Notification worker: sends e-mails queued by the console and the
//! certificate manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::PingHandler;
use crate::bootstrap::{Subscriber, WorkerContext};
use crate::broker::{DurableSpec, InboundMessage, durable_name};
use crate::delivery::{MessageHandler, Outcome, RETRY_PROCESSING, SubscriptionSet};
use crate::error::WorkerError;
use crate::mail::{self, MailError, Mailer, SmtpMailer};
use crate::storage::{Settings, WorkerDatabase};
use crate::wire::{Notification, groups, streams, subjects};

pub const CONSUMER_PREFIX: &str = "NotificationConsumer";
pub const CONFIRMATION_SENT: &str = "Confirmation email has been sent!";
pub const CERTIFICATE_SENT: &str = "User certificate has been sent!";

/// Builds a mailer for the current SMTP settings.
pub trait MailerFactory: Send + Sync {
    fn build(&self, settings: &Settings) -> Result<Arc<dyn Mailer>, MailError>;
}

pub struct SmtpMailerFactory;

impl MailerFactory for SmtpMailerFactory {
    fn build(&self, settings: &Settings) -> Result<Arc<dyn Mailer>, MailError> {
        Ok(Arc::new(SmtpMailer::from_settings(settings)?))
    }
}

type SharedSettings = Arc<RwLock<Settings>>;

pub struct NotificationsWorker {
    factory: Arc<dyn MailerFactory>,
    ack_wait: Duration,
}

impl NotificationsWorker {
    pub fn new(factory: Arc<dyn MailerFactory>, ack_wait: Duration) -> Self {
        Self { factory, ack_wait }
    }

    pub fn consumer_spec(&self, hostname: &str) -> DurableSpec {
        DurableSpec {
            stream: streams::NOTIFICATIONS.to_string(),
            subjects: vec![
                subjects::CONFIRM_EMAIL.to_string(),
                subjects::SEND_CERTIFICATE.to_string(),
            ],
            durable_name: durable_name(CONSUMER_PREFIX, hostname),
            ack_wait: self.ack_wait,
        }
    }
}

#[async_trait]
impl Subscriber for NotificationsWorker {
    async fn subscribe(
        &self,
        context: &WorkerContext,
        subscriptions: &SubscriptionSet,
    ) -> Result<(), WorkerError> {
        let settings: SharedSettings = Arc::new(RwLock::new(context.db.get_settings().await?));

        subscriptions
            .durable(
                self.consumer_spec(&context.hostname),
                Arc::new(NotificationHandler::new(
                    Arc::clone(&settings),
                    Arc::clone(&self.factory),
                )),
            )
            .await?;
        subscriptions
            .queue(
                subjects::RELOAD_SETTINGS,
                groups::NOTIFICATIONS,
                Arc::new(ReloadSettingsHandler::new(context.db.clone(), settings)),
            )
            .await?;
        subscriptions
            .queue(
                subjects::PING_NOTIFICATIONS,
                groups::NOTIFICATIONS,
                Arc::new(PingHandler),
            )
            .await?;
        Ok(())
    }
}

pub struct NotificationHandler {
    settings: SharedSettings,
    factory: Arc<dyn MailerFactory>,
}

impl NotificationHandler {
    pub fn new(settings: SharedSettings, factory: Arc<dyn MailerFactory>) -> Self {
        Self { settings, factory }
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, message: &InboundMessage) -> Outcome {
        let sent_reply = match message.subject.as_str() {
            subjects::CONFIRM_EMAIL => CONFIRMATION_SENT,
            subjects::SEND_CERTIFICATE => CERTIFICATE_SENT,
            other => return Outcome::fatal(format!("unexpected subject {other}")),
        };
        let notification: Notification = match serde_json::from_slice(&message.payload) {
            Ok(notification) => notification,
            Err(e) => return Outcome::fatal(format!("could not parse notification: {e}")),
        };

        let settings = self.settings.read().await.clone();
        let sent = async {
            let mail = mail::compose(&notification, &settings)?;
            let mailer = self.factory.build(&settings)?;
            mailer.send(&mail).await
        };
        match sent.await {
            Ok(()) => {
                info!(subject = %message.subject, to = %notification.to, "Notification sent");
                Outcome::reply(sent_reply)
            }
            Err(e) if e.is_transient() => {
                warn!(subject = %message.subject, error = %e, "Could not send notification");
                Outcome::RetryAfter(RETRY_PROCESSING)
            }
            Err(e) => Outcome::fatal(e),
        }
    }
}

/// Re-reads SMTP settings after the console changed them.
pub struct ReloadSettingsHandler {
    db: WorkerDatabase,
    settings: SharedSettings,
}

impl ReloadSettingsHandler {
    pub fn new(db: WorkerDatabase, settings: SharedSettings) -> Self {
        Self { db, settings }
    }
}

#[async_trait]
impl MessageHandler for ReloadSettingsHandler {
    async fn handle(&self, _message: &InboundMessage) -> Outcome {
        match self.db.get_settings().await {
            Ok(fresh) => {
                *self.settings.write().await = fresh;
                info!("SMTP settings reloaded");
                Outcome::reply("")
            }
            Err(e) => Outcome::fatal(format!("could not reload SMTP settings: {e}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::mail::RecordingMailer;

    struct Recording(RecordingMailer);

    impl MailerFactory for Recording {
        fn build(&self, _settings: &Settings) -> Result<Arc<dyn Mailer>, MailError> {
            Ok(Arc::new(self.0.clone()))
        }
    }

    async fn setup() -> (WorkerDatabase, SharedSettings, RecordingMailer, NotificationHandler) {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let mut settings = db.get_settings().await.unwrap();
        settings.message_from = "fleet@example.com".into();
        db.save_settings(&settings).await.unwrap();

        let shared = Arc::new(RwLock::new(db.get_settings().await.unwrap()));
        let mailer = RecordingMailer::new();
        let handler =
            NotificationHandler::new(Arc::clone(&shared), Arc::new(Recording(mailer.clone())));
        (db, shared, mailer, handler)
    }

    fn delivery(subject: &str, payload: &str) -> InboundMessage {
        InboundMessage::new(subject, payload.to_string(), None)
    }

    #[tokio::test]
    async fn confirmation_mail_is_sent() {
        let (_db, _settings, mailer, handler) = setup().await;
        let outcome = handler
            .handle(&delivery(
                subjects::CONFIRM_EMAIL,
                r#"{"to":"ana@example.com","subject":"Confirm your e-mail"}"#,
            ))
            .await;

        assert_eq!(outcome, Outcome::reply(CONFIRMATION_SENT));
        let sent = mailer.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "fleet@example.com");
    }

    #[tokio::test]
    async fn smtp_failure_is_retried() {
        let (_db, _settings, mailer, handler) = setup().await;
        mailer.fail_sends(true);
        let outcome = handler
            .handle(&delivery(subjects::SEND_CERTIFICATE, r#"{"to":"ana@example.com"}"#))
            .await;
        assert_eq!(outcome, Outcome::RetryAfter(RETRY_PROCESSING));
    }

    #[tokio::test]
    async fn unusable_notifications_are_fatal() {
        let (_db, _settings, _mailer, handler) = setup().await;
        for payload in ["{", r#"{"subject":"no recipient"}"#] {
            let outcome = handler.handle(&delivery(subjects::CONFIRM_EMAIL, payload)).await;
            assert!(matches!(outcome, Outcome::Fatal(_)), "{payload}");
        }
    }

    #[tokio::test]
    async fn reload_picks_up_new_settings() {
        let (db, shared, mailer, handler) = setup().await;
        let mut changed = db.get_settings().await.unwrap();
        changed.message_from = "noreply@example.com".into();
        db.save_settings(&changed).await.unwrap();

        let reload = ReloadSettingsHandler::new(db.clone(), Arc::clone(&shared));
        let outcome = reload
            .handle(&InboundMessage::new(subjects::RELOAD_SETTINGS, "", Some("_INBOX.r".into())))
            .await;
        assert_eq!(outcome, Outcome::reply(""));

        handler
            .handle(&delivery(subjects::CONFIRM_EMAIL, r#"{"to":"ana@example.com"}"#))
            .await;
        assert_eq!(mailer.sent().await[0].from, "noreply@example.com");
    }

    #[tokio::test]
    async fn worker_registers_consumer_and_queue_subscriptions() {
        let broker = InMemoryBroker::new();
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let context = WorkerContext {
            db,
            broker: Arc::new(broker.clone()),
            hostname: "mailer01".into(),
        };
        let subscriptions =
            SubscriptionSet::new(Arc::new(broker.clone()), Duration::from_secs(3600));
        let worker = NotificationsWorker::new(
            Arc::new(Recording(RecordingMailer::new())),
            Duration::from_secs(60),
        );

        worker.subscribe(&context, &subscriptions).await.unwrap();

        let specs = broker.durable_specs().await;
        assert_eq!(specs[0].durable_name, "NotificationConsumermailer01");
        assert_eq!(specs[0].stream, "NOTIFICATION_STREAM");
        let open = broker.subscriptions().await;
        assert!(open.contains(&subjects::RELOAD_SETTINGS.to_string()));
        assert!(open.contains(&subjects::PING_NOTIFICATIONS.to_string()));
        subscriptions.drain().await;
    }
}
