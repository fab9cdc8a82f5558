//! The three workers and their message handlers.
//!
//! Each worker is a [`Subscriber`](crate::bootstrap::Subscriber): once the
//! store and broker are connected it builds its handlers from the
//! [`WorkerContext`](crate::bootstrap::WorkerContext) and registers them.

pub mod agents;
pub mod cert_manager;
pub mod notifications;

use async_trait::async_trait;

use crate::broker::InboundMessage;
use crate::delivery::{MessageHandler, Outcome};
use crate::wire::subjects;

pub use agents::AgentsWorker;
pub use cert_manager::CertManagerWorker;
pub use notifications::{MailerFactory, NotificationsWorker, SmtpMailerFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkerKind {
    Agents,
    CertManager,
    Notifications,
}

impl WorkerKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Agents => "agents",
            Self::CertManager => "cert-manager",
            Self::Notifications => "notifications",
        }
    }

    pub const fn ping_subject(&self) -> &'static str {
        match self {
            Self::Agents => subjects::PING_AGENTS,
            Self::CertManager => subjects::PING_CERT_MANAGER,
            Self::Notifications => subjects::PING_NOTIFICATIONS,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Liveness check: answers with an empty payload.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _message: &InboundMessage) -> Outcome {
        Outcome::reply(bytes::Bytes::new())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_replies_empty() {
        let message = InboundMessage::new(subjects::PING_AGENTS, "", Some("_INBOX.p".into()));
        assert_eq!(PingHandler.handle(&message).await, Outcome::Reply(bytes::Bytes::new()));
    }

    #[test]
    fn every_worker_has_its_own_ping_subject() {
        let subjects = [
            WorkerKind::Agents.ping_subject(),
            WorkerKind::CertManager.ping_subject(),
            WorkerKind::Notifications.ping_subject(),
        ];
        assert_eq!(
            subjects,
            [
                "ping.agentworker",
                "ping.certmanagerworker",
                "ping.notificationworker"
            ]
        );
    }
}
