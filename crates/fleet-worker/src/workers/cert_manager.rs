//! Certificate manager worker.
//!
//! Consumes certificate requests from a durable consumer, so a request that
//! fails halfway is redelivered instead of lost. The redelivery delay
//! depends on where issuance stopped, see [`failure_outcome`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_crypto::CertificateAuthority;
use tracing::{info, warn};

use super::PingHandler;
use crate::bootstrap::{Subscriber, WorkerContext};
use crate::broker::{DurableSpec, InboundMessage, durable_name};
use crate::delivery::{MessageHandler, Outcome, RETRY_PROCESSING, SubscriptionSet};
use crate::error::WorkerError;
use crate::issuance::{IssuanceStage, IssuanceWorkflow, failure_outcome};
use crate::storage::{CertificateType, WorkerDatabase};
use crate::wire::{CertificateRequest, RevocationRequest, groups, streams, subjects};

/// Consumer name prefix; the worker's hostname is appended.
pub const CONSUMER_PREFIX: &str = "CertManagerConsumer";

pub struct CertManagerWorker {
    authority: Arc<dyn CertificateAuthority>,
    ocsp_responders: Vec<String>,
    default_password: String,
    ack_wait: Duration,
}

impl CertManagerWorker {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        ocsp_responders: Vec<String>,
        default_password: String,
        ack_wait: Duration,
    ) -> Self {
        Self {
            authority,
            ocsp_responders,
            default_password,
            ack_wait,
        }
    }

    pub fn consumer_spec(&self, hostname: &str) -> DurableSpec {
        DurableSpec {
            stream: streams::CERT_MANAGER.to_string(),
            subjects: vec![
                subjects::CERTIFICATES_USER.to_string(),
                subjects::CERTIFICATES_REVOKE.to_string(),
                subjects::CERTIFICATES_AGENT.to_string(),
            ],
            durable_name: durable_name(CONSUMER_PREFIX, hostname),
            ack_wait: self.ack_wait,
        }
    }
}

#[async_trait]
impl Subscriber for CertManagerWorker {
    async fn subscribe(
        &self,
        context: &WorkerContext,
        subscriptions: &SubscriptionSet,
    ) -> Result<(), WorkerError> {
        let workflow = IssuanceWorkflow::new(
            Arc::clone(&self.authority),
            Arc::clone(&context.broker),
            context.db.clone(),
            self.ocsp_responders.clone(),
            self.default_password.clone(),
        );
        subscriptions
            .durable(
                self.consumer_spec(&context.hostname),
                Arc::new(CertificateHandler::new(workflow, context.db.clone())),
            )
            .await?;
        subscriptions
            .queue(
                subjects::PING_CERT_MANAGER,
                groups::CERT_MANAGER,
                Arc::new(PingHandler),
            )
            .await?;
        Ok(())
    }
}

/// Dispatches `certificates.*` deliveries by subject.
pub struct CertificateHandler {
    workflow: IssuanceWorkflow,
    db: WorkerDatabase,
}

impl CertificateHandler {
    pub const fn new(workflow: IssuanceWorkflow, db: WorkerDatabase) -> Self {
        Self { workflow, db }
    }

    async fn user(&self, message: &InboundMessage) -> Outcome {
        let request: CertificateRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => return Outcome::fatal(format!("could not parse certificate request: {e}")),
        };
        match self.workflow.issue_user(&request).await {
            Ok(issued) => {
                info!(
                    username = %request.username,
                    serial = %issued.serial,
                    stage = %IssuanceStage::Acknowledged,
                    "User certificate"
                );
                Outcome::Ack
            }
            Err(failure) => {
                warn!(username = %request.username, error = %failure, "User certificate failed");
                failure_outcome(CertificateType::User, &failure)
            }
        }
    }

    async fn agent(&self, message: &InboundMessage, suffix: &str) -> Outcome {
        let request: CertificateRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => return Outcome::fatal(format!("could not parse certificate request: {e}")),
        };
        let agent_id = if request.agent_id.is_empty() {
            suffix
        } else {
            request.agent_id.as_str()
        };
        match self.workflow.issue_agent(agent_id, &request).await {
            Ok(issued) => {
                info!(
                    agent_id,
                    serial = %issued.serial,
                    stage = %IssuanceStage::Acknowledged,
                    "Agent certificate"
                );
                Outcome::Ack
            }
            Err(failure) => {
                warn!(agent_id, error = %failure, "Agent certificate failed");
                failure_outcome(CertificateType::Agent, &failure)
            }
        }
    }

    async fn revoke(&self, message: &InboundMessage) -> Outcome {
        let request: RevocationRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => return Outcome::fatal(format!("could not parse revocation request: {e}")),
        };
        if request.serial.is_empty() {
            return Outcome::fatal("revocation request without serial");
        }
        match self
            .db
            .revoke_certificate(&request.serial, request.reason, &request.info)
            .await
        {
            Ok(true) => {
                info!(serial = %request.serial, reason = request.reason, "Certificate revoked");
                Outcome::Ack
            }
            Ok(false) => {
                warn!(serial = %request.serial, "Revocation for an unknown certificate");
                Outcome::Ack
            }
            Err(e) => {
                warn!(serial = %request.serial, error = %e, "Could not record revocation");
                Outcome::RetryAfter(RETRY_PROCESSING)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CertificateHandler {
    async fn handle(&self, message: &InboundMessage) -> Outcome {
        let subject = message.subject.as_str();
        if subject == subjects::CERTIFICATES_USER {
            self.user(message).await
        } else if subject == subjects::CERTIFICATES_REVOKE {
            self.revoke(message).await
        } else if let Some(suffix) = subject.strip_prefix(subjects::CERTIFICATES_AGENT_PREFIX) {
            self.agent(message, suffix).await
        } else {
            Outcome::fatal(format!("unexpected subject {subject}"))
        }
    }
}
