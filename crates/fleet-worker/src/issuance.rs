//! Certificate issuance for console users and agents.
//!
//! Issuance runs through fixed stages:
//! `Requested -> KeyGenerated -> Encoded -> Published -> Persisted -> Acknowledged`.
//! Each stage has exactly one way to fail, and [`failure_outcome`] decides
//! whether the request is retried or dropped. The delivery is only
//! acknowledged after the certificate has been recorded, so a crash in
//! between leads to a fresh issuance that supersedes the unrecorded one.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use fleet_crypto::{
    CertificateAuthority, IssuedCertificate, SubjectTemplate, UsageProfile, Validity,
    pkcs12_bundle, zip_ca_certificate,
};
use tracing::{debug, info};

use crate::broker::Broker;
use crate::delivery::{Outcome, RETRY_PROCESSING, RETRY_UNREACHABLE};
use crate::storage::{CertificateType, NewCertificate, WorkerDatabase};
use crate::wire::{self, AgentCertificateData, Notification, subjects};

/// Common name of every agent service certificate.
pub const AGENT_COMMON_NAME: &str = "Fleet Agent Services";
/// Name of the zipped CA certificate attached to user mails.
pub const CA_ARCHIVE_NAME: &str = "ca_crt.zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceStage {
    Requested,
    KeyGenerated,
    Encoded,
    Published,
    Persisted,
    Acknowledged,
}

impl std::fmt::Display for IssuanceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::KeyGenerated => "key generation",
            Self::Encoded => "encoding",
            Self::Published => "publish",
            Self::Persisted => "persistence",
            Self::Acknowledged => "acknowledgment",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssuanceFailure {
    #[error("Malformed certificate request: {0}")]
    Malformed(String),

    #[error("Broker is not connected")]
    BrokerUnavailable,

    #[error("Certificate {stage} failed: {detail}")]
    Stage { stage: IssuanceStage, detail: String },
}

impl IssuanceFailure {
    fn at(stage: IssuanceStage, detail: impl std::fmt::Display) -> Self {
        Self::Stage {
            stage,
            detail: detail.to_string(),
        }
    }
}

/// How a failed issuance settles its delivery.
pub fn failure_outcome(kind: CertificateType, failure: &IssuanceFailure) -> Outcome {
    let retry_after = match (failure, kind) {
        (IssuanceFailure::Malformed(_), _)
        | (
            IssuanceFailure::Stage {
                stage: IssuanceStage::Encoded,
                ..
            },
            CertificateType::Agent,
        ) => return Outcome::fatal(failure),
        (IssuanceFailure::BrokerUnavailable, _)
        | (
            IssuanceFailure::Stage {
                stage: IssuanceStage::Published | IssuanceStage::Persisted,
                ..
            },
            CertificateType::Agent,
        ) => RETRY_UNREACHABLE,
        (IssuanceFailure::Stage { .. }, _) => RETRY_PROCESSING,
    };
    Outcome::RetryAfter(retry_after)
}

/// What a successful issuance produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issued {
    pub serial: String,
    /// Serials revoked because this certificate replaced them.
    pub superseded: Vec<String>,
}

pub struct IssuanceWorkflow {
    authority: Arc<dyn CertificateAuthority>,
    broker: Arc<dyn Broker>,
    db: WorkerDatabase,
    ocsp_responders: Vec<String>,
    default_password: String,
}

impl IssuanceWorkflow {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        broker: Arc<dyn Broker>,
        db: WorkerDatabase,
        ocsp_responders: Vec<String>,
        default_password: String,
    ) -> Self {
        Self {
            authority,
            broker,
            db,
            ocsp_responders,
            default_password,
        }
    }

    /// Issue a client certificate for a console user and mail it to them as a
    /// PKCS#12 bundle.
    pub async fn issue_user(
        &self,
        request: &wire::CertificateRequest,
    ) -> Result<Issued, IssuanceFailure> {
        if request.username.is_empty() {
            return Err(IssuanceFailure::Malformed("username is empty".into()));
        }
        let username = request.username.as_str();
        debug!(username, stage = %IssuanceStage::Requested, "User certificate");

        let issued = self.generate(
            subject(username, request),
            Vec::new(),
            UsageProfile::Client,
            request,
        )?;
        debug!(
            username,
            stage = %IssuanceStage::KeyGenerated,
            serial = %issued.serial,
            "User certificate"
        );

        let notification = self
            .user_notification(request, &issued)
            .map_err(|e| IssuanceFailure::at(IssuanceStage::Encoded, e))?;
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| IssuanceFailure::at(IssuanceStage::Encoded, e))?;
        debug!(username, stage = %IssuanceStage::Encoded, "User certificate");

        self.publish(subjects::SEND_CERTIFICATE, payload).await?;
        debug!(username, stage = %IssuanceStage::Published, "User certificate");

        let description = format!("{username} client certificate");
        self.db
            .record_user_certificate(
                &NewCertificate {
                    serial: &issued.serial,
                    cert_type: CertificateType::User,
                    uid: username,
                    description: &description,
                    expiry: issued.not_after.timestamp(),
                },
                &request.email,
                &request.full_name,
            )
            .await
            .map_err(|e| IssuanceFailure::at(IssuanceStage::Persisted, e))?;

        info!(username, serial = %issued.serial, "User certificate issued");
        Ok(Issued {
            serial: issued.serial,
            superseded: Vec::new(),
        })
    }

    /// Issue a service certificate for an agent and publish it to the
    /// agent. Earlier certificates of the agent are revoked.
    pub async fn issue_agent(
        &self,
        agent_id: &str,
        request: &wire::CertificateRequest,
    ) -> Result<Issued, IssuanceFailure> {
        if agent_id.is_empty() {
            return Err(IssuanceFailure::Malformed("agent id is empty".into()));
        }
        debug!(agent_id, stage = %IssuanceStage::Requested, "Agent certificate");

        let dns_name = request.dns_name.to_lowercase();
        let dns_names = if dns_name.is_empty() {
            Vec::new()
        } else {
            vec![dns_name]
        };
        let issued = self.generate(
            subject(AGENT_COMMON_NAME, request),
            dns_names,
            UsageProfile::Server,
            request,
        )?;
        debug!(
            agent_id,
            stage = %IssuanceStage::KeyGenerated,
            serial = %issued.serial,
            "Agent certificate"
        );

        let payload = serde_json::to_vec(&AgentCertificateData {
            cert_bytes: STANDARD.encode(&issued.cert_der),
            private_key_bytes: STANDARD.encode(&issued.key_der),
        })
        .map_err(|e| IssuanceFailure::at(IssuanceStage::Encoded, e))?;
        debug!(agent_id, stage = %IssuanceStage::Encoded, "Agent certificate");

        self.publish(&subjects::agent_certificate(agent_id), payload)
            .await?;
        debug!(agent_id, stage = %IssuanceStage::Published, "Agent certificate");

        let description = format!("{} agent certificate", request.dns_name);
        let superseded = self
            .db
            .rotate_agent_certificate(&NewCertificate {
                serial: &issued.serial,
                cert_type: CertificateType::Agent,
                uid: agent_id,
                description: &description,
                expiry: issued.not_after.timestamp(),
            })
            .await
            .map_err(|e| IssuanceFailure::at(IssuanceStage::Persisted, e))?;

        info!(
            agent_id,
            serial = %issued.serial,
            superseded = superseded.len(),
            "Agent certificate issued"
        );
        Ok(Issued {
            serial: issued.serial,
            superseded,
        })
    }

    fn generate(
        &self,
        subject: SubjectTemplate,
        dns_names: Vec<String>,
        usage: UsageProfile,
        request: &wire::CertificateRequest,
    ) -> Result<IssuedCertificate, IssuanceFailure> {
        self.authority
            .issue(&fleet_crypto::CertificateRequest {
                subject,
                dns_names,
                usage,
                validity: Validity {
                    years: request.years_valid,
                    months: request.months_valid,
                    days: request.days_valid,
                },
                ocsp_responders: self.ocsp_responders.clone(),
            })
            .map_err(|e| IssuanceFailure::at(IssuanceStage::KeyGenerated, e))
    }

    fn user_notification(
        &self,
        request: &wire::CertificateRequest,
        issued: &IssuedCertificate,
    ) -> Result<Notification, fleet_crypto::CertError> {
        let password = if request.password.is_empty() {
            self.default_password.as_str()
        } else {
            request.password.as_str()
        };
        let ca_pem = self.authority.ca_cert_pem();
        let bundle = pkcs12_bundle(issued, ca_pem, &request.username, password)?;
        let ca_archive = zip_ca_certificate(ca_pem)?;

        Ok(Notification {
            to: request.email.clone(),
            subject: "Your certificate to log in to the fleet console".into(),
            message_title: "Fleet | Your certificate".into(),
            message_text: "You can find attached the certificate in PKCS#12 format that you must \
                           import into your browser to log in to the console. You may also need \
                           to import the zipped CA certificate as a trusted root authority."
                .into(),
            message_greeting: format!("Hi {}", request.full_name),
            message_action: "Go to console".into(),
            message_action_url: request.console_url.clone(),
            message_attach_file_name: format!("{}.pfx", request.username),
            message_attach_file: STANDARD.encode(bundle),
            message_attach_file_name2: CA_ARCHIVE_NAME.into(),
            message_attach_file2: STANDARD.encode(ca_archive),
            ..Notification::default()
        })
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), IssuanceFailure> {
        if !self.broker.is_connected() {
            return Err(IssuanceFailure::BrokerUnavailable);
        }
        self.broker
            .publish(subject, Bytes::from(payload))
            .await
            .map_err(|e| IssuanceFailure::at(IssuanceStage::Published, e))
    }
}

fn subject(common_name: &str, request: &wire::CertificateRequest) -> SubjectTemplate {
    let attribute = |value: &str| (!value.is_empty()).then(|| value.to_string());
    SubjectTemplate {
        common_name: common_name.to_string(),
        organization: attribute(&request.organization),
        country: attribute(&request.country),
        province: attribute(&request.province),
        locality: attribute(&request.locality),
        street_address: attribute(&request.address),
        postal_code: attribute(&request.postal_code),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use fleet_crypto::{LocalAuthority, generate_ca};

    async fn workflow(broker: &InMemoryBroker) -> (IssuanceWorkflow, WorkerDatabase) {
        let ca = generate_ca("Fleet Test").unwrap();
        let authority = LocalAuthority::from_pem(&ca.ca_cert_pem, &ca.ca_key_pem).unwrap();
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let workflow = IssuanceWorkflow::new(
            Arc::new(authority),
            Arc::new(broker.clone()),
            db.clone(),
            vec!["http://ocsp.fleet.test:8000".into()],
            "changeit".into(),
        );
        (workflow, db)
    }

    fn agent_request() -> wire::CertificateRequest {
        wire::CertificateRequest {
            agent_id: "agent-7".into(),
            dns_name: "PC-07.fleet.test".into(),
            organization: "Fleet".into(),
            country: "ES".into(),
            years_valid: 1,
            ..wire::CertificateRequest::default()
        }
    }

    fn user_request() -> wire::CertificateRequest {
        wire::CertificateRequest {
            username: "ana".into(),
            email: "ana@example.com".into(),
            full_name: "Ana Pérez".into(),
            console_url: "https://console.fleet.test".into(),
            organization: "Fleet".into(),
            years_valid: 1,
            ..wire::CertificateRequest::default()
        }
    }

    #[test]
    fn failure_outcomes_follow_stage_and_principal() {
        let stage = |stage| IssuanceFailure::at(stage, "boom");
        let agent = CertificateType::Agent;
        let user = CertificateType::User;

        assert!(matches!(
            failure_outcome(agent, &IssuanceFailure::Malformed("x".into())),
            Outcome::Fatal(_)
        ));
        assert_eq!(
            failure_outcome(agent, &stage(IssuanceStage::KeyGenerated)),
            Outcome::RetryAfter(RETRY_PROCESSING)
        );
        assert!(matches!(
            failure_outcome(agent, &stage(IssuanceStage::Encoded)),
            Outcome::Fatal(_)
        ));
        assert_eq!(
            failure_outcome(user, &stage(IssuanceStage::Encoded)),
            Outcome::RetryAfter(RETRY_PROCESSING)
        );
        assert_eq!(
            failure_outcome(user, &IssuanceFailure::BrokerUnavailable),
            Outcome::RetryAfter(RETRY_UNREACHABLE)
        );
        assert_eq!(
            failure_outcome(agent, &stage(IssuanceStage::Published)),
            Outcome::RetryAfter(RETRY_UNREACHABLE)
        );
        assert_eq!(
            failure_outcome(user, &stage(IssuanceStage::Published)),
            Outcome::RetryAfter(RETRY_PROCESSING)
        );
        assert_eq!(
            failure_outcome(agent, &stage(IssuanceStage::Persisted)),
            Outcome::RetryAfter(RETRY_UNREACHABLE)
        );
        assert_eq!(
            failure_outcome(user, &stage(IssuanceStage::Persisted)),
            Outcome::RetryAfter(RETRY_PROCESSING)
        );
    }

    #[tokio::test]
    async fn agent_certificate_is_published_and_recorded() {
        let broker = InMemoryBroker::new();
        let (workflow, db) = workflow(&broker).await;

        let issued = workflow.issue_agent("agent-7", &agent_request()).await.unwrap();

        let published = broker.published_to("agent.certificate.agent-7").await;
        assert_eq!(published.len(), 1);
        let data: AgentCertificateData = serde_json::from_slice(&published[0]).unwrap();
        let der = STANDARD.decode(data.cert_bytes).unwrap();
        let cert = openssl::x509::X509::from_der(&der).unwrap();
        let names: Vec<String> = cert
            .subject_alt_names()
            .expect("SAN")
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["pc-07.fleet.test"]);

        let record = db.get_certificate(&issued.serial).await.unwrap().expect("recorded");
        assert_eq!(record.uid, "agent-7");
        assert_eq!(record.description, "PC-07.fleet.test agent certificate");
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn reissuing_revokes_the_previous_agent_certificate() {
        let broker = InMemoryBroker::new();
        let (workflow, db) = workflow(&broker).await;

        let first = workflow.issue_agent("agent-7", &agent_request()).await.unwrap();
        let second = workflow.issue_agent("agent-7", &agent_request()).await.unwrap();

        assert_eq!(second.superseded, vec![first.serial.clone()]);
        let active: Vec<_> = db
            .certificates_for(CertificateType::Agent, "agent-7")
            .await
            .unwrap()
            .into_iter()
            .filter(|c| !c.revoked)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].serial, second.serial);
        assert!(db.get_revocation(&first.serial).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disconnected_broker_stops_before_persistence() {
        let broker = InMemoryBroker::new();
        broker.set_connected(false);
        let (workflow, db) = workflow(&broker).await;

        let err = workflow.issue_agent("agent-7", &agent_request()).await.unwrap_err();
        assert_eq!(err, IssuanceFailure::BrokerUnavailable);
        assert!(db
            .certificates_for(CertificateType::Agent, "agent-7")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn user_certificate_is_mailed_and_user_marked_served() {
        let broker = InMemoryBroker::new();
        let (workflow, db) = workflow(&broker).await;

        let issued = workflow.issue_user(&user_request()).await.unwrap();

        let published = broker.published_to(subjects::SEND_CERTIFICATE).await;
        assert_eq!(published.len(), 1);
        let notification: Notification = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(notification.to, "ana@example.com");
        assert_eq!(notification.message_attach_file_name, "ana.pfx");
        assert_eq!(notification.message_attach_file_name2, CA_ARCHIVE_NAME);
        assert_eq!(notification.message_greeting, "Hi Ana Pérez");

        let bundle = STANDARD.decode(&notification.message_attach_file).unwrap();
        let parsed = openssl::pkcs12::Pkcs12::from_der(&bundle)
            .unwrap()
            .parse2("changeit")
            .unwrap();
        assert!(parsed.cert.is_some());

        let user = db.get_user("ana").await.unwrap().expect("user");
        assert!(user.cert_sent);
        assert!(user.email_verified);
        let record = db.get_certificate(&issued.serial).await.unwrap().expect("cert");
        assert_eq!(record.description, "ana client certificate");
    }

    #[tokio::test]
    async fn publish_failure_is_reported_at_the_publish_stage() {
        let broker = InMemoryBroker::new();
        broker.fail_publishes(true);
        let (workflow, _db) = workflow(&broker).await;

        let err = workflow.issue_user(&user_request()).await.unwrap_err();
        assert!(matches!(
            err,
            IssuanceFailure::Stage {
                stage: IssuanceStage::Published,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn request_without_username_is_malformed() {
        let broker = InMemoryBroker::new();
        let (workflow, _db) = workflow(&broker).await;
        let mut request = user_request();
        request.username.clear();
        assert!(matches!(
            workflow.issue_user(&request).await,
            Err(IssuanceFailure::Malformed(_))
        ));
    }
}
