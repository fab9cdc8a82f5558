//! Subjects and JSON payloads exchanged with agents, the console and the
//! other workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod subjects {
    pub const REPORT: &str = "report";
    pub const DEPLOY_RESULT: &str = "deployresult";
    pub const AGENT_CONFIG: &str = "agentconfig";

    pub const PROFILE_DEPLOY: &str = "wingetcfg.deploy";
    pub const PROFILE_EXCLUDE: &str = "wingetcfg.exclude";
    pub const PROFILE_REPORT: &str = "wingetcfg.report";

    pub const PING_AGENTS: &str = "ping.agentworker";
    pub const PING_CERT_MANAGER: &str = "ping.certmanagerworker";
    pub const PING_NOTIFICATIONS: &str = "ping.notificationworker";

    pub const CERTIFICATES_USER: &str = "certificates.user";
    pub const CERTIFICATES_REVOKE: &str = "certificates.revoke";
    pub const CERTIFICATES_AGENT: &str = "certificates.agent.*";
    /// Prefix of per-agent certificate requests; the agent id follows it.
    pub const CERTIFICATES_AGENT_PREFIX: &str = "certificates.agent.";

    pub const CONFIRM_EMAIL: &str = "notification.confirm_email";
    pub const SEND_CERTIFICATE: &str = "notification.send_certificate";
    pub const RELOAD_SETTINGS: &str = "notification.reload_settings";

    /// Where an agent picks up its certificate.
    pub fn agent_certificate(agent_id: &str) -> String {
        format!("agent.certificate.{agent_id}")
    }
}

pub mod streams {
    pub const CERT_MANAGER: &str = "CERT_MANAGER_STREAM";
    pub const NOTIFICATIONS: &str = "NOTIFICATION_STREAM";
}

pub mod groups {
    pub const AGENTS: &str = "fleet-agents";
    pub const CERT_MANAGER: &str = "fleet-cert-manager";
    pub const NOTIFICATIONS: &str = "fleet-notifications";
}

/// An e-mail to be sent by the notification worker. Attachments are base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notification {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub message_title: String,
    pub message_text: String,
    pub message_greeting: String,
    pub message_action: String,
    pub message_action_url: String,
    pub message_attach_file_name: String,
    pub message_attach_file: String,
    pub message_attach_file_name2: String,
    pub message_attach_file2: String,
}

/// Certificate request from the console (`certificates.user`) or on behalf
/// of an agent (`certificates.agent.<id>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateRequest {
    pub agent_id: String,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password: String,
    pub console_url: String,
    pub dns_name: String,
    pub organization: String,
    pub country: String,
    pub province: String,
    pub locality: String,
    pub address: String,
    pub postal_code: String,
    pub years_valid: u32,
    pub months_valid: u32,
    pub days_valid: u32,
}

/// Certificate material published to an agent, DER encoded then base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCertificateData {
    pub cert_bytes: String,
    pub private_key_bytes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    Install,
    Update,
    Uninstall,
}

/// Outcome of a package operation reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAction {
    pub agent_id: String,
    pub package_id: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub package_version: String,
    pub action: DeployKind,
    pub when: DateTime<Utc>,
}

/// Result of applying a WinGet configuration profile on an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileReport {
    pub profile_id: i64,
    pub agent_id: String,
    pub success: bool,
    pub error: String,
}

/// Reply to `agentconfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_frequency: i64,
    pub ok: bool,
}

/// Bookkeeping request for `certificates.revoke`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationRequest {
    pub serial: String,
    pub reason: i64,
    pub info: String,
}
