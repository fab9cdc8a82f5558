//! Data models for fleet worker storage.
//!
//! Inventory sections double as the wire format of agent reports: what an
//! agent sends is exactly what gets stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent record from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub id: String,
    pub os: String,
    pub hostname: String,
    pub ip_address: String,
    pub mac_address: String,
    pub vnc_proxy_port: String,
    pub sftp_port: String,
    pub certificate_ready: bool,
    pub sftp_service: bool,
    pub remote_assistance: bool,
    pub debug_mode: bool,
    pub is_remote: bool,
    pub agent_status: String,
    pub first_contact: i64,
    pub last_contact: i64,
    pub update_task_description: String,
    pub update_task_status: String,
    pub update_task_result: String,
    pub update_task_execution: i64,
    pub update_task_version: String,
    pub release_id: Option<i64>,
    pub nickname: String,
    pub description: String,
}

impl Agent {
    /// A blank record for an agent that has never reported before.
    pub fn first_seen(id: &str, status: AgentStatus, now: i64) -> Self {
        Self {
            id: id.to_string(),
            os: String::new(),
            hostname: String::new(),
            ip_address: String::new(),
            mac_address: String::new(),
            vnc_proxy_port: String::new(),
            sftp_port: String::new(),
            certificate_ready: false,
            sftp_service: false,
            remote_assistance: false,
            debug_mode: false,
            is_remote: false,
            agent_status: status.as_str().to_string(),
            first_contact: now,
            last_contact: now,
            update_task_description: String::new(),
            update_task_status: String::new(),
            update_task_result: String::new(),
            update_task_execution: 0,
            update_task_version: String::new(),
            release_id: None,
            nickname: String::new(),
            description: String::new(),
        }
    }

    pub fn status(&self) -> Option<AgentStatus> {
        AgentStatus::parse(&self.agent_status)
    }
}

/// Administrative state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    WaitingForAdmission,
    Enabled,
    Disabled,
}

impl AgentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForAdmission => "WaitingForAdmission",
            Self::Enabled => "Enabled",
            Self::Disabled => "Disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WaitingForAdmission" => Some(Self::WaitingForAdmission),
            "Enabled" => Some(Self::Enabled),
            "Disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Update-task status values shared with the console.
pub mod update_status {
    pub const SUCCESS: &str = "Success";
    pub const ERROR: &str = "Error";
}

// =========================================================================
// Single-valued inventory sections
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Computer {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub memory: i64,
    pub processor: String,
    pub processor_arch: String,
    pub processor_cores: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatingSystem {
    pub os_type: String,
    pub version: String,
    pub description: String,
    pub edition: String,
    pub install_date: Option<DateTime<Utc>>,
    pub arch: String,
    pub username: String,
    pub last_bootup_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Antivirus {
    pub name: String,
    pub is_active: bool,
    pub is_updated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemUpdate {
    pub status: String,
    pub last_install: Option<DateTime<Utc>>,
    pub last_search: Option<DateTime<Utc>>,
    pub pending_updates: bool,
}

// =========================================================================
// Child collections
// =========================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(default)]
pub struct App {
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub install_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Monitor {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub week_of_manufacture: String,
    pub year_of_manufacture: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySlot {
    pub slot: String,
    pub size: String,
    pub memory_type: String,
    pub serial_number: String,
    pub part_number: String,
    pub speed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicalDisk {
    pub label: String,
    pub usage: i64,
    pub filesystem: String,
    pub size_in_units: String,
    pub remaining_space_in_units: String,
    pub volume_name: String,
    pub bitlocker_status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Printer {
    pub name: String,
    pub port: String,
    pub is_default: bool,
    pub is_network: bool,
    pub is_shared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkAdapter {
    pub name: String,
    pub mac_address: String,
    pub addresses: String,
    pub subnet: String,
    pub default_gateway: String,
    pub dns_servers: String,
    pub dns_domain: String,
    pub dhcp_enabled: bool,
    pub dhcp_lease_obtained: Option<DateTime<Utc>>,
    pub dhcp_lease_expired: Option<DateTime<Utc>>,
    pub speed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Share {
    pub name: String,
    pub description: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Update {
    pub title: String,
    pub installed_at: Option<DateTime<Utc>>,
    pub support_url: String,
}

/// Agent build the report was produced by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Release {
    pub version: String,
    pub channel: String,
    pub os: String,
    pub arch: String,
}

// =========================================================================
// Deployments, certificates, users, settings
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deployment {
    pub agent_id: String,
    pub package_id: String,
    pub name: String,
    pub version: String,
    pub installed: i64,
    pub updated: i64,
    /// Installed by a WinGet configuration profile rather than on request.
    pub by_profile: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PackageExclusion {
    pub agent_id: String,
    pub package_id: String,
    pub excluded_at: i64,
}

/// Last failure of a configuration profile on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileIssue {
    pub profile_id: i64,
    pub agent_id: String,
    pub error: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    User,
    Agent,
}

impl CertificateType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for CertificateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CertificateRecord {
    pub serial: String,
    pub cert_type: String,
    pub uid: String,
    pub description: String,
    pub expiry: i64,
    pub revoked: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Revocation {
    pub serial: String,
    pub reason: i64,
    pub info: String,
    pub expiry: i64,
    pub revoked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
    pub cert_sent: bool,
    pub created_at: i64,
}

/// Global settings row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Settings {
    pub auto_admit_agents: bool,
    pub agent_report_frequency_mins: i64,
    pub smtp_server: String,
    pub smtp_port: i64,
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_auth: String,
    pub smtp_tls: bool,
    pub message_from: String,
}

/// Identity a worker records about itself once the database is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServerIdentity {
    pub hostname: String,
    pub arch: String,
    pub os: String,
    pub version: String,
    pub channel: String,
}

impl ServerIdentity {
    /// Identity of the running process.
    pub fn current(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            channel: if env!("CARGO_PKG_VERSION").contains('-') {
                "testing".to_string()
            } else {
                "stable".to_string()
            },
        }
    }
}
