//! Applying agent reports to the store.
//!
//! A report carries the full current inventory of one agent. Applying it
//! twice, or applying an older report after a newer one, must leave the
//! store consistent: the parent record is reconciled field by field, and
//! every collection is replaced wholesale in its own transaction.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{
    Agent, AgentStatus, Antivirus, App, ChildRecord, Computer, DatabaseError, LogicalDisk,
    MemorySlot, Monitor, NetworkAdapter, OperatingSystem, Printer, Release, Share, SystemUpdate,
    Update, WorkerDatabase, update_status,
};

/// Update-task status strings as reported by agents.
pub mod reported_status {
    pub const SUCCESS: &str = "admin.update.agents.task_status_success";
    pub const ERROR: &str = "admin.update.agents.task_status_error";
}

/// Everything one agent reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetReport {
    pub agent_id: String,
    pub os: String,
    pub hostname: String,
    pub ip: String,
    pub mac_address: String,
    pub enabled: bool,
    pub vnc_proxy_port: String,
    pub sftp_port: String,
    pub certificate_ready: bool,
    pub sftp_service_disabled: bool,
    pub remote_assistance_disabled: bool,
    pub debug_mode: bool,
    pub last_update_task_status: String,
    pub last_update_task_result: String,
    pub last_update_task_execution_time: Option<DateTime<Utc>>,

    pub computer: Computer,
    pub operating_system: OperatingSystem,
    pub antivirus: Antivirus,
    pub system_update: SystemUpdate,
    pub release: Release,

    pub applications: Vec<App>,
    pub monitors: Vec<Monitor>,
    pub memory_slots: Vec<MemorySlot>,
    pub logical_disks: Vec<LogicalDisk>,
    pub printers: Vec<Printer>,
    pub network_adapters: Vec<NetworkAdapter>,
    pub shares: Vec<Share>,
    pub updates: Vec<Update>,
}

/// Compute the agent record to persist for `report`.
///
/// Administrative state wins over the report: an agent waiting for
/// admission stays there, and the targeted update version is never
/// touched. Update-task results are only taken from reports newer than the
/// last accepted one.
pub fn reconcile_agent(
    existing: Option<Agent>,
    report: &FleetReport,
    auto_admit: bool,
    is_remote: bool,
    now: i64,
) -> Agent {
    let mut agent = match existing {
        Some(existing) => {
            let mut agent = existing;
            if agent.status() != Some(AgentStatus::WaitingForAdmission) {
                let status = if report.enabled {
                    AgentStatus::Enabled
                } else {
                    AgentStatus::Disabled
                };
                agent.agent_status = status.as_str().to_string();
            }
            reconcile_update_task(&mut agent, report);
            agent
        }
        None => {
            let status = if auto_admit {
                AgentStatus::Enabled
            } else {
                AgentStatus::WaitingForAdmission
            };
            Agent::first_seen(&report.agent_id, status, now)
        }
    };

    agent.os.clone_from(&report.os);
    agent.hostname.clone_from(&report.hostname);
    agent.ip_address.clone_from(&report.ip);
    agent.mac_address.clone_from(&report.mac_address);
    agent.vnc_proxy_port.clone_from(&report.vnc_proxy_port);
    agent.sftp_port.clone_from(&report.sftp_port);
    agent.certificate_ready = report.certificate_ready;
    agent.sftp_service = !report.sftp_service_disabled;
    agent.remote_assistance = !report.remote_assistance_disabled;
    agent.debug_mode = report.debug_mode;
    agent.is_remote = is_remote;
    agent.last_contact = now;
    agent
}

fn reconcile_update_task(agent: &mut Agent, report: &FleetReport) {
    let Some(executed) = report.last_update_task_execution_time else {
        return;
    };
    let executed = executed.timestamp();
    if executed <= agent.update_task_execution {
        return;
    }

    agent.update_task_execution = executed;
    if agent.update_task_version == report.release.version {
        match report.last_update_task_status.as_str() {
            reported_status::SUCCESS => {
                agent.update_task_status = update_status::SUCCESS.to_string();
                agent.update_task_result.clear();
            }
            reported_status::ERROR => {
                agent.update_task_status = update_status::ERROR.to_string();
                agent
                    .update_task_result
                    .clone_from(&report.last_update_task_result);
            }
            _ => {}
        }
    } else {
        agent.update_task_status = update_status::ERROR.to_string();
        if !report.last_update_task_result.is_empty() {
            agent
                .update_task_result
                .clone_from(&report.last_update_task_result);
        }
    }
}

/// Name resolution used to tell local agents from remote ones.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver.
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addresses = tokio::net::lookup_host((host, 0)).await?;
        Ok(addresses.map(|a| a.ip()).collect())
    }
}

/// DNS suffix of the first broker server: `nats.example.com:4433` gives
/// `.example.com`. `None` when the server name has no domain part.
pub fn broker_domain(servers: &[String]) -> Option<String> {
    let first = servers.first()?;
    let host = first.split_once("://").map_or(first.as_str(), |(_, rest)| rest);
    let host = host.split(':').next().unwrap_or_default();
    let (_, domain) = host.split_once('.')?;
    if domain.is_empty() {
        return None;
    }
    Some(format!(".{domain}"))
}

/// Which sub-steps of an apply failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub agent: Option<Agent>,
    pub failed_steps: Vec<&'static str>,
}

impl ApplySummary {
    pub fn is_complete(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

pub struct ReportApplier {
    db: WorkerDatabase,
    resolver: Arc<dyn HostResolver>,
    broker_domain: Option<String>,
}

impl ReportApplier {
    pub fn new(
        db: WorkerDatabase,
        resolver: Arc<dyn HostResolver>,
        broker_domain: Option<String>,
    ) -> Self {
        Self {
            db,
            resolver,
            broker_domain,
        }
    }

    /// Apply `report`. Fails only when the agent record itself cannot be
    /// written; other failures are logged and listed in the summary.
    pub async fn apply(
        &self,
        report: &FleetReport,
        auto_admit: bool,
    ) -> Result<ApplySummary, DatabaseError> {
        let agent_id = report.agent_id.as_str();
        let is_remote = self.is_remote(report).await;
        let now = fleet_core::db::unix_timestamp();

        let agent = self
            .db
            .upsert_agent_with(agent_id, |existing| {
                reconcile_agent(existing, report, auto_admit, is_remote, now)
            })
            .await?;

        let mut summary = ApplySummary {
            agent: Some(agent),
            failed_steps: Vec::new(),
        };

        self.section(&mut summary, agent_id, &report.computer).await;
        self.section(&mut summary, agent_id, &report.operating_system).await;
        self.section(&mut summary, agent_id, &report.antivirus).await;
        self.section(&mut summary, agent_id, &report.system_update).await;

        self.replace(&mut summary, agent_id, &report.applications).await;
        self.replace(&mut summary, agent_id, &report.monitors).await;
        self.replace(&mut summary, agent_id, &report.memory_slots).await;
        self.replace(&mut summary, agent_id, &report.logical_disks).await;
        self.replace(&mut summary, agent_id, &report.printers).await;
        self.replace(&mut summary, agent_id, &report.network_adapters).await;
        self.replace(&mut summary, agent_id, &report.shares).await;
        self.replace(&mut summary, agent_id, &report.updates).await;

        if !report.release.version.is_empty() {
            match self.db.link_release(agent_id, &report.release).await {
                Ok(release_id) => {
                    if let Some(agent) = summary.agent.as_mut() {
                        agent.release_id = Some(release_id);
                    }
                }
                Err(e) => {
                    warn!(agent_id, error = %e, "Could not save release info");
                    summary.failed_steps.push("release");
                }
            }
        }

        debug!(agent_id, failed = summary.failed_steps.len(), "Report applied");
        Ok(summary)
    }

    async fn section<C: ChildRecord>(
        &self,
        summary: &mut ApplySummary,
        agent_id: &str,
        section: &C,
    ) {
        if let Err(e) = self.db.upsert_section(agent_id, section).await {
            warn!(agent_id, table = C::TABLE, error = %e, "Could not save report section");
            summary.failed_steps.push(C::TABLE);
        }
    }

    async fn replace<C: ChildRecord>(
        &self,
        summary: &mut ApplySummary,
        agent_id: &str,
        children: &[C],
    ) {
        if let Err(e) = self.db.replace_children(agent_id, children).await {
            warn!(agent_id, table = C::TABLE, error = %e, "Could not replace inventory");
            summary.failed_steps.push(C::TABLE);
        }
    }

    /// IPv4 agents whose DNS name does not resolve to the reported address
    /// are remote. Anything that cannot be checked counts as local.
    async fn is_remote(&self, report: &FleetReport) -> bool {
        let Ok(IpAddr::V4(ip)) = report.ip.parse::<IpAddr>() else {
            return false;
        };
        let Some(domain) = &self.broker_domain else {
            return false;
        };
        let host = format!("{}{domain}", report.hostname.to_lowercase());
        match self.resolver.lookup(&host).await {
            Ok(addresses) => !addresses.contains(&IpAddr::V4(ip)),
            Err(e) => {
                warn!(%host, error = %e, "Could not look up agent host");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StaticResolver {
        hosts: HashMap<String, Vec<IpAddr>>,
        asked: Mutex<Vec<String>>,
    }

    impl StaticResolver {
        fn new(hosts: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                hosts: hosts
                    .iter()
                    .map(|(h, ip)| ((*h).to_string(), vec![ip.parse().unwrap()]))
                    .collect(),
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
            self.asked.lock().unwrap().push(host.to_string());
            self.hosts
                .get(host)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, host.to_string()))
        }
    }

    fn report(agent_id: &str) -> FleetReport {
        FleetReport {
            agent_id: agent_id.into(),
            os: "windows".into(),
            hostname: "PC-01".into(),
            ip: "10.0.0.5".into(),
            enabled: true,
            release: Release {
                version: "1.2.0".into(),
                channel: "stable".into(),
                os: "windows".into(),
                arch: "amd64".into(),
            },
            ..FleetReport::default()
        }
    }

    fn app(name: &str) -> App {
        App {
            name: name.into(),
            version: "1".into(),
            ..App::default()
        }
    }

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(secs, 0)
    }

    #[test]
    fn first_report_waits_for_admission() {
        let agent = reconcile_agent(None, &report("A1"), false, false, 100);
        assert_eq!(agent.status(), Some(AgentStatus::WaitingForAdmission));
        assert_eq!(agent.first_contact, 100);
        assert_eq!(agent.last_contact, 100);
    }

    #[test]
    fn first_report_with_auto_admit_is_enabled() {
        let agent = reconcile_agent(None, &report("A1"), true, false, 100);
        assert_eq!(agent.status(), Some(AgentStatus::Enabled));
    }

    #[test]
    fn waiting_agents_are_not_admitted_by_reports() {
        let existing = Agent::first_seen("A1", AgentStatus::WaitingForAdmission, 1);
        let mut r = report("A1");
        r.enabled = false;
        let agent = reconcile_agent(Some(existing), &r, true, false, 50);
        assert_eq!(agent.status(), Some(AgentStatus::WaitingForAdmission));
        assert_eq!(agent.first_contact, 1);
    }

    #[test]
    fn admitted_agents_follow_the_enabled_flag() {
        let existing = Agent::first_seen("A1", AgentStatus::Enabled, 1);
        let mut r = report("A1");
        r.enabled = false;
        let agent = reconcile_agent(Some(existing), &r, false, false, 50);
        assert_eq!(agent.status(), Some(AgentStatus::Disabled));
    }

    #[test]
    fn administrative_fields_survive() {
        let mut existing = Agent::first_seen("A1", AgentStatus::Enabled, 1);
        existing.nickname = "Front desk".into();
        existing.update_task_description = "Upgrade to 1.2.0".into();
        let agent = reconcile_agent(Some(existing), &report("A1"), false, true, 50);
        assert_eq!(agent.nickname, "Front desk");
        assert_eq!(agent.update_task_description, "Upgrade to 1.2.0");
        assert!(agent.is_remote);
        assert_eq!(agent.hostname, "PC-01");
    }

    #[test]
    fn successful_update_of_targeted_version_clears_result() {
        let mut existing = Agent::first_seen("A1", AgentStatus::Enabled, 1);
        existing.update_task_version = "1.2.0".into();
        existing.update_task_result = "old failure".into();
        let mut r = report("A1");
        r.last_update_task_status = reported_status::SUCCESS.into();
        r.last_update_task_execution_time = at(200);

        let agent = reconcile_agent(Some(existing), &r, false, false, 300);
        assert_eq!(agent.update_task_status, update_status::SUCCESS);
        assert!(agent.update_task_result.is_empty());
        assert_eq!(agent.update_task_execution, 200);
        assert_eq!(agent.update_task_version, "1.2.0");
    }

    #[test]
    fn version_mismatch_is_an_error() {
        let mut existing = Agent::first_seen("A1", AgentStatus::Enabled, 1);
        existing.update_task_version = "1.3.0".into();
        let mut r = report("A1");
        r.last_update_task_status = reported_status::SUCCESS.into();
        r.last_update_task_result = "installer exited 1603".into();
        r.last_update_task_execution_time = at(200);

        let agent = reconcile_agent(Some(existing), &r, false, false, 300);
        assert_eq!(agent.update_task_status, update_status::ERROR);
        assert_eq!(agent.update_task_result, "installer exited 1603");
    }

    #[test]
    fn stale_update_results_are_ignored() {
        let mut existing = Agent::first_seen("A1", AgentStatus::Enabled, 1);
        existing.update_task_version = "1.2.0".into();
        existing.update_task_status = update_status::SUCCESS.into();
        existing.update_task_execution = 500;
        let mut r = report("A1");
        r.last_update_task_status = reported_status::ERROR.into();
        r.last_update_task_result = "boom".into();
        r.last_update_task_execution_time = at(500);

        let agent = reconcile_agent(Some(existing), &r, false, false, 600);
        assert_eq!(agent.update_task_status, update_status::SUCCESS);
        assert!(agent.update_task_result.is_empty());
        assert_eq!(agent.update_task_execution, 500);
    }

    #[test]
    fn broker_domain_drops_first_label_and_port() {
        assert_eq!(
            broker_domain(&["nats.example.com:4433".into()]).as_deref(),
            Some(".example.com")
        );
        assert_eq!(
            broker_domain(&["tls://mq.corp.local:4222".into(), "other:1".into()]).as_deref(),
            Some(".corp.local")
        );
        assert_eq!(broker_domain(&["localhost:4222".into()]), None);
        assert_eq!(broker_domain(&[]), None);
    }

    #[tokio::test]
    async fn remote_detection_uses_dns() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let resolver = StaticResolver::new(&[("pc-01.example.com", "10.0.0.5")]);
        let applier = ReportApplier::new(db, resolver.clone(), Some(".example.com".into()));

        let local = report("A1");
        assert!(!applier.is_remote(&local).await);

        let mut moved = report("A1");
        moved.ip = "192.168.1.20".into();
        assert!(applier.is_remote(&moved).await);

        let mut v6 = report("A1");
        v6.ip = "fe80::1".into();
        assert!(!applier.is_remote(&v6).await);

        let mut unknown = report("A1");
        unknown.hostname = "LAPTOP".into();
        assert!(!applier.is_remote(&unknown).await);

        assert_eq!(
            *resolver.asked.lock().unwrap(),
            vec!["pc-01.example.com", "pc-01.example.com", "laptop.example.com"]
        );
    }

    #[tokio::test]
    async fn apply_replaces_collections_and_links_release() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let applier = ReportApplier::new(db.clone(), Arc::new(DnsResolver), None);

        let mut first = report("A1");
        first.applications = vec![app("a"), app("b"), app("c")];
        let summary = applier.apply(&first, false).await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(db.count_children::<App>("A1").await.unwrap(), 3);

        let mut second = report("A1");
        second.applications = vec![app("d")];
        let summary = applier.apply(&second, false).await.unwrap();
        assert!(summary.is_complete());

        let apps = db.list_apps("A1").await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "d");

        let stored = db.get_agent("A1").await.unwrap().expect("agent");
        assert!(stored.release_id.is_some());
        assert_eq!(stored.status(), Some(AgentStatus::WaitingForAdmission));
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let applier = ReportApplier::new(db.clone(), Arc::new(DnsResolver), None);

        let mut r = report("A1");
        r.applications = vec![app("a"), app("b")];
        r.monitors = vec![Monitor {
            model: "U2720Q".into(),
            ..Monitor::default()
        }];
        applier.apply(&r, true).await.unwrap();
        let first = db.get_agent("A1").await.unwrap().expect("agent");
        applier.apply(&r, true).await.unwrap();
        let second = db.get_agent("A1").await.unwrap().expect("agent");

        assert_eq!(db.count_children::<App>("A1").await.unwrap(), 2);
        assert_eq!(db.count_children::<Monitor>("A1").await.unwrap(), 1);
        assert_eq!(first.agent_status, second.agent_status);
        assert_eq!(first.first_contact, second.first_contact);
        assert_eq!(first.release_id, second.release_id);
    }
}
