//! Agents worker: inventory reports, deployment results, agent config and
//! WinGet configuration profile results.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::PingHandler;
use crate::bootstrap::{Subscriber, WorkerContext};
use crate::broker::InboundMessage;
use crate::delivery::{MessageHandler, Outcome, SubscriptionSet};
use crate::error::WorkerError;
use crate::report::{FleetReport, HostResolver, ReportApplier};
use crate::storage::WorkerDatabase;
use crate::wire::{AgentConfig, DeployAction, DeployKind, ProfileReport, groups, subjects};

pub const REPORT_RECEIVED: &str = "Report received!";

pub struct AgentsWorker {
    resolver: Arc<dyn HostResolver>,
    broker_domain: Option<String>,
}

impl AgentsWorker {
    /// `broker_domain` is the DNS suffix used to decide whether an agent is
    /// remote; see [`crate::report::broker_domain`].
    pub fn new(resolver: Arc<dyn HostResolver>, broker_domain: Option<String>) -> Self {
        Self {
            resolver,
            broker_domain,
        }
    }
}

#[async_trait]
impl Subscriber for AgentsWorker {
    async fn subscribe(
        &self,
        context: &WorkerContext,
        subscriptions: &SubscriptionSet,
    ) -> Result<(), WorkerError> {
        let applier = ReportApplier::new(
            context.db.clone(),
            Arc::clone(&self.resolver),
            self.broker_domain.clone(),
        );
        subscriptions
            .queue(
                subjects::REPORT,
                groups::AGENTS,
                Arc::new(ReportHandler {
                    db: context.db.clone(),
                    applier,
                }),
            )
            .await?;
        subscriptions
            .queue(
                subjects::DEPLOY_RESULT,
                groups::AGENTS,
                Arc::new(DeployResultHandler::new(context.db.clone())),
            )
            .await?;
        subscriptions
            .queue(subjects::PING_AGENTS, groups::AGENTS, Arc::new(PingHandler))
            .await?;
        subscriptions
            .queue(
                subjects::AGENT_CONFIG,
                groups::AGENTS,
                Arc::new(AgentConfigHandler {
                    db: context.db.clone(),
                }),
            )
            .await?;
        subscriptions
            .queue(
                subjects::PROFILE_DEPLOY,
                groups::AGENTS,
                Arc::new(DeployResultHandler::from_profiles(context.db.clone())),
            )
            .await?;
        subscriptions
            .queue(
                subjects::PROFILE_EXCLUDE,
                groups::AGENTS,
                Arc::new(ExclusionHandler {
                    db: context.db.clone(),
                }),
            )
            .await?;
        subscriptions
            .queue(
                subjects::PROFILE_REPORT,
                groups::AGENTS,
                Arc::new(ProfileReportHandler {
                    db: context.db.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}

pub struct ReportHandler {
    db: WorkerDatabase,
    applier: ReportApplier,
}

impl ReportHandler {
    pub const fn new(db: WorkerDatabase, applier: ReportApplier) -> Self {
        Self { db, applier }
    }
}

#[async_trait]
impl MessageHandler for ReportHandler {
    async fn handle(&self, message: &InboundMessage) -> Outcome {
        let report: FleetReport = match serde_json::from_slice(&message.payload) {
            Ok(report) => report,
            Err(e) => return Outcome::fatal(format!("could not parse agent report: {e}")),
        };
        if report.agent_id.is_empty() {
            return Outcome::fatal("agent report without agent id");
        }

        let auto_admit = match self.db.get_settings().await {
            Ok(settings) => settings.auto_admit_agents,
            Err(e) => {
                warn!(error = %e, "Could not read settings, agents will wait for admission");
                false
            }
        };

        match self.applier.apply(&report, auto_admit).await {
            Ok(summary) => {
                if !summary.is_complete() {
                    warn!(
                        agent_id = %report.agent_id,
                        failed = ?summary.failed_steps,
                        "Report partially applied"
                    );
                }
                Outcome::reply(REPORT_RECEIVED)
            }
            Err(e) => Outcome::fatal(format!("could not save agent info: {e}")),
        }
    }
}

/// Package operations reported on `deployresult`, or on `wingetcfg.deploy`
/// when a configuration profile performed them.
pub struct DeployResultHandler {
    db: WorkerDatabase,
    by_profile: bool,
}

impl DeployResultHandler {
    pub const fn new(db: WorkerDatabase) -> Self {
        Self {
            db,
            by_profile: false,
        }
    }

    pub const fn from_profiles(db: WorkerDatabase) -> Self {
        Self {
            db,
            by_profile: true,
        }
    }
}

#[async_trait]
impl MessageHandler for DeployResultHandler {
    async fn handle(&self, message: &InboundMessage) -> Outcome {
        let action: DeployAction = match serde_json::from_slice(&message.payload) {
            Ok(action) => action,
            Err(e) => return Outcome::fatal(format!("could not parse deploy result: {e}")),
        };
        let when = action.when.timestamp();

        let saved = match action.action {
            DeployKind::Install => self
                .db
                .record_install(
                    &action.agent_id,
                    &action.package_id,
                    &action.package_name,
                    &action.package_version,
                    when,
                    self.by_profile,
                )
                .await,
            DeployKind::Update => self
                .db
                .record_update(&action.agent_id, &action.package_id, when)
                .await
                .map(|touched| {
                    if !touched {
                        debug!(
                            agent_id = %action.agent_id,
                            package_id = %action.package_id,
                            "Update for a package that is not recorded"
                        );
                    }
                }),
            DeployKind::Uninstall => {
                self.db
                    .record_uninstall(&action.agent_id, &action.package_id)
                    .await
            }
        };

        match saved {
            Ok(()) => Outcome::reply(""),
            Err(e) => Outcome::fatal(e),
        }
    }
}

pub struct ExclusionHandler {
    db: WorkerDatabase,
}

impl ExclusionHandler {
    pub const fn new(db: WorkerDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageHandler for ExclusionHandler {
    async fn handle(&self, message: &InboundMessage) -> Outcome {
        let action: DeployAction = match serde_json::from_slice(&message.payload) {
            Ok(action) => action,
            Err(e) => return Outcome::fatal(format!("could not parse package exclusion: {e}")),
        };
        match self
            .db
            .record_exclusion(&action.agent_id, &action.package_id, action.when.timestamp())
            .await
        {
            Ok(()) => Outcome::reply(""),
            Err(e) => Outcome::fatal(e),
        }
    }
}

pub struct ProfileReportHandler {
    db: WorkerDatabase,
}

impl ProfileReportHandler {
    pub const fn new(db: WorkerDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageHandler for ProfileReportHandler {
    async fn handle(&self, message: &InboundMessage) -> Outcome {
        let report: ProfileReport = match serde_json::from_slice(&message.payload) {
            Ok(report) => report,
            Err(e) => return Outcome::fatal(format!("could not parse profile report: {e}")),
        };
        if report.agent_id.is_empty() {
            return Outcome::fatal("profile report without agent id");
        }

        let error = (!report.success).then_some(report.error.as_str());
        match self
            .db
            .record_profile_result(report.profile_id, &report.agent_id, error)
            .await
        {
            Ok(()) => Outcome::reply(""),
            Err(e) => {
                warn!(
                    agent_id = %report.agent_id,
                    profile_id = report.profile_id,
                    error = %e,
                    "Could not save profile issue"
                );
                Outcome::fatal(e)
            }
        }
    }
}

pub struct AgentConfigHandler {
    db: WorkerDatabase,
}

impl AgentConfigHandler {
    pub const fn new(db: WorkerDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageHandler for AgentConfigHandler {
    async fn handle(&self, _message: &InboundMessage) -> Outcome {
        let config = match self.db.get_settings().await {
            Ok(settings) => AgentConfig {
                agent_frequency: settings.agent_report_frequency_mins,
                ok: true,
            },
            Err(e) => {
                warn!(error = %e, "Could not read default agent frequency");
                AgentConfig {
                    agent_frequency: 0,
                    ok: false,
                }
            }
        };
        match serde_json::to_vec(&config) {
            Ok(payload) => Outcome::reply(payload),
            Err(e) => Outcome::fatal(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::report::DnsResolver;
    use crate::storage::{Agent, AgentStatus, App};
    use bytes::Bytes;

    async fn db() -> WorkerDatabase {
        WorkerDatabase::open_in_memory().await.unwrap()
    }

    fn report_handler(db: &WorkerDatabase) -> ReportHandler {
        ReportHandler::new(
            db.clone(),
            ReportApplier::new(db.clone(), Arc::new(DnsResolver), None),
        )
    }

    fn request(subject: &str, payload: impl Into<Bytes>) -> InboundMessage {
        InboundMessage::new(subject, payload, Some("_INBOX.test".into()))
    }

    #[tokio::test]
    async fn report_is_applied_and_acknowledged() {
        let db = db().await;
        let payload = serde_json::json!({
            "agent_id": "A1",
            "hostname": "PC-01",
            "applications": [{"name": "7-Zip", "version": "23.01"}]
        });
        let outcome = report_handler(&db)
            .handle(&request(subjects::REPORT, payload.to_string()))
            .await;

        assert_eq!(outcome, Outcome::reply(REPORT_RECEIVED));
        let apps: Vec<App> = db.list_apps("A1").await.unwrap();
        assert_eq!(apps[0].name, "7-Zip");
    }

    #[tokio::test]
    async fn auto_admit_setting_is_honoured() {
        let db = db().await;
        let mut settings = db.get_settings().await.unwrap();
        settings.auto_admit_agents = true;
        db.save_settings(&settings).await.unwrap();

        report_handler(&db)
            .handle(&request(subjects::REPORT, r#"{"agent_id":"A2"}"#))
            .await;
        let agent = db.get_agent("A2").await.unwrap().expect("agent");
        assert_eq!(agent.status(), Some(AgentStatus::Enabled));
    }

    #[tokio::test]
    async fn malformed_report_is_fatal() {
        let db = db().await;
        let outcome = report_handler(&db)
            .handle(&request(subjects::REPORT, "{not json"))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));

        let outcome = report_handler(&db)
            .handle(&request(subjects::REPORT, "{}"))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[tokio::test]
    async fn deploy_results_follow_the_package_lifecycle() {
        let db = db().await;
        db.upsert_agent_with("A1", |_| Agent::first_seen("A1", AgentStatus::Enabled, 1))
            .await
            .unwrap();
        let handler = DeployResultHandler::new(db.clone());

        let install = r#"{"agent_id":"A1","package_id":"Mozilla.Firefox","package_name":"Firefox","package_version":"120.0","action":"install","when":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(
            handler.handle(&request(subjects::DEPLOY_RESULT, install)).await,
            Outcome::reply("")
        );
        let update = r#"{"agent_id":"A1","package_id":"Mozilla.Firefox","action":"update","when":"2024-06-01T10:00:00Z"}"#;
        handler.handle(&request(subjects::DEPLOY_RESULT, update)).await;

        let deployments = db.list_deployments("A1").await.unwrap();
        assert_eq!(deployments.len(), 1);
        assert!(deployments[0].updated > deployments[0].installed);
        assert_eq!(deployments[0].version, "120.0");

        let uninstall = r#"{"agent_id":"A1","package_id":"Mozilla.Firefox","action":"uninstall","when":"2024-07-01T10:00:00Z"}"#;
        handler.handle(&request(subjects::DEPLOY_RESULT, uninstall)).await;
        assert!(db.list_deployments("A1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_deploy_action_is_fatal() {
        let handler = DeployResultHandler::new(db().await);
        let outcome = handler
            .handle(&request(
                subjects::DEPLOY_RESULT,
                r#"{"agent_id":"A1","package_id":"x","action":"reboot","when":"2024-05-01T10:00:00Z"}"#,
            ))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[tokio::test]
    async fn profile_deployments_are_flagged() {
        let db = db().await;
        db.upsert_agent_with("A1", |_| Agent::first_seen("A1", AgentStatus::Enabled, 1))
            .await
            .unwrap();
        let install = serde_json::json!({
            "agent_id": "A1",
            "package_id": "Git.Git",
            "package_name": "Git",
            "package_version": "2.45.0",
            "action": "install",
            "when": "2024-05-01T10:00:00Z"
        });

        let outcome = DeployResultHandler::from_profiles(db.clone())
            .handle(&request(subjects::PROFILE_DEPLOY, install.to_string()))
            .await;
        assert_eq!(outcome, Outcome::reply(""));
        assert!(db.list_deployments("A1").await.unwrap()[0].by_profile);

        // A later manual install of the same package takes it over.
        DeployResultHandler::new(db.clone())
            .handle(&request(subjects::DEPLOY_RESULT, install.to_string()))
            .await;
        assert!(!db.list_deployments("A1").await.unwrap()[0].by_profile);
    }

    #[tokio::test]
    async fn excluded_packages_are_recorded() {
        let db = db().await;
        db.upsert_agent_with("A1", |_| Agent::first_seen("A1", AgentStatus::Enabled, 1))
            .await
            .unwrap();
        let exclude = serde_json::json!({
            "agent_id": "A1",
            "package_id": "Mozilla.Firefox",
            "action": "uninstall",
            "when": "2024-05-01T10:00:00Z"
        });

        let outcome = ExclusionHandler::new(db.clone())
            .handle(&request(subjects::PROFILE_EXCLUDE, exclude.to_string()))
            .await;
        assert_eq!(outcome, Outcome::reply(""));
        let exclusions = db.list_exclusions("A1").await.unwrap();
        assert_eq!(exclusions[0].package_id, "Mozilla.Firefox");
    }

    #[tokio::test]
    async fn profile_report_without_agent_is_fatal() {
        let handler = ProfileReportHandler::new(db().await);
        let outcome = handler
            .handle(&request(subjects::PROFILE_REPORT, r#"{"profile_id":1}"#))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));

        let outcome = handler
            .handle(&request(subjects::PROFILE_REPORT, "not json"))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[tokio::test]
    async fn agent_config_reports_default_frequency() {
        let handler = AgentConfigHandler::new(db().await);
        let Outcome::Reply(payload) = handler.handle(&request(subjects::AGENT_CONFIG, "")).await
        else {
            panic!("expected a reply");
        };
        let config: AgentConfig = serde_json::from_slice(&payload).unwrap();
        assert!(config.ok);
        assert_eq!(config.agent_frequency, 60);
    }
}
