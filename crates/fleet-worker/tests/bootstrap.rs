#![allow(clippy::unwrap_used, clippy::panic)]

//! Dependency ordering and retry cancellation across a real worker.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use common::SharedBroker;
use fleet_worker::bootstrap::{BootstrapSequencer, Readiness, StoreConnector};
use fleet_worker::broker::InMemoryBroker;
use fleet_worker::error::WorkerError;
use fleet_worker::report::DnsResolver;
use fleet_worker::scheduler::{Dependency, EnsureOutcome, RetryScheduler};
use fleet_worker::storage::{ServerIdentity, WorkerDatabase};
use fleet_worker::workers::AgentsWorker;

/// Store that stays unreachable until the test opens it.
struct GatedStore {
    open: AtomicBool,
}

#[async_trait]
impl StoreConnector for GatedStore {
    async fn connect(&self) -> Result<WorkerDatabase, WorkerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(WorkerError::Config("connection refused".into()));
        }
        Ok(WorkerDatabase::open_in_memory().await?)
    }
}

#[tokio::test]
async fn broker_waits_for_the_database() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(GatedStore {
        open: AtomicBool::new(false),
    });
    let sequencer = Arc::new(BootstrapSequencer::new(
        RetryScheduler::new(Duration::from_millis(50)),
        store.clone(),
        Arc::new(SharedBroker(broker.clone())),
        ServerIdentity::current("worker-it"),
        Duration::from_secs(3600),
    ));
    let mut readiness = sequencer.readiness();

    let outcome = sequencer
        .start(Arc::new(AgentsWorker::new(Arc::new(DnsResolver), None)))
        .await;
    assert_eq!(outcome, EnsureOutcome::Scheduled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.subscribe_calls(), 0);
    assert!(sequencer.scheduler().is_retrying(Dependency::Database).await);
    let status = sequencer
        .scheduler()
        .status(Dependency::Database)
        .await
        .unwrap();
    assert!(status.attempts >= 2);
    assert!(!status.connected);

    store.open.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), readiness.wait_for(Readiness::is_running))
        .await
        .unwrap()
        .unwrap();

    assert!(!sequencer.scheduler().is_retrying(Dependency::Database).await);
    assert!(!sequencer.scheduler().is_retrying(Dependency::Broker).await);
    assert_eq!(
        broker.subscriptions().await,
        vec![
            "report",
            "deployresult",
            "ping.agentworker",
            "agentconfig",
            "wingetcfg.deploy",
            "wingetcfg.exclude",
            "wingetcfg.report",
        ]
    );

    sequencer.shutdown().await;
    assert!(broker.is_drained());
}

#[tokio::test]
async fn shutdown_cancels_pending_retries() {
    let broker = InMemoryBroker::new();
    let sequencer = Arc::new(BootstrapSequencer::new(
        RetryScheduler::new(Duration::from_millis(50)),
        Arc::new(GatedStore {
            open: AtomicBool::new(false),
        }),
        Arc::new(SharedBroker(broker.clone())),
        ServerIdentity::current("worker-it"),
        Duration::from_secs(3600),
    ));

    sequencer
        .start(Arc::new(AgentsWorker::new(Arc::new(DnsResolver), None)))
        .await;
    assert!(sequencer.scheduler().is_retrying(Dependency::Database).await);

    sequencer.shutdown().await;
    assert!(!sequencer.scheduler().is_retrying(Dependency::Database).await);
    assert_eq!(broker.subscribe_calls(), 0);
}
