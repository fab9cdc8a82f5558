//! Shared harness: a worker bootstrapped against an in-memory store and
//! broker.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fleet_worker::bootstrap::{
    BootstrapSequencer, BrokerConnector, Readiness, StoreConnector, Subscriber,
};
use fleet_worker::broker::{Broker, InMemoryBroker};
use fleet_worker::error::WorkerError;
use fleet_worker::scheduler::RetryScheduler;
use fleet_worker::storage::{ServerIdentity, WorkerDatabase};

pub struct SharedStore(pub WorkerDatabase);

#[async_trait]
impl StoreConnector for SharedStore {
    async fn connect(&self) -> Result<WorkerDatabase, WorkerError> {
        Ok(self.0.clone())
    }
}

pub struct SharedBroker(pub InMemoryBroker);

#[async_trait]
impl BrokerConnector for SharedBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>, WorkerError> {
        Ok(Arc::new(self.0.clone()))
    }
}

pub struct Harness {
    pub db: WorkerDatabase,
    pub broker: InMemoryBroker,
    pub sequencer: Arc<BootstrapSequencer>,
}

impl Harness {
    /// Bootstrap `worker` and wait until its subscriptions are registered.
    pub async fn start(worker: Arc<dyn Subscriber>) -> Self {
        let db = WorkerDatabase::open_in_memory().await.unwrap();
        let broker = InMemoryBroker::new();
        let sequencer = Arc::new(BootstrapSequencer::new(
            RetryScheduler::new(Duration::from_millis(50)),
            Arc::new(SharedStore(db.clone())),
            Arc::new(SharedBroker(broker.clone())),
            ServerIdentity::current("worker-it"),
            Duration::from_secs(3600),
        ));
        let mut readiness = sequencer.readiness();
        sequencer.start(worker).await;
        tokio::time::timeout(Duration::from_secs(5), readiness.wait_for(Readiness::is_running))
            .await
            .unwrap()
            .unwrap();
        Self {
            db,
            broker,
            sequencer,
        }
    }

    /// Send a request and wait for the worker's reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<bytes::Bytes>,
        inbox: &str,
    ) -> String {
        assert!(
            self.broker.deliver(subject, payload, Some(inbox)).await,
            "nobody subscribed to {subject}"
        );
        let reply = eventually(|| async { self.broker.published_to(inbox).await.pop() }).await;
        String::from_utf8(reply.to_vec()).unwrap()
    }

    /// Deliver to a durable consumer and wait for `count` settlements in total.
    pub async fn deliver_durable(
        &self,
        subject: &str,
        payload: impl Into<bytes::Bytes>,
        count: usize,
    ) {
        assert!(
            self.broker.deliver(subject, payload, None).await,
            "nobody subscribed to {subject}"
        );
        eventually(|| async {
            (self.broker.settlements().await.len() >= count).then_some(())
        })
        .await;
    }
}

/// Poll `check` until it yields a value.
pub async fn eventually<T, F, Fut>(check: F) -> T
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..400 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
