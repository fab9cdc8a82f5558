//! Worker bootstrap: database, then broker, then subscriptions.
//!
//! Each stage goes through the [`RetryScheduler`], and the next stage starts
//! from the previous stage's continuation, so subscriptions are only
//! registered once both dependencies are up. Progress is published on a
//! watch channel; shutdown reads it to know what has to be drained.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::broker::{Broker, NatsBroker};
use crate::delivery::SubscriptionSet;
use crate::error::WorkerError;
use crate::scheduler::{Dependency, EnsureOutcome, RetryScheduler};
use crate::storage::{ServerIdentity, WorkerDatabase};

/// Opens the worker's database.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<WorkerDatabase, WorkerError>;
}

/// Opens the worker's broker connection.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, WorkerError>;
}

/// Registers a worker's subscriptions once both dependencies are connected.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        context: &WorkerContext,
        subscriptions: &SubscriptionSet,
    ) -> Result<(), WorkerError>;
}

/// Connected dependencies handed to [`Subscriber::subscribe`].
#[derive(Clone)]
pub struct WorkerContext {
    pub db: WorkerDatabase,
    pub broker: Arc<dyn Broker>,
    pub hostname: String,
}

/// Everything a running worker has to tear down.
#[derive(Clone)]
pub struct Running {
    pub context: WorkerContext,
    pub subscriptions: Arc<SubscriptionSet>,
}

/// Bootstrap progress.
#[derive(Clone, Default)]
pub enum Readiness {
    #[default]
    Starting,
    StoreReady(WorkerDatabase),
    Running(Running),
}

impl Readiness {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }
}

pub struct BootstrapSequencer {
    scheduler: RetryScheduler,
    store: Arc<dyn StoreConnector>,
    broker: Arc<dyn BrokerConnector>,
    identity: ServerIdentity,
    consumer_lifetime: Duration,
    readiness: watch::Sender<Readiness>,
    /// Set once shutdown begins; guards the move to `Running`.
    stopped: Mutex<bool>,
}

impl BootstrapSequencer {
    pub fn new(
        scheduler: RetryScheduler,
        store: Arc<dyn StoreConnector>,
        broker: Arc<dyn BrokerConnector>,
        identity: ServerIdentity,
        consumer_lifetime: Duration,
    ) -> Self {
        let (readiness, _) = watch::channel(Readiness::Starting);
        Self {
            scheduler,
            store,
            broker,
            identity,
            consumer_lifetime,
            readiness,
            stopped: Mutex::new(false),
        }
    }

    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    pub const fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Start the dependency chain. Never fails: stages that cannot connect
    /// are retried in the background.
    pub async fn start(self: &Arc<Self>, subscriber: Arc<dyn Subscriber>) -> EnsureOutcome {
        let store = Arc::clone(&self.store);
        let this = Arc::clone(self);
        self.scheduler
            .ensure_connected(
                Dependency::Database,
                move || {
                    let store = Arc::clone(&store);
                    async move { store.connect().await }
                },
                move |db| Box::pin(async move { this.on_store_ready(db, subscriber).await }),
            )
            .await
    }

    async fn on_store_ready(self: Arc<Self>, db: WorkerDatabase, subscriber: Arc<dyn Subscriber>) {
        if *self.stopped.lock().await {
            db.close().await;
            return;
        }
        match db.record_server(&self.identity).await {
            Ok(()) => info!(hostname = %self.identity.hostname, "Server identity recorded"),
            Err(e) => warn!(error = %e, "Could not record server identity"),
        }
        self.readiness.send_replace(Readiness::StoreReady(db.clone()));

        let this = Arc::clone(&self);
        self.scheduler
            .ensure_connected(
                Dependency::Broker,
                move || {
                    // Outlives a cancelled retry job; see `open_broker`.
                    let attempt = tokio::spawn(
                        Arc::clone(&this).open_broker(db.clone(), Arc::clone(&subscriber)),
                    );
                    async move { attempt.await? }
                },
                |()| Box::pin(async {}),
            )
            .await;
    }

    /// Connect the broker and register the worker's subscriptions. The
    /// result is published as [`Readiness::Running`] unless shutdown has
    /// begun, in which case the subscriptions are drained right away.
    async fn open_broker(
        self: Arc<Self>,
        db: WorkerDatabase,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), WorkerError> {
        let connected = self.broker.connect().await?;
        let context = WorkerContext {
            db,
            broker: Arc::clone(&connected),
            hostname: self.identity.hostname.clone(),
        };
        let subscriptions = Arc::new(SubscriptionSet::new(connected, self.consumer_lifetime));
        if let Err(e) = subscriber.subscribe(&context, &subscriptions).await {
            subscriptions.drain().await;
            return Err(e);
        }

        let stopped = self.stopped.lock().await;
        if *stopped {
            drop(stopped);
            info!("Subscribed after shutdown began, draining");
            subscriptions.drain().await;
            return Ok(());
        }
        self.readiness.send_replace(Readiness::Running(Running {
            context,
            subscriptions,
        }));
        info!("Worker is ready");
        Ok(())
    }

    /// Cancel pending retries, drain subscriptions and close the store.
    pub async fn shutdown(&self) {
        *self.stopped.lock().await = true;
        self.scheduler.shutdown().await;
        let readiness = self.readiness.borrow().clone();
        match readiness {
            Readiness::Starting => {}
            Readiness::StoreReady(db) => db.close().await,
            Readiness::Running(running) => {
                running.subscriptions.drain().await;
                running.context.db.close().await;
            }
        }
        info!("Worker stopped");
    }
}

/// Connects with a database URL.
pub struct UrlStoreConnector {
    pub url: String,
}

#[async_trait]
impl StoreConnector for UrlStoreConnector {
    async fn connect(&self) -> Result<WorkerDatabase, WorkerError> {
        Ok(WorkerDatabase::connect(&self.url).await?)
    }
}

/// Connects to NATS with the worker's broker settings.
pub struct NatsConnector {
    pub config: fleet_core::config::BrokerConfig,
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, WorkerError> {
        let broker = NatsBroker::connect(&self.config).await?;
        Ok(Arc::new(broker))
    }
}
