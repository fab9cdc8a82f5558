//! Connection retry scheduling.
//!
//! [`RetryScheduler::ensure_connected`] tries a dependency once and, on
//! failure, keeps retrying it at a fixed interval in a background job until
//! it connects. The job removes itself from the scheduler before running the
//! continuation, so a job cancelled by [`RetryScheduler::shutdown`] never
//! runs it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Default pause between connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// An external dependency a worker needs before it can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Database,
    Broker,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Broker => write!(f, "broker"),
        }
    }
}

/// What the scheduler knows about one dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyStatus {
    pub connected: bool,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Result of [`RetryScheduler::ensure_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Connected on the first attempt; the continuation has run.
    Connected,
    /// A retry job was scheduled.
    Scheduled,
}

/// Fixed-interval retry jobs, at most one per dependency.
pub struct RetryScheduler {
    interval: Duration,
    jobs: Arc<Mutex<HashMap<Dependency, JoinHandle<()>>>>,
    status: Arc<Mutex<HashMap<Dependency, DependencyStatus>>>,
}

impl RetryScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            status: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Connect `dependency` with `connect`, then run `continuation` with the
    /// connection. On failure a job retries every interval, forever, until
    /// `connect` succeeds or the scheduler shuts down.
    pub async fn ensure_connected<T, E, C, Fut, K>(
        &self,
        dependency: Dependency,
        connect: C,
        continuation: K,
    ) -> EnsureOutcome
    where
        T: Send + 'static,
        E: std::fmt::Display + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        K: FnOnce(T) -> BoxFuture<'static, ()> + Send + 'static,
    {
        match connect().await {
            Ok(connection) => {
                record_success(&self.status, dependency).await;
                info!(%dependency, "Connected");
                continuation(connection).await;
                return EnsureOutcome::Connected;
            }
            Err(e) => {
                record_failure(&self.status, dependency, &e).await;
                error!(%dependency, error = %e, "Could not connect");
            }
        }

        let interval = self.interval;
        let jobs = Arc::clone(&self.jobs);
        let status = Arc::clone(&self.status);

        // Hold the lock while spawning so the job is registered before it
        // can try to remove itself.
        let mut registered = self.jobs.lock().await;
        let job = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match connect().await {
                    Ok(connection) => {
                        record_success(&status, dependency).await;
                        if jobs.lock().await.remove(&dependency).is_none() {
                            return;
                        }
                        info!(%dependency, "Connected after retry, job removed");
                        continuation(connection).await;
                        return;
                    }
                    Err(e) => {
                        record_failure(&status, dependency, &e).await;
                        warn!(%dependency, error = %e, "Connection retry failed");
                    }
                }
            }
        });
        if let Some(previous) = registered.insert(dependency, job) {
            previous.abort();
        }
        drop(registered);

        info!(
            %dependency,
            interval_secs = interval.as_secs(),
            "Connection retry job scheduled"
        );
        EnsureOutcome::Scheduled
    }

    pub async fn status(&self, dependency: Dependency) -> Option<DependencyStatus> {
        self.status.lock().await.get(&dependency).cloned()
    }

    /// Whether a retry job is pending for `dependency`.
    pub async fn is_retrying(&self, dependency: Dependency) -> bool {
        self.jobs.lock().await.contains_key(&dependency)
    }

    /// Cancel every outstanding retry job.
    pub async fn shutdown(&self) {
        let jobs: Vec<_> = self.jobs.lock().await.drain().collect();
        for (dependency, job) in jobs {
            job.abort();
            info!(%dependency, "Connection retry job cancelled");
        }
    }
}

async fn record_success(
    status: &Mutex<HashMap<Dependency, DependencyStatus>>,
    dependency: Dependency,
) {
    let mut status = status.lock().await;
    let entry = status.entry(dependency).or_default();
    entry.connected = true;
}

async fn record_failure<E: std::fmt::Display>(
    status: &Mutex<HashMap<Dependency, DependencyStatus>>,
    dependency: Dependency,
    error: &E,
) {
    let mut status = status.lock().await;
    let entry = status.entry(dependency).or_default();
    entry.connected = false;
    entry.attempts = entry.attempts.saturating_add(1);
    entry.last_error = Some(error.to_string());
}
