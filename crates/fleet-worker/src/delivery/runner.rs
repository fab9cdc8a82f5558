//! Subscription tasks.
//!
//! Each subscription runs in its own task and processes one message at a
//! time. Shutdown is observed between messages only, so a handler that has
//! started always finishes and settles its message.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MessageHandler, settle};
use crate::broker::{Broker, BrokerError, DeliveryStream, DurableSpec};

/// Pause before re-opening a durable consumer that could not be renewed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

enum StreamEnd {
    Shutdown,
    Closed,
    Expired,
}

/// The subscriptions registered by one worker.
pub struct SubscriptionSet {
    broker: Arc<dyn Broker>,
    consumer_lifetime: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionSet {
    /// `consumer_lifetime` bounds how long a durable consumer stream is used
    /// before it is re-established.
    pub fn new(broker: Arc<dyn Broker>, consumer_lifetime: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            broker,
            consumer_lifetime,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// At-most-once subscription shared by the members of `group`.
    pub async fn queue(
        &self,
        subject: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let stream = self.broker.queue_subscribe(subject, group).await?;
        info!(subject, group, "Subscribed");

        let broker = Arc::clone(&self.broker);
        let mut shutdown = self.shutdown_tx.subscribe();
        let subject = subject.to_string();
        let task = tokio::spawn(async move {
            match consume(broker.as_ref(), stream, handler.as_ref(), &mut shutdown, None).await {
                StreamEnd::Closed => warn!(%subject, "Subscription closed"),
                StreamEnd::Shutdown | StreamEnd::Expired => {
                    debug!(%subject, "Subscription stopped");
                }
            }
        });
        self.tasks.lock().await.push(task);
        Ok(())
    }

    /// Durable, explicitly acknowledged consumer. The first attempt to open
    /// it is reported to the caller; later renewals are retried in place.
    pub async fn durable(
        &self,
        spec: DurableSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let stream = self.broker.durable_subscribe(&spec).await?;
        info!(stream = %spec.stream, consumer = %spec.durable_name, "Subscribed");

        let broker = Arc::clone(&self.broker);
        let mut shutdown = self.shutdown_tx.subscribe();
        let lifetime = self.consumer_lifetime;
        let task = tokio::spawn(async move {
            let mut stream = Some(stream);
            loop {
                let current = match stream.take() {
                    Some(current) => current,
                    None => match broker.durable_subscribe(&spec).await {
                        Ok(renewed) => {
                            debug!(consumer = %spec.durable_name, "Consumer renewed");
                            renewed
                        }
                        Err(e) => {
                            warn!(
                                consumer = %spec.durable_name,
                                error = %e,
                                "Could not renew consumer"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                                _ = shutdown.changed() => return,
                            }
                        }
                    },
                };

                let end = consume(
                    broker.as_ref(),
                    current,
                    handler.as_ref(),
                    &mut shutdown,
                    Some(lifetime),
                )
                .await;
                match end {
                    StreamEnd::Shutdown => return,
                    StreamEnd::Expired => {}
                    StreamEnd::Closed => {
                        warn!(consumer = %spec.durable_name, "Consumer stream closed");
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
        Ok(())
    }

    /// Number of subscription tasks started.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop taking deliveries, wait for in-flight handlers, then drain the
    /// broker connection.
    pub async fn drain(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Subscription task ended abnormally");
            }
        }
        if let Err(e) = self.broker.drain().await {
            warn!(error = %e, "Could not drain broker connection");
        }
    }
}

async fn consume(
    broker: &dyn Broker,
    mut stream: DeliveryStream,
    handler: &dyn MessageHandler,
    shutdown: &mut watch::Receiver<bool>,
    lifetime: Option<Duration>,
) -> StreamEnd {
    let expiry = async {
        match lifetime {
            Some(lifetime) => tokio::time::sleep(lifetime).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        if *shutdown.borrow() {
            return StreamEnd::Shutdown;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => return StreamEnd::Shutdown,
            () = &mut expiry => return StreamEnd::Expired,
            next = stream.next() => match next {
                Some(message) => {
                    let outcome = handler.handle(&message).await;
                    settle(broker, &message, outcome).await;
                }
                None => return StreamEnd::Closed,
            },
        }
    }
}
