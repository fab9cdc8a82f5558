use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use tokio::sync::Mutex;

use super::{
    AckHandle, Broker, BrokerError, DeliveryStream, DurableSpec, InboundMessage, subject_matches,
};

/// How a durable delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nak(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledMessage {
    pub subject: String,
    pub settlement: Settlement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub subject: String,
    pub payload: Bytes,
}

/// Ack handle that records every settlement in a shared log.
pub struct RecordingAck {
    subject: String,
    log: Arc<Mutex<Vec<SettledMessage>>>,
}

#[async_trait]
impl AckHandle for RecordingAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.log.lock().await.push(SettledMessage {
            subject: self.subject.clone(),
            settlement: Settlement::Ack,
        });
        Ok(())
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), BrokerError> {
        self.log.lock().await.push(SettledMessage {
            subject: self.subject.clone(),
            settlement: Settlement::Nak(delay),
        });
        Ok(())
    }
}

struct Route {
    pattern: String,
    durable: bool,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

struct Inner {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    drains: AtomicUsize,
    subscribe_calls: AtomicUsize,
    published: Mutex<Vec<Published>>,
    routes: Mutex<Vec<Route>>,
    durable_specs: Mutex<Vec<DurableSpec>>,
    settled: Arc<Mutex<Vec<SettledMessage>>>,
}

/// In-process broker for tests: records publishes and settlements and lets
/// tests push deliveries into live subscriptions.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(true),
                fail_publish: AtomicBool::new(false),
                fail_subscribe: AtomicBool::new(false),
                drains: AtomicUsize::new(0),
                subscribe_calls: AtomicUsize::new(0),
                published: Mutex::new(Vec::new()),
                routes: Mutex::new(Vec::new()),
                durable_specs: Mutex::new(Vec::new()),
                settled: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn is_drained(&self) -> bool {
        self.drain_calls() > 0
    }

    pub fn drain_calls(&self) -> usize {
        self.inner.drains.load(Ordering::SeqCst)
    }

    /// Number of subscribe calls, successful or not.
    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    pub async fn published(&self) -> Vec<Published> {
        self.inner.published.lock().await.clone()
    }

    /// Payloads published to exactly `subject`.
    pub async fn published_to(&self, subject: &str) -> Vec<Bytes> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|p| p.subject == subject)
            .map(|p| p.payload.clone())
            .collect()
    }

    pub async fn settlements(&self) -> Vec<SettledMessage> {
        self.inner.settled.lock().await.clone()
    }

    pub async fn durable_specs(&self) -> Vec<DurableSpec> {
        self.inner.durable_specs.lock().await.clone()
    }

    /// Patterns of the subscriptions that are still open.
    pub async fn subscriptions(&self) -> Vec<String> {
        let mut routes = self.inner.routes.lock().await;
        routes.retain(|r| !r.sender.is_closed());
        routes.iter().map(|r| r.pattern.clone()).collect()
    }

    /// A durable delivery whose settlement lands in this broker's log.
    pub fn durable_message(&self, subject: &str, payload: impl Into<Bytes>) -> InboundMessage {
        InboundMessage::new(subject, payload, None).with_ack(Box::new(RecordingAck {
            subject: subject.to_string(),
            log: Arc::clone(&self.inner.settled),
        }))
    }

    /// Deliver a message to the first open subscription matching `subject`.
    /// Returns `false` when nobody is subscribed.
    pub async fn deliver(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        reply: Option<&str>,
    ) -> bool {
        let payload = payload.into();
        let mut routes = self.inner.routes.lock().await;
        routes.retain(|r| !r.sender.is_closed());

        let Some(route) = routes.iter().find(|r| subject_matches(&r.pattern, subject)) else {
            return false;
        };
        let message = if route.durable {
            self.durable_message(subject, payload)
        } else {
            InboundMessage::new(subject, payload, reply.map(str::to_string))
        };
        route.sender.unbounded_send(message).is_ok()
    }

    async fn open_route(
        &self,
        pattern: &str,
        durable: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscribe(format!("{pattern}: refused")));
        }
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }

        let (sender, receiver) = mpsc::unbounded();
        self.inner.routes.lock().await.push(Route {
            pattern: pattern.to_string(),
            durable,
            sender,
        });
        Ok(receiver.boxed())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish(format!("{subject}: refused")));
        }
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        self.inner.published.lock().await.push(Published {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        _group: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.open_route(subject, false).await
    }

    async fn durable_subscribe(&self, spec: &DurableSpec) -> Result<DeliveryStream, BrokerError> {
        self.inner.durable_specs.lock().await.push(spec.clone());
        let mut streams = Vec::with_capacity(spec.subjects.len());
        for subject in &spec.subjects {
            streams.push(self.open_route(subject, true).await?);
        }
        Ok(futures::stream::select_all(streams).boxed())
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.inner.routes.lock().await.clear();
        self.inner.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_records_payloads() {
        let broker = InMemoryBroker::new();
        broker
            .publish("agent.certificate.A1", Bytes::from_static(b"cert"))
            .await
            .unwrap();
        assert_eq!(
            broker.published_to("agent.certificate.A1").await,
            vec![Bytes::from_static(b"cert")]
        );
    }

    #[tokio::test]
    async fn disconnected_broker_refuses_publishes() {
        let broker = InMemoryBroker::new();
        broker.set_connected(false);
        let err = broker.publish("x", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Disconnected));
    }

    #[tokio::test]
    async fn durable_deliveries_carry_recording_acks() {
        let broker = InMemoryBroker::new();
        let spec = DurableSpec {
            stream: "S".into(),
            subjects: vec!["certificates.agent.*".into()],
            durable_name: "C".into(),
            ack_wait: Duration::from_secs(60),
        };
        let mut stream = broker.durable_subscribe(&spec).await.unwrap();

        assert!(broker.deliver("certificates.agent.A7", "{}", None).await);
        let message = stream.next().await.expect("delivery");
        assert!(message.is_durable());

        message.acker().unwrap().ack().await.unwrap();
        assert_eq!(
            broker.settlements().await,
            vec![SettledMessage {
                subject: "certificates.agent.A7".into(),
                settlement: Settlement::Ack,
            }]
        );
    }

    #[tokio::test]
    async fn drain_ends_streams() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.queue_subscribe("report", "g").await.unwrap();
        broker.drain().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(broker.is_drained());
        assert!(!broker.deliver("report", "{}", None).await);
    }
}
