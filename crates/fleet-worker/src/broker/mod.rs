//! Message broker capability.
//!
//! Workers talk to the broker only through [`Broker`]. Two delivery modes
//! are offered: queue-group subscriptions (at-most-once, request/response)
//! and durable consumers with explicit acknowledgment. Durable deliveries
//! carry an [`AckHandle`]; queue deliveries do not.

mod in_memory;
mod nats;
mod subject;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use in_memory::{InMemoryBroker, Published, RecordingAck, SettledMessage, Settlement};
pub use nats::NatsBroker;
pub use subject::{durable_name, subject_matches};

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    Disconnected,

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Acknowledgment error: {0}")]
    Ack(String),
}

/// Settles one durable delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Ask for redelivery no sooner than `delay`.
    async fn nak_with_delay(&self, delay: Duration) -> Result<(), BrokerError>;
}

/// A message as handed to handlers.
pub struct InboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply: Option<String>,
    acker: Option<Box<dyn AckHandle>>,
}

impl InboundMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        reply: Option<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply,
            acker: None,
        }
    }

    /// Attach the acknowledgment handle of a durable delivery.
    #[must_use]
    pub fn with_ack(mut self, acker: Box<dyn AckHandle>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Whether this message came from a durable consumer.
    pub fn is_durable(&self) -> bool {
        self.acker.is_some()
    }

    pub(crate) fn acker(&self) -> Option<&dyn AckHandle> {
        self.acker.as_deref()
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("reply", &self.reply)
            .field("durable", &self.is_durable())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, InboundMessage>;

/// Stream and consumer parameters of a durable subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableSpec {
    pub stream: String,
    pub subjects: Vec<String>,
    pub durable_name: String,
    pub ack_wait: Duration,
}

/// Publish/subscribe primitives used by the workers.
#[async_trait]
pub trait Broker: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe as a member of `group`; each message goes to one member.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Create (or reuse) the stream and durable consumer described by
    /// `spec` and start pulling from it.
    async fn durable_subscribe(&self, spec: &DurableSpec) -> Result<DeliveryStream, BrokerError>;

    /// Stop delivering, flush pending publishes and release the connection.
    async fn drain(&self) -> Result<(), BrokerError>;
}
