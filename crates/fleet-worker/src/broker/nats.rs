//! NATS + JetStream implementation of [`Broker`].

use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::{self, AckKind};
use async_nats::jetstream::consumer::{AckPolicy, pull};
use async_nats::jetstream::message::Acker;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{info, warn};

use fleet_core::config::BrokerConfig;

use super::{AckHandle, Broker, BrokerError, DeliveryStream, DurableSpec, InboundMessage};

/// Broker backed by a mutually-authenticated NATS connection.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    /// Stream replica count, one per configured server.
    replicas: usize,
}

impl NatsBroker {
    /// Connect to the configured servers over TLS with the worker's client
    /// certificate.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        if config.servers.is_empty() {
            return Err(BrokerError::Connection(
                "no broker servers configured".to_string(),
            ));
        }

        let client = async_nats::ConnectOptions::new()
            .name("fleet-worker")
            .require_tls(true)
            .add_root_certificates(config.ca_cert.clone())
            .add_client_certificate(config.client_cert.clone(), config.client_key.clone())
            .connect(config.servers.join(","))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!(servers = %config.servers.join(","), "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            replicas: config.servers.len(),
        })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let deliveries = subscriber.map(|message| {
            InboundMessage::new(
                message.subject.to_string(),
                message.payload,
                message.reply.map(|reply| reply.to_string()),
            )
        });
        Ok(deliveries.boxed())
    }

    async fn durable_subscribe(&self, spec: &DurableSpec) -> Result<DeliveryStream, BrokerError> {
        let subscribe_err = |e: &dyn std::fmt::Display| BrokerError::Subscribe(e.to_string());

        let mut stream_config = jetstream::stream::Config {
            name: spec.stream.clone(),
            subjects: spec.subjects.clone(),
            ..Default::default()
        };
        if self.replicas > 1 {
            stream_config.num_replicas = self.replicas;
        }

        // Existing streams pick up subject and replica changes.
        self.jetstream
            .create_or_update_stream(stream_config)
            .await
            .map_err(|e| subscribe_err(&e))?;
        let stream = self
            .jetstream
            .get_stream(&spec.stream)
            .await
            .map_err(|e| subscribe_err(&e))?;

        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &spec.durable_name,
                pull::Config {
                    durable_name: Some(spec.durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: spec.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| subscribe_err(&e))?;

        let messages = consumer.messages().await.map_err(|e| subscribe_err(&e))?;

        let consumer_name = spec.durable_name.clone();
        let deliveries = messages.filter_map(move |item| {
            let consumer_name = consumer_name.clone();
            async move {
                match item {
                    Ok(message) => {
                        let (message, acker) = message.split();
                        Some(
                            InboundMessage::new(message.subject.to_string(), message.payload, None)
                                .with_ack(Box::new(JetStreamAck(acker))),
                        )
                    }
                    Err(e) => {
                        warn!(consumer = %consumer_name, error = %e, "Durable consumer error");
                        None
                    }
                }
            }
        });

        info!(stream = %spec.stream, consumer = %spec.durable_name, "Durable consumer ready");
        Ok(deliveries.boxed())
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!("NATS connection drained");
        Ok(())
    }
}

struct JetStreamAck(Acker);

#[async_trait]
impl AckHandle for JetStreamAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack().await.map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), BrokerError> {
        self.0
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
