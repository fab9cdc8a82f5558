//! Message consumption: handler outcomes and how they settle deliveries.
//!
//! Handlers never touch acknowledgment. They return an [`Outcome`] and
//! [`settle`] turns it into broker calls according to the delivery mode:
//!
//! | Outcome         | durable                       | queue group               |
//! |-----------------|-------------------------------|---------------------------|
//! | `Ack`           | ack                           | nothing                   |
//! | `Reply(p)`      | ack (+ reply if requested)    | respond `p`               |
//! | `RetryAfter(d)` | nak, redeliver after `d`      | logged                    |
//! | `Fatal(e)`      | logged, ack                   | respond `e` if requested  |

mod runner;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::broker::{Broker, InboundMessage};

pub use runner::SubscriptionSet;

/// Redelivery delay for failures of certificate and notification handling.
pub const RETRY_PROCESSING: Duration = Duration::from_secs(5 * 60);
/// Redelivery delay when the downstream publish target is unreachable.
pub const RETRY_UNREACHABLE: Duration = Duration::from_secs(10 * 60);

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; nothing to send back.
    Ack,
    /// Processed; send `payload` to the requester.
    Reply(Bytes),
    /// Transient failure; try again no sooner than the given delay.
    RetryAfter(Duration),
    /// The message can never be processed.
    Fatal(String),
}

impl Outcome {
    pub fn reply(payload: impl Into<Bytes>) -> Self {
        Self::Reply(payload.into())
    }

    pub fn fatal(reason: impl std::fmt::Display) -> Self {
        Self::Fatal(reason.to_string())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Outcome;
}

/// Apply `outcome` to `message`.
pub async fn settle(broker: &dyn Broker, message: &InboundMessage, outcome: Outcome) {
    match message.acker() {
        Some(acker) => {
            let settled = match outcome {
                Outcome::Ack => acker.ack().await,
                Outcome::Reply(payload) => {
                    respond(broker, message, payload).await;
                    acker.ack().await
                }
                Outcome::RetryAfter(delay) => {
                    warn!(
                        subject = %message.subject,
                        delay_secs = delay.as_secs(),
                        "Processing failed, redelivery requested"
                    );
                    acker.nak_with_delay(delay).await
                }
                Outcome::Fatal(reason) => {
                    error!(subject = %message.subject, %reason, "Dropping message");
                    acker.ack().await
                }
            };
            if let Err(e) = settled {
                error!(subject = %message.subject, error = %e, "Could not settle message");
            }
        }
        None => match outcome {
            Outcome::Ack => {}
            Outcome::Reply(payload) => respond(broker, message, payload).await,
            Outcome::RetryAfter(delay) => {
                warn!(
                    subject = %message.subject,
                    delay_secs = delay.as_secs(),
                    "Processing failed on a subscription without redelivery"
                );
            }
            Outcome::Fatal(reason) => {
                error!(subject = %message.subject, %reason, "Could not process message");
                respond(broker, message, Bytes::from(reason)).await;
            }
        },
    }
}

async fn respond(broker: &dyn Broker, message: &InboundMessage, payload: Bytes) {
    let Some(reply) = &message.reply else {
        debug!(subject = %message.subject, "No reply subject, response dropped");
        return;
    };
    if let Err(e) = broker.publish(reply, payload).await {
        error!(subject = %message.subject, error = %e, "Could not respond");
    }
}
