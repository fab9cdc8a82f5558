//! Worker error types.

use crate::broker::BrokerError;
use crate::mail::MailError;
use crate::storage::DatabaseError;

/// Errors surfaced by worker components.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] fleet_crypto::CertError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
