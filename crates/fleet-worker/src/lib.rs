//! Fleet Worker Library
//!
//! Background workers of the fleet management platform:
//! - Dependency bootstrap with fixed-interval connection retries
//! - Queue-group and durable JetStream consumption with tagged outcomes
//! - Idempotent application of agent inventory reports
//! - Certificate issuance for agents and console users
//! - E-mail notifications over SMTP

pub mod bootstrap;
pub mod broker;
pub mod delivery;
pub mod error;
pub mod issuance;
pub mod mail;
pub mod pidfile;
pub mod report;
pub mod scheduler;
pub mod storage;
pub mod wire;
pub mod workers;
