//! `SQLite` storage for the fleet workers.
//!
//! Provides persistence for agents and their inventory, deployments,
//! configuration profile results, certificates, users, settings and worker
//! identities.

mod db;
mod inventory;
mod models;
mod queries_agents;
mod queries_certs;
mod queries_deploy;
mod queries_profiles;
mod queries_settings;

pub use db::{DatabaseError, WorkerDatabase};
pub use inventory::{ChildRecord, INSERT_CHUNK_ROWS};
pub use models::*;
pub use queries_certs::NewCertificate;
