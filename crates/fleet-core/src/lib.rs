//! Fleet Core Library
//!
//! Shared functionality for the fleet workers:
//! - Configuration resolution over pluggable backends
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::WorkerConfig;
pub use error::{Error, Result};
