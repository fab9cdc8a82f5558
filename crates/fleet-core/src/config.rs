//! Configuration resolution for the fleet workers.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Platform config file (`/etc/fleet/worker.toml`, or
//!    `%ProgramData%\fleet\worker.toml` on Windows, or `$FLEET_CONFIG`)
//! 3. Environment variables (`FLEET_*`)
//! 4. CLI arguments (highest priority, applied by the binary)
//!
//! Every source is a [`ConfigBackend`], so the resolution order can be
//! exercised without touching the host filesystem or process environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG";

/// Complete worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub certificates: CertificatesConfig,
    pub runtime: RuntimeConfig,
}

/// Message broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker endpoints as `host:port`. The stream replica count follows
    /// the number of endpoints.
    pub servers: Vec<String>,
    /// CA certificate used to verify the broker.
    pub ca_cert: PathBuf,
    /// mTLS client certificate presented by this worker.
    pub client_cert: PathBuf,
    /// mTLS client private key.
    pub client_key: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            servers: vec!["localhost:4433".to_string()],
            ca_cert: PathBuf::from("certificates/ca.cer"),
            client_cert: PathBuf::from("certificates/worker.cer"),
            client_key: PathBuf::from("certificates/worker.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://fleet.db".to_string(),
        }
    }
}

/// Certificate authority material used by the cert-manager worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CertificatesConfig {
    pub ca_key: PathBuf,
    /// OCSP responder URLs embedded into issued certificates.
    pub ocsp_responders: Vec<String>,
    /// Password used for PKCS#12 bundles when a request carries none.
    pub default_bundle_password: String,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            ca_key: PathBuf::from("certificates/ca.key"),
            ocsp_responders: Vec::new(),
            default_bundle_password: "changeit".to_string(),
        }
    }
}

/// Timers and process bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interval between dependency connection attempts.
    pub retry_interval_secs: u64,
    /// Lifetime of a durable consumer before it is re-established.
    pub consumer_lifetime_secs: u64,
    /// Server-enforced acknowledgment deadline for durable consumers.
    pub ack_wait_secs: u64,
    /// Process-id file written by `start` and read by `stop`.
    pub pid_file: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 120,
            consumer_lifetime_secs: 60 * 60,
            ack_wait_secs: 60,
            pid_file: PathBuf::from("PIDFILE"),
        }
    }
}

impl RuntimeConfig {
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub const fn consumer_lifetime(&self) -> Duration {
        Duration::from_secs(self.consumer_lifetime_secs)
    }

    pub const fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// A source of configuration layered on top of the defaults.
pub trait ConfigBackend {
    /// Human-readable name for log lines and errors.
    fn describe(&self) -> String;

    /// Overlay this source's values onto `config`.
    fn apply(&self, config: &mut WorkerConfig) -> Result<()>;
}

/// TOML file backend. A missing file contributes nothing.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigBackend for FileBackend {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn apply(&self, config: &mut WorkerConfig) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        *config = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Environment variable backend reading `FLEET_*` keys from a snapshot.
#[derive(Debug, Clone, Default)]
pub struct EnvBackend {
    vars: HashMap<String, String>,
}

impl EnvBackend {
    /// Snapshot the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn parse_secs(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("{key} must be a number of seconds")))
            })
            .transpose()
    }
}

impl ConfigBackend for EnvBackend {
    fn describe(&self) -> String {
        "environment".to_string()
    }

    fn apply(&self, config: &mut WorkerConfig) -> Result<()> {
        if let Some(val) = self.get("FLEET_NATS_SERVERS") {
            config.broker.servers = split_list(val);
        }
        if let Some(val) = self.get("FLEET_CA_CERT") {
            config.broker.ca_cert = PathBuf::from(val);
        }
        if let Some(val) = self.get("FLEET_WORKER_CERT") {
            config.broker.client_cert = PathBuf::from(val);
        }
        if let Some(val) = self.get("FLEET_WORKER_KEY") {
            config.broker.client_key = PathBuf::from(val);
        }
        if let Some(val) = self.get("FLEET_DATABASE_URL") {
            config.database.url = val.to_string();
        }
        if let Some(val) = self.get("FLEET_CA_KEY") {
            config.certificates.ca_key = PathBuf::from(val);
        }
        if let Some(val) = self.get("FLEET_OCSP_RESPONDERS") {
            config.certificates.ocsp_responders = split_list(val);
        }
        if let Some(val) = self.get("FLEET_PID_FILE") {
            config.runtime.pid_file = PathBuf::from(val);
        }
        if let Some(secs) = self.parse_secs("FLEET_RETRY_INTERVAL_SECS")? {
            config.runtime.retry_interval_secs = secs;
        }
        if let Some(secs) = self.parse_secs("FLEET_CONSUMER_LIFETIME_SECS")? {
            config.runtime.consumer_lifetime_secs = secs;
        }
        if let Some(secs) = self.parse_secs("FLEET_ACK_WAIT_SECS")? {
            config.runtime.ack_wait_secs = secs;
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Platform default location of the worker config file.
pub fn platform_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("ProgramData")
            .map_or_else(|_| PathBuf::from(r"C:\ProgramData"), PathBuf::from)
            .join("fleet")
            .join("worker.toml")
    }
    #[cfg(not(target_os = "windows"))]
    {
        PathBuf::from("/etc/fleet/worker.toml")
    }
}

/// The standard backend chain: config file, then environment.
///
/// `explicit` (usually from `--config`) wins over `$FLEET_CONFIG`, which
/// wins over the platform default.
pub fn default_backends(explicit: Option<&Path>) -> Vec<Box<dyn ConfigBackend>> {
    let env = EnvBackend::from_process();
    let path = explicit.map_or_else(
        || {
            env.get(CONFIG_PATH_ENV)
                .map_or_else(platform_config_path, PathBuf::from)
        },
        Path::to_path_buf,
    );
    vec![Box::new(FileBackend::new(path)), Box::new(env)]
}

/// Resolve configuration by applying each backend in order over the defaults.
pub fn load_config(backends: &[Box<dyn ConfigBackend>]) -> Result<WorkerConfig> {
    let mut config = WorkerConfig::default();
    for backend in backends {
        backend.apply(&mut config)?;
        tracing::debug!(source = %backend.describe(), "Applied configuration source");
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_worker_timers() {
        let config = WorkerConfig::default();
        assert_eq!(config.runtime.retry_interval(), Duration::from_secs(120));
        assert_eq!(config.runtime.consumer_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.runtime.pid_file, PathBuf::from("PIDFILE"));
        assert_eq!(config.certificates.default_bundle_password, "changeit");
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let backends: Vec<Box<dyn ConfigBackend>> =
            vec![Box::new(FileBackend::new(dir.path().join("absent.toml")))];
        let config = load_config(&backends).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn file_values_fill_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            "[broker]\nservers = [\"nats1:4433\", \"nats2:4433\"]\n\n[runtime]\nretry_interval_secs = 5\n",
        )
        .unwrap();

        let backends: Vec<Box<dyn ConfigBackend>> = vec![Box::new(FileBackend::new(&path))];
        let config = load_config(&backends).unwrap();

        assert_eq!(config.broker.servers, vec!["nats1:4433", "nats2:4433"]);
        assert_eq!(config.runtime.retry_interval_secs, 5);
        assert_eq!(config.runtime.ack_wait_secs, 60);
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "[broker\nservers = 1").unwrap();

        let backends: Vec<Box<dyn ConfigBackend>> = vec![Box::new(FileBackend::new(&path))];
        let err = load_config(&backends).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("Failed to parse")));
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();

        let backends: Vec<Box<dyn ConfigBackend>> = vec![Box::new(FileBackend::new(dir.path()))];
        let err = load_config(&backends).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("Failed to read")));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "[database]\nurl = \"sqlite://from-file.db\"\n").unwrap();

        let backends: Vec<Box<dyn ConfigBackend>> = vec![
            Box::new(FileBackend::new(&path)),
            Box::new(EnvBackend::from_pairs([
                ("FLEET_DATABASE_URL", "sqlite://from-env.db"),
                ("FLEET_OCSP_RESPONDERS", "http://ocsp1, ,http://ocsp2"),
            ])),
        ];
        let config = load_config(&backends).unwrap();

        assert_eq!(config.database.url, "sqlite://from-env.db");
        assert_eq!(
            config.certificates.ocsp_responders,
            vec!["http://ocsp1", "http://ocsp2"]
        );
    }

    #[test]
    fn non_numeric_interval_is_rejected() {
        let backends: Vec<Box<dyn ConfigBackend>> = vec![Box::new(EnvBackend::from_pairs([(
            "FLEET_RETRY_INTERVAL_SECS",
            "soon",
        )]))];
        assert!(load_config(&backends).is_err());
    }

    #[test]
    fn blank_environment_values_are_ignored() {
        let backends: Vec<Box<dyn ConfigBackend>> =
            vec![Box::new(EnvBackend::from_pairs([("FLEET_DATABASE_URL", "  ")]))];
        let config = load_config(&backends).unwrap();
        assert_eq!(config.database.url, "sqlite://fleet.db");
    }
}
