//! Fleet worker binary
//!
//! `fleet-worker <agents|cert-manager|notifications> <start|stop>`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use fleet_core::config::{WorkerConfig, default_backends, load_config, split_list};
use fleet_crypto::LocalAuthority;
use fleet_worker::bootstrap::{BootstrapSequencer, NatsConnector, Subscriber, UrlStoreConnector};
use fleet_worker::pidfile::PidFile;
use fleet_worker::report::{DnsResolver, broker_domain};
use fleet_worker::scheduler::RetryScheduler;
use fleet_worker::storage::ServerIdentity;
use fleet_worker::workers::{
    AgentsWorker, CertManagerWorker, NotificationsWorker, SmtpMailerFactory, WorkerKind,
};

const DEFAULT_NATS_PORT: u16 = 4433;

#[derive(Parser, Debug)]
#[command(name = "fleet-worker")]
#[command(version, about = "Fleet workers - agent reports, certificates and notifications")]
struct Cli {
    /// Worker to run
    #[arg(value_enum)]
    worker: WorkerKind,

    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to the platform location)
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "FLEET_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "FLEET_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker until interrupted
    Start(StartArgs),
    /// Signal the running worker recorded in the pid file
    Stop,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// CA certificate (PEM) used to verify the broker and sign certificates
    #[arg(long, env = "CA_CRT_PATH")]
    cacert: Option<PathBuf>,

    /// Worker client certificate (PEM)
    #[arg(long, env = "CERT_PATH")]
    cert: Option<PathBuf>,

    /// Worker client private key (PEM)
    #[arg(long, env = "KEY_PATH")]
    key: Option<PathBuf>,

    /// Broker hosts, comma separated
    #[arg(long, env = "NATS_SERVERS")]
    nats_host: Option<String>,

    /// Broker port
    #[arg(long, env = "NATS_PORT")]
    nats_port: Option<u16>,

    /// Database URL
    #[arg(long, env = "DATABASE_URL")]
    dburl: Option<String>,

    /// CA private key (cert-manager only)
    #[arg(long, env = "CA_KEY_PATH")]
    cakey: Option<PathBuf>,

    /// OCSP responder URLs, comma separated (cert-manager only)
    #[arg(long, env = "OCSP")]
    ocsp: Option<String>,
}

impl StartArgs {
    /// CLI flags win over every other configuration source.
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(path) = &self.cacert {
            config.broker.ca_cert.clone_from(path);
        }
        if let Some(path) = &self.cert {
            config.broker.client_cert.clone_from(path);
        }
        if let Some(path) = &self.key {
            config.broker.client_key.clone_from(path);
        }
        if let Some(hosts) = &self.nats_host {
            let port = self.nats_port.unwrap_or(DEFAULT_NATS_PORT);
            config.broker.servers = split_list(hosts)
                .into_iter()
                .map(|host| format!("{host}:{port}"))
                .collect();
        }
        if let Some(url) = &self.dburl {
            config.database.url.clone_from(url);
        }
        if let Some(path) = &self.cakey {
            config.certificates.ca_key.clone_from(path);
        }
        if let Some(ocsp) = &self.ocsp {
            config.certificates.ocsp_responders = split_list(ocsp);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("fleet_worker={},fleet_core={}", cli.log_level, cli.log_level);
    fleet_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let mut config = load_config(&default_backends(cli.config.as_deref()))
        .context("Could not load configuration")?;
    let pid_file = PidFile::new(config.runtime.pid_file.clone());

    match cli.command {
        Command::Stop => {
            let pid = pid_file
                .stop()
                .with_context(|| format!("Could not stop the {} worker", cli.worker))?;
            info!(worker = %cli.worker, pid, "Stop signal sent");
            Ok(())
        }
        Command::Start(args) => {
            args.apply(&mut config);
            run(cli.worker, config, &pid_file).await
        }
    }
}

async fn run(kind: WorkerKind, config: WorkerConfig, pid_file: &PidFile) -> anyhow::Result<()> {
    let hostname = hostname()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %kind,
        %hostname,
        servers = %config.broker.servers.join(","),
        "Starting fleet-worker"
    );

    let subscriber = build_worker(kind, &config)?;
    let sequencer = Arc::new(BootstrapSequencer::new(
        RetryScheduler::new(config.runtime.retry_interval()),
        Arc::new(UrlStoreConnector {
            url: config.database.url.clone(),
        }),
        Arc::new(NatsConnector {
            config: config.broker.clone(),
        }),
        ServerIdentity::current(&hostname),
        config.runtime.consumer_lifetime(),
    ));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let outcome = sequencer.start(subscriber).await;
    info!(?outcome, "Bootstrap started");

    pid_file
        .write_current()
        .context("Could not write pid file")?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    sequencer.shutdown().await;
    if let Err(e) = pid_file.remove() {
        warn!(error = %e, "Could not remove pid file");
    }
    Ok(())
}

fn build_worker(kind: WorkerKind, config: &WorkerConfig) -> anyhow::Result<Arc<dyn Subscriber>> {
    let ack_wait = config.runtime.ack_wait();
    let worker: Arc<dyn Subscriber> = match kind {
        WorkerKind::Agents => Arc::new(AgentsWorker::new(
            Arc::new(DnsResolver),
            broker_domain(&config.broker.servers),
        )),
        WorkerKind::CertManager => {
            let authority =
                LocalAuthority::load(&config.broker.ca_cert, &config.certificates.ca_key)
                    .context("Could not load CA material")?;
            Arc::new(CertManagerWorker::new(
                Arc::new(authority),
                config.certificates.ocsp_responders.clone(),
                config.certificates.default_bundle_password.clone(),
                ack_wait,
            ))
        }
        WorkerKind::Notifications => {
            Arc::new(NotificationsWorker::new(Arc::new(SmtpMailerFactory), ack_wait))
        }
    };
    Ok(worker)
}

#[cfg(unix)]
fn hostname() -> anyhow::Result<String> {
    let name = nix::unistd::gethostname().context("Could not read hostname")?;
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn hostname() -> anyhow::Result<String> {
    std::env::var("COMPUTERNAME").context("Could not read hostname")
}
