use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use component_replicator::client::oci::{CredentialStore, OciComponentClient};
use component_replicator::config::{self, ReplicatorConfig};
use component_replicator::replication::driver::ReconcileDriver;
use component_replicator::scheduler::Scheduler;
use component_replicator::store::{SqliteStateStore, StateStore};

#[derive(Parser)]
#[command(name = "component-replicator")]
#[command(version, about = "Replicates versioned components between OCI registries")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "replicator.json")]
    config: PathBuf,

    /// Talk to registries over plain HTTP (local registries only)
    #[arg(long)]
    insecure_http: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration file and exit
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::CheckConfig) => {
            let config = ReplicatorConfig::load(&cli.config)?;
            println!(
                "configuration OK: {} subscription(s), {} credentials entries",
                config.subscriptions.len(),
                config.credentials.len()
            );
            Ok(())
        }
        None => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run(cli.config, cli.insecure_http)),
    }
}

async fn run(config_path: PathBuf, insecure_http: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ReplicatorConfig::load(&config_path)?;
    let subscriptions = config.subscriptions();
    info!(
        subscriptions = subscriptions.len(),
        config = %config_path.display(),
        "configuration loaded"
    );

    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(SqliteStateStore::new(&config::db_path())?) as Arc<dyn StateStore>;

    let mut client = OciComponentClient::new(CredentialStore::new(config.credentials.clone()));
    if insecure_http {
        client = client.with_insecure_http();
    }

    let driver = Arc::new(ReconcileDriver::new(Arc::new(client), store));
    let scheduler = Scheduler::new(driver);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(subscriptions, shutdown_rx).await;
    info!("all reconcile loops stopped");

    Ok(())
}
