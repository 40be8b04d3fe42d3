//! sensorgate - BLE sensor gateway.
//!
//! Run with: `cargo run -p sensorgate-service`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sensorgate_core::{
    BtleTransport, CloudApi, CloudClientConfig, HttpCloudClient, Transport, UpgradeJob,
    UpgradeManager,
};
use sensorgate_service::{Config, Gateway, telemetry};
use sensorgate_store::{SharedStore, Store};

/// sensorgate - BLE sensor gateway with OTA firmware upgrades.
#[derive(Parser, Debug)]
#[command(name = "sensorgate")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Cloud API URL (overrides config).
    #[arg(long, global = true)]
    cloud_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway in the foreground (default behavior).
    Run,

    /// Query the firmware version of a device.
    Version {
        /// Device id from the configuration.
        device: String,
    },

    /// Flash a local firmware image onto a device.
    Flash {
        /// Device id from the configuration.
        device: String,
        /// Firmware image file.
        image: PathBuf,
    },

    /// Show known devices, upgrade records and queued reports.
    Status {
        /// Print the full store as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Deliver queued cloud reports and exit.
    Replay,

    /// Validate the configuration file and print it.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sensorgate=info".parse()?)
                .add_directive("sensorgate_core=info".parse()?)
                .add_directive("sensorgate_service=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Run) | None => run(config).await,
        Some(Command::Version { device }) => version(config, &device).await,
        Some(Command::Flash { device, image }) => flash(config, &device, image).await,
        Some(Command::Status { json }) => status(&config, json),
        Some(Command::Replay) => replay(config).await,
        Some(Command::CheckConfig) => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    if let Some(url) = &args.cloud_url {
        config.cloud.url = Some(url.clone());
    }

    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Arc<SharedStore>> {
    let store = Store::open(&config.storage.path)
        .with_context(|| format!("opening database {}", config.storage.path.display()))?;
    Ok(Arc::new(SharedStore::new(store)))
}

fn cloud_client(config: &Config) -> anyhow::Result<Option<Arc<HttpCloudClient>>> {
    let Some(url) = &config.cloud.url else {
        info!("No cloud URL configured, upgrades disabled");
        return Ok(None);
    };
    let mut client_config = CloudClientConfig::new(url, &config.storage.firmware_dir);
    if let Some(key) = &config.cloud.api_key {
        client_config = client_config.api_key(key);
    }
    Ok(Some(Arc::new(HttpCloudClient::new(client_config)?)))
}

async fn build_gateway(
    config: Config,
) -> anyhow::Result<(Gateway, Option<Arc<HttpCloudClient>>)> {
    let store = open_store(&config)?;
    let cloud = cloud_client(&config)?;
    if let Some(client) = &cloud {
        client.probe().await;
    }
    let transport: Arc<dyn Transport> = BtleTransport::new().await?;
    let gateway = Gateway::new(
        config,
        transport,
        store,
        cloud.clone().map(|c| c as Arc<dyn CloudApi>),
    )?;
    Ok((gateway, cloud))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let probe_interval = config.cloud.probe_interval();
    let (gateway, cloud) = build_gateway(config).await?;
    let shutdown = CancellationToken::new();

    let logger = telemetry::spawn_logger(gateway.events().clone(), shutdown.clone());
    gateway.start().await?;

    if let (Some(client), Some(manager)) = (cloud, gateway.upgrades().cloned()) {
        tokio::spawn(probe_loop(client, manager, probe_interval, shutdown.clone()));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Gateway running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_command(&gateway, &line).await,
                // stdin closed; keep running until interrupted
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    warn!("Failed to read command: {}", e);
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    shutdown.cancel();
    gateway.shutdown().await;
    let _ = logger.await;
    Ok(())
}

async fn handle_command(gateway: &Gateway, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let job: UpgradeJob = match serde_json::from_str(line) {
        Ok(job) => job,
        Err(e) => {
            warn!("Ignoring malformed upgrade command: {}", e);
            return;
        }
    };
    let transaction = job.transaction_id.clone();
    match gateway.submit(job).await {
        Ok(disposition) => info!(%transaction, ?disposition, "Upgrade command handled"),
        Err(e) => warn!(%transaction, "Upgrade command failed: {}", e),
    }
}

/// Probe the cloud periodically and replay queued reports on reconnection.
async fn probe_loop(
    client: Arc<HttpCloudClient>,
    manager: Arc<UpgradeManager>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut was_reachable = client.is_reachable();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let reachable = client.probe().await;
        if reachable != was_reachable {
            info!(reachable, "Cloud reachability changed");
        }
        if reachable
            && !was_reachable
            && let Err(e) = manager.on_reachability_changed(true).await
        {
            warn!("Failed to replay queued reports: {}", e);
        }
        was_reachable = reachable;
    }
}

async fn version(config: Config, device_id: &str) -> anyhow::Result<()> {
    let (gateway, _) = build_gateway(config).await?;
    gateway.device(device_id)?.enable().await?;
    let version = gateway.query_version(device_id).await?;
    println!("{}: {}", device_id, version);
    gateway.shutdown().await;
    Ok(())
}

async fn flash(config: Config, device_id: &str, image: PathBuf) -> anyhow::Result<()> {
    let (gateway, _) = build_gateway(config).await?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = gateway.flash(device_id, &image, &cancel).await;
    gateway.shutdown().await;
    let report = result?;
    println!(
        "Flashed {} bytes to {} (crc {:08x})",
        report.bytes_sent, device_id, report.crc
    );
    Ok(())
}

fn status(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = Store::open(&config.storage.path)?;
    if json {
        println!("{}", store.export_json()?);
        return Ok(());
    }

    let snapshot = store.snapshot()?;
    println!("Devices:");
    for device in &snapshot.devices {
        println!(
            "  {:<12} {:<20} {:<10} {}",
            device.id,
            device.name,
            device.family.to_string(),
            device.firmware.as_deref().unwrap_or("-")
        );
    }
    println!("Upgrades:");
    for upgrade in &snapshot.upgrades {
        println!(
            "  {:<12} {:<12} {}",
            upgrade.device_id,
            upgrade.state.as_str(),
            upgrade.error_message.as_deref().unwrap_or("")
        );
    }
    println!("Queued reports: {}", snapshot.pending.len());
    for pending in &snapshot.pending {
        println!("  {} {}", pending.transaction_id, pending.outcome.as_str());
    }
    Ok(())
}

async fn replay(config: Config) -> anyhow::Result<()> {
    if config.cloud.url.is_none() {
        anyhow::bail!("replay needs a cloud URL");
    }
    let (gateway, cloud) = build_gateway(config).await?;
    if let Some(client) = cloud
        && !client.is_reachable()
    {
        anyhow::bail!("cloud at {} is not reachable", client.base_url());
    }

    let delivered = gateway.on_reachability_changed(true).await?;
    println!("Delivered {} queued report(s)", delivered);
    Ok(())
}
