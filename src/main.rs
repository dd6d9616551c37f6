use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use watts_bridge::device::DeviceConfig;
use watts_bridge::mqtt::broker_proxy::MqttBrokerProxy;
use watts_bridge::mqtt::{DefaultConnectorFactory, SharedHostBroker, TransportKind};
use watts_bridge::{Bridge, BridgeConfig, BridgeHandle};

/// MQTT bridge for power meters
#[derive(Parser, Debug)]
#[command(name = "watts-bridge")]
#[command(version)]
struct Args {
    /// Configuration file path, defaults to ~/.config/watts-bridge/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed the configured devices (default)
    Run,

    /// Watch the bus for meters and print the candidates
    Discover {
        /// Add the found meters to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    let path = args.config.unwrap_or_else(BridgeConfig::default_path);
    let config = BridgeConfig::ensure_default_config(&path).await?;
    info!("Using config {}", path.display());

    let cancel = CancellationToken::new();
    let proxy = match config.connection.transport {
        TransportKind::HostManaged => Some(
            MqttBrokerProxy::start(&config.connection)
                .map_err(|e| eyre!("Failed to start broker proxy: {}", e))?,
        ),
        TransportKind::Direct => None,
    };
    let host = proxy.clone().map(|proxy| SharedHostBroker::new(proxy));
    let factory = DefaultConnectorFactory::new(host);

    let (bridge, bridge_task) =
        Bridge::spawn(config.bridge_options(), Arc::new(factory), cancel.clone());
    if let Err(e) = bridge.connect().await {
        warn!("Initial connect failed, retrying on the next health check: {}", e);
    }

    let result = match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_devices(&bridge, &config, cancel.clone()).await,
        Commands::Discover { save } => discover(&bridge, config, &path, save).await,
    };

    if let Err(e) = bridge.shutdown().await {
        warn!("Bridge already stopped: {}", e);
    }
    cancel.cancel();
    if let Err(e) = bridge_task.await {
        error!("Bridge task ended abnormally: {}", e);
    }
    if let Some(proxy) = proxy {
        proxy.shutdown().await;
    }
    result
}

async fn run_devices(
    bridge: &BridgeHandle,
    config: &BridgeConfig,
    cancel: CancellationToken,
) -> Result<()> {
    if config.devices.is_empty() {
        warn!("No devices configured, run `watts-bridge discover --save` first");
    }

    let pattern = config.discovery.topic_pattern();
    let (updates_tx, mut updates) = mpsc::channel(64);
    let mut device_tasks = Vec::new();
    for device in &config.devices {
        let meter = device.device(&pattern);
        let topic = meter.topic().to_string();
        let (sink, task) = meter.spawn(updates_tx.clone(), cancel.child_token());
        bridge
            .register_topic(topic, sink)
            .await
            .map_err(|e| eyre!("Failed to register device {}: {}", device.id, e))?;
        device_tasks.push(task);
    }
    drop(updates_tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            update = updates.recv() => match update {
                Some(update) => info!("{}: {:?}", update.device_id, update.values),
                None => break,
            },
        }
    }

    cancel.cancel();
    for task in device_tasks {
        if let Err(e) = task.await {
            error!("Device task ended abnormally: {}", e);
        }
    }
    Ok(())
}

async fn discover(
    bridge: &BridgeHandle,
    mut config: BridgeConfig,
    path: &Path,
    save: bool,
) -> Result<()> {
    let known: BTreeSet<String> = config
        .devices
        .iter()
        .map(|device| device.topic(&config.discovery.topic_pattern()))
        .collect();

    info!("Searching for meters on {}", config.discovery.pattern);
    let outcome = bridge
        .start_discovery(known)
        .await
        .map_err(|e| eyre!("Failed to start discovery: {}", e))?;
    let candidates = tokio::select! {
        result = outcome.complete() => result.map_err(|e| eyre!("Discovery failed: {}", e))?,
        _ = tokio::signal::ctrl_c() => return Err(eyre!("Discovery interrupted")),
    };

    println!("{}", serde_json::to_string_pretty(&candidates)?);

    if save && !candidates.is_empty() {
        let pattern = config.discovery.topic_pattern();
        for candidate in candidates {
            let derived = pattern.topic_for(&candidate.id);
            let topic = (candidate.topic != derived).then_some(candidate.topic);
            config.devices.push(DeviceConfig {
                id: candidate.id,
                topic,
                capabilities: candidate.capabilities,
            });
        }
        config.save(path).await?;
        info!("Saved {} devices to {}", config.devices.len(), path.display());
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
