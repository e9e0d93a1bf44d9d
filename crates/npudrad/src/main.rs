//! npudrad: the npudra NPU node driver daemon.
//!
//! Single binary that assembles the driver:
//! - Device discovery and the vNPU partition manager
//! - Checkpoint store (redb)
//! - Device-state controller and CDI spec writer
//! - Device-class sync
//! - REST API
//!
//! # Usage
//!
//! ```text
//! npudrad run --config /etc/npudra/npudra.toml --port 8480
//! npudrad default-config > npudra.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use npudra_checkpoint::CheckpointStore;
use npudra_core::DriverConfig;
use npudra_partition::TemplateCatalog;
use npudra_plugin::{
    CdiSpecWriter, DeviceState, FileDeviceClassClient, StateConfig, StaticDeviceManager,
    enumerate_devices, sync_device_classes,
};

#[derive(Parser)]
#[command(name = "npudrad", about = "npudra NPU node driver daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the driver.
    Run {
        /// Path to the driver config (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port the REST API listens on.
        #[arg(long, default_value = "8480")]
        port: u16,

        /// Override the plugin data directory from the config.
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
    },
    /// Print the default config as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,npudrad=debug,npudra=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            plugin_dir,
        } => run(config, port, plugin_dir).await,
        Command::DefaultConfig => {
            print!("{}", DriverConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(
    config_path: Option<PathBuf>,
    port: u16,
    plugin_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => DriverConfig::from_file(path)?,
        None => DriverConfig::default(),
    };
    if let Some(dir) = plugin_dir {
        config.plugin_dir = dir;
    }
    let node_name = config.resolved_node_name();
    info!(
        driver = %config.driver_name,
        node = %node_name,
        partitioning = config.enable_partitioning,
        "npudra driver starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(&config.plugin_dir)?;
    let db_path = config.checkpoint_db_path();
    let store = CheckpointStore::open(&db_path)?;
    info!(path = ?db_path, "checkpoint store opened");

    let catalog = TemplateCatalog::from_config(config.templates.as_deref(), config.families.as_deref());
    let device_manager = StaticDeviceManager::new(config.devices.clone());
    let found = enumerate_devices(
        &device_manager,
        catalog,
        &config.driver_name,
        &node_name,
        config.enable_partitioning,
    )?;
    info!(devices = found.inventory.len(), "device discovery complete");

    let cdi = CdiSpecWriter::new(&config.cdi_root, &config.driver_name, &node_name);
    let partitions = found.partitions.clone();
    let state = Arc::new(DeviceState::new(
        StateConfig {
            driver_name: config.driver_name.clone(),
            node_name: node_name.clone(),
        },
        found.inventory,
        found.partitions,
        Box::new(cdi),
        Box::new(store),
    )?);
    info!("device state initialized");

    // ── Device classes ─────────────────────────────────────────

    let sync_handle = match partitions {
        Some(partitions) => {
            let dir = config.device_class_path();
            let driver_name = config.driver_name.clone();
            info!(path = ?dir, "device class sync starting");
            Some(tokio::task::spawn_blocking(move || {
                let client = FileDeviceClassClient::new(dir);
                sync_device_classes(&partitions, &driver_name, &client)
            }))
        }
        None => {
            info!("partitioning disabled, device class sync skipped");
            None
        }
    };

    // ── Start API server ───────────────────────────────────────

    let router = npudra_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    if let Some(handle) = sync_handle
        && let Err(e) = handle.await
    {
        warn!(error = %e, "device class sync task failed");
    }

    info!("npudra driver stopped");
    Ok(())
}
