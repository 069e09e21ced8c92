//! labsrv entry point

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use common::logging::{parse_level, resolve_log_root};
use common::{init_with_config, wait_for_shutdown, LogConfig};
use labsrv::{ConfigManager, ConnectionManager, MessageInterpreter, SqliteResultStore};

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(
    name = "labsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Laboratory Analyzer Interface Service",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long, env = "LABSRV_CONFIG", default_value = "config/labsrv.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_manager = ConfigManager::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    let service = config_manager.service_config();

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: resolve_log_root(service.log_dir.as_deref()),
        level: parse_level(args.log_level.as_deref().unwrap_or(&service.log_level)),
        ansi: !args.no_color,
        enable_file: service.log_to_file && !args.validate,
    };
    init_with_config(&log_config)?;

    info!(
        "Starting {} v{} with {}",
        service.name,
        env!("CARGO_PKG_VERSION"),
        args.config
    );

    if args.validate {
        info!(
            "Configuration valid: {} instrument(s), {} enabled",
            config_manager.instruments().len(),
            config_manager.enabled_instruments().count()
        );
        return Ok(());
    }

    let storage = config_manager.storage_config();
    let store = SqliteResultStore::open(&storage.sqlite_path)
        .await
        .with_context(|| format!("Failed to open result store {}", storage.sqlite_path))?;

    let manager = ConnectionManager::new(
        config_manager.connection_settings().clone(),
        MessageInterpreter::default(),
        Arc::new(store),
    );

    let mut started = 0;
    for instrument in config_manager.enabled_instruments() {
        match manager.connect(instrument.to_params()) {
            Ok(key) => {
                info!("Instrument {} ({})", instrument.display_name(), key);
                started += 1;
            },
            Err(e) => error!("Instrument {} not started: {}", instrument.id, e),
        }
    }
    if started == 0 {
        warn!("No instruments enabled, waiting for shutdown");
    }

    wait_for_shutdown().await;
    info!("Shutdown requested");
    manager.shutdown_all().await;
    info!("{} stopped", service.name);
    Ok(())
}
