use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fwdproxy::config::{Config, ConfigManager};
use fwdproxy::graceful_shutdown::wait_for_signal;
use fwdproxy::supervisor::ServiceSupervisor;

#[derive(Parser)]
#[command(name = "fwdproxy")]
#[command(about = "A caching forward HTTP/HTTPS proxy")]
struct Args {
    /// Configuration file; a missing file runs with defaults
    #[arg(short, long, env = "FWDPROXY_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Validate a configuration file and exit
    #[arg(long, value_name = "PATH")]
    validate: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fwdproxy={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = args.validate {
        return validate_config(&path).await;
    }

    info!("Starting fwdproxy");

    let mut config_manager = ConfigManager::new(&args.config).await?;
    let (reload_tx, reload_rx) = mpsc::channel(1);
    config_manager.set_notifier(reload_tx);
    if let Err(e) = config_manager.start_hot_reload() {
        error!("Hot reload unavailable, configuration changes need a restart: {}", e);
    }

    let supervisor = ServiceSupervisor::new(Arc::new(config_manager.snapshot()));
    supervisor.start_services().await;

    supervisor
        .run(reload_rx, async {
            wait_for_signal().await;
        })
        .await;

    info!("fwdproxy shutdown complete");
    Ok(())
}

async fn validate_config(path: &Path) -> Result<()> {
    match Config::from_file_with_env(path).await {
        Ok(config) => {
            println!("Configuration {:?} is valid", path);
            println!("  listen address: {}", config.listen_addr());
            println!("  forward proxy:  {}", config.http.forward_proxy.enabled);
            println!(
                "  cache:          {}",
                config.http.forward_proxy.cache.enabled
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration {:?} is invalid: {:#}", path, e);
            std::process::exit(1);
        }
    }
}
