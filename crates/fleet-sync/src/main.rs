//! HAProxy fleet-sync daemon.
//!
//! Polls a cloud provider's instance fleet and keeps an HAProxy Dataplane
//! backend/server set in sync with it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_sync::config::ProviderConfig;
use fleet_sync::dataplane::HttpDataplaneClient;
use fleet_sync::discovery::{AzureDiscoveryClient, DiscoveryClient, Ec2DiscoveryClient};
use fleet_sync::{config, DaemonLoop};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(name = "fleet-sync", version, about = "Keeps HAProxy in sync with a cloud instance fleet")]
struct Args {
    /// Path to the YAML configuration file.
    #[clap(short, long, default_value = "/etc/fleet-sync/config.yaml")]
    config: PathBuf,

    /// Load and validate configuration only; no network I/O.
    #[clap(long)]
    validate: bool,

    /// Run a single reconciliation cycle and exit.
    #[clap(long)]
    once: bool,

    /// Raise log verbosity to debug, mirroring this codebase's other CLIs.
    #[clap(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let loaded = config::load(&args.config);

    if args.validate {
        return match loaded {
            Ok(_) => {
                println!("configuration is valid");
                Ok(())
            }
            Err(err) => {
                eprintln!("configuration error: {err}");
                std::process::exit(1);
            }
        };
    }

    let fleet_config = match loaded {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&fleet_config.logging, args.debug);

    info!(version = env!("CARGO_PKG_VERSION"), "starting fleet-sync");

    let config = Arc::new(fleet_config);
    let discovery = build_discovery_client(&config)?;
    let dataplane = Arc::new(HttpDataplaneClient::new(&config.haproxy).context("building dataplane client")?);
    let mut daemon = DaemonLoop::new(config, discovery, dataplane);

    if args.once {
        return match daemon.run_once().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "reconcile cycle failed");
                std::process::exit(1);
            }
        };
    }

    if let Err(err) = daemon.run_forever().await {
        error!(error = %err, "daemon loop exited with error");
        std::process::exit(1);
    }

    info!("fleet-sync stopped");
    Ok(())
}

fn build_discovery_client(config: &Arc<config::FleetSyncConfig>) -> Result<Arc<dyn DiscoveryClient>> {
    match &config.provider {
        ProviderConfig::Azure { subscription_id, resource_group, vmss_names } => {
            let client = AzureDiscoveryClient::new(subscription_id.clone(), resource_group.clone(), vmss_names.clone())
                .context("building Azure discovery client")?;
            Ok(Arc::new(client))
        }
        ProviderConfig::Aws { region, asg_names } => {
            let client = Ec2DiscoveryClient::new(region.clone(), asg_names.clone()).context("building EC2 discovery client")?;
            Ok(Arc::new(client))
        }
    }
}

fn init_logging(logging: &config::LoggingConfig, debug: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if debug { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fleet_sync={level}").parse().expect("valid filter directive"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
