//! Proxyward admin CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use proxyward::cidr::AddressRange;
use proxyward::config::Config;
use proxyward::deferred::DeferredActionQueue;
use proxyward::exempt::ExemptionStore;
use proxyward::lookup::HttpReputationLookup;
use proxyward::pipeline::{CheckPipeline, CheckRequest, Principal};
use proxyward::runtime::{ConsoleRuntime, HostRuntime};
use proxyward::storage::open_backend;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "proxyward")]
#[command(about = "Screen connecting users against IP reputation data - VPN/proxy and country checks with exemptions")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "proxyward.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a reputation check for an address
    Check {
        address: Ipv4Addr,

        /// Principal name to attribute the check to
        #[arg(long, default_value = "console")]
        name: String,
    },

    /// Manage exemptions
    Exempt {
        #[command(subcommand)]
        action: ExemptAction,
    },

    /// Toggle alert notifications for a principal
    Alerts {
        principal: Uuid,

        #[arg(long)]
        enabled: bool,
    },

    /// Clear both response cache layers
    ClearCache,
}

#[derive(Subcommand, Debug)]
enum ExemptAction {
    /// Exempt a principal
    AddPrincipal { id: Uuid },

    /// Remove a principal exemption
    RemovePrincipal { id: Uuid },

    /// Exempt an address or CIDR range
    AddRange { cidr: String },

    /// Remove an address range exemption
    RemoveRange { cidr: String },

    /// List all exemptions
    List,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let Some(command) = args.command else {
        info!("No command given, see --help");
        return Ok(());
    };

    // Connect the backend and bring its schema up to date before anything
    // touches it.
    let backend = if config.database.enabled {
        let backend = open_backend(&config.database)?;
        let init = Arc::clone(&backend);
        tokio::task::spawn_blocking(move || init.init()).await??;
        Some(backend)
    } else {
        None
    };

    let store = Arc::new(match &backend {
        Some(backend) => ExemptionStore::with_backend(Arc::clone(backend)),
        None => ExemptionStore::in_memory(),
    });

    if backend.is_some() {
        // Seed the snapshot so this process sees durable exemptions at once.
        let seed = Arc::clone(&store);
        tokio::task::spawn_blocking(move || seed.refresh()).await??;
        let _refresh = store.start_refresh();
    }

    let runtime: Arc<dyn HostRuntime> = Arc::new(ConsoleRuntime);
    let deferred = Arc::new(DeferredActionQueue::default());
    let _scan = deferred.start(Arc::clone(&runtime));

    let lookup = Arc::new(HttpReputationLookup::new(&config.api));
    let pipeline = Arc::new(CheckPipeline::new(
        config,
        Arc::clone(&store),
        backend.clone(),
        lookup,
        runtime,
        Arc::clone(&deferred),
    ));

    match command {
        Command::Check { address, name } => {
            let request = CheckRequest {
                principal: Principal {
                    id: Uuid::new_v4(),
                    name,
                    addr: address,
                },
                has_bypass: false,
            };

            let handle = pipeline.check(request);
            info!(verdict = ?handle.immediate.verdict, "immediate outcome");

            match handle.completion.await {
                Ok(outcome) => {
                    println!("{}: {:?}", address, outcome.verdict);
                    if let Some(r) = outcome.reputation {
                        println!(
                            "  country: {} ({})  city: {}  isp: {}  asn: {}  proxy: {}",
                            r.country_name, r.country_code, r.city, r.isp, r.asn, r.is_proxy
                        );
                    }
                }
                Err(_) => println!("{}: check did not complete", address),
            }
        }

        Command::Exempt { action } => match action {
            ExemptAction::AddPrincipal { id } => {
                store.add_principal(id)?;
                println!("exempted principal {id}");
            }
            ExemptAction::RemovePrincipal { id } => {
                store.remove_principal(&id)?;
                println!("removed principal exemption {id}");
            }
            ExemptAction::AddRange { cidr } => {
                let range = AddressRange::parse(&cidr)?;
                store.add_range(range)?;
                println!("exempted range {range}");
            }
            ExemptAction::RemoveRange { cidr } => {
                let range = AddressRange::parse(&cidr)?;
                store.remove_range(&range)?;
                println!("removed range exemption {range}");
            }
            ExemptAction::List => {
                for id in store.list_principals() {
                    println!("principal {id}");
                }
                for range in store.list_ranges() {
                    println!("range {range}");
                }
            }
        },

        Command::Alerts { principal, enabled } => {
            let Some(backend) = &backend else {
                anyhow::bail!("alert flags require a database backend");
            };
            let flag = Arc::clone(backend);
            tokio::task::spawn_blocking(move || flag.set_alert_flag(&principal, enabled))
                .await??;
            println!(
                "alerts for {principal}: {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }

        Command::ClearCache => {
            pipeline.clear_response_cache()?;
            println!("response caches cleared");
        }
    }

    if let Some(backend) = &backend {
        backend.shutdown();
    }
    deferred.drain();

    Ok(())
}
