//! fencelink daemon
//!
//! Runs geofence action delivery, or a single headless trigger.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::clock::unix_now;
use daemon::config::{default_config_path, Config};
use daemon::gate::GateOutcome;
use daemon::gateways::{DiscoveryBroadcaster, GatewayRegistry};
use daemon::orchestrator::{DeliveryOrchestrator, OrchestratorEvent};
use daemon::store::{AccountStore, FileAccountStore};
use protocol::{Credential, FenceTrigger};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// fencelink - geofence-triggered home automation delivery.
#[derive(Parser, Debug)]
#[command(name = "fencelink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a daily rotated file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the delivery daemon until interrupted
    Run,

    /// Deliver one geofence trigger read from a JSON file
    Trigger {
        /// Trigger JSON file
        file: PathBuf,

        /// Seconds to keep running while retries are pending
        #[arg(long, default_value = "120")]
        wait: u64,
    },

    /// Broadcast a discovery probe and list the gateways that answer
    Discover {
        /// Milliseconds to collect replies
        #[arg(long, default_value = "2000")]
        listen_ms: u64,
    },

    /// Test local reachability of a configured gateway
    Probe {
        /// Gateway id
        id: u64,

        /// Use this LAN address instead of the cached one
        #[arg(long)]
        address: Option<String>,

        /// Use this local token instead of the cached one
        #[arg(long)]
        token: Option<String>,
    },

    /// Manage stored account credentials
    #[command(subcommand)]
    Account(AccountCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for account management.
#[derive(Subcommand, Debug, Clone)]
pub enum AccountCommands {
    /// Store a credential for an account
    SetToken {
        /// Account id
        user_id: String,

        #[arg(long)]
        access_token: String,

        #[arg(long)]
        refresh_token: String,

        /// Lifetime of the access token in seconds
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// List accounts with a stored credential
    List,
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let _log_guard = init_tracing(cli.verbose, &config.daemon.log_level, cli.log_file.as_deref())?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
        Commands::Config(ConfigCommands::Show) => {
            config.validate()?;
            print!("{}", config.to_toml()?);
        }
        Commands::Account(command) => {
            config.validate()?;
            run_account_command(&config, command)?;
        }
        Commands::Run => {
            config.validate()?;
            run_daemon(config).await?;
        }
        Commands::Trigger { file, wait } => {
            config.validate()?;
            run_trigger(config, &file, Duration::from_secs(wait)).await?;
        }
        Commands::Discover { listen_ms } => {
            config.validate()?;
            run_discover(&config, Duration::from_millis(listen_ms)).await?;
        }
        Commands::Probe { id, address, token } => {
            config.validate()?;
            run_probe(config, id, address, token).await?;
        }
    }

    Ok(())
}

/// Initializes tracing. The returned guard flushes the log file on drop.
fn init_tracing(
    verbose: bool,
    configured_level: &str,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { configured_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .context("--log-file must name a file")?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

fn run_account_command(config: &Config, command: AccountCommands) -> anyhow::Result<()> {
    let store = FileAccountStore::new(config.account_store_path());
    store.load()?;

    match command {
        AccountCommands::SetToken {
            user_id,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let mut credential = Credential::new(access_token, refresh_token);
            credential.expires_at = expires_in.map(|secs| unix_now() + secs);
            store.set_account_token(&user_id, credential)?;
            println!("Stored credential for {}", user_id);
        }
        AccountCommands::List => {
            let accounts = store.accounts();
            if accounts.is_empty() {
                println!("No accounts stored in {}", store.path().display());
            }
            for user_id in accounts {
                let tier = match store.get_entitlement(&user_id) {
                    Some(entitlement) if entitlement.allows_actions(unix_now()) => "premium",
                    Some(_) => "basic",
                    None => "unknown",
                };
                println!("{:<24} {}", user_id, tier);
            }
        }
    }
    Ok(())
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let orchestrator = DeliveryOrchestrator::from_config(config)?;
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    orchestrator.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

async fn run_trigger(config: Config, file: &Path, wait: Duration) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read trigger file: {}", file.display()))?;
    let trigger = FenceTrigger::from_json(&json)
        .with_context(|| format!("Failed to parse trigger file: {}", file.display()))?;

    let orchestrator = DeliveryOrchestrator::from_config(config)?;
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    let outcome = orchestrator.on_headless_trigger(trigger).await;
    println!("Trigger {:?}", outcome);

    if outcome == GateOutcome::Processed && !orchestrator.wait_idle(wait).await {
        tracing::warn!(
            pending = orchestrator.retries().len(),
            "Giving up on pending retries"
        );
    }
    orchestrator.stop().await?;
    Ok(())
}

async fn run_discover(config: &Config, listen: Duration) -> anyhow::Result<()> {
    let registry = Arc::new(GatewayRegistry::new());
    for gateway in &config.gateways {
        registry.register(gateway.to_state());
    }
    let discovery = DiscoveryBroadcaster::new(Arc::clone(&registry), config.discovery.settings());
    let mut replies = discovery.subscribe();

    discovery
        .auto_discover()
        .await
        .context("Failed to send discovery probe")?;

    let deadline = tokio::time::sleep(listen);
    tokio::pin!(deadline);
    let mut found = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            reply = replies.recv() => match reply {
                Ok(gateway) => {
                    found += 1;
                    let known = gateway
                        .gateway_id
                        .map(|id| format!("gateway {}", id))
                        .unwrap_or_else(|| "unregistered".to_string());
                    println!(
                        "{:<16} {:<18} {:<10} fw {:<8} {}",
                        gateway.from.ip(),
                        gateway.reply.mac,
                        gateway.reply.product,
                        gateway.reply.firmware,
                        known
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    discovery.close_socket();

    if found == 0 {
        println!("No gateways answered within {:?}", listen);
    }
    Ok(())
}

async fn run_probe(
    config: Config,
    id: u64,
    address: Option<String>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let orchestrator = DeliveryOrchestrator::from_config(config)?;
    orchestrator.wait_rehydrated().await;

    let registry = orchestrator.registry();
    if registry.get(id).is_none() {
        anyhow::bail!("Gateway {} is not listed in the configuration", id);
    }
    registry.update(id, |state| {
        if address.is_some() {
            state.address = address.clone();
        }
        if token.is_some() {
            state.local_token = token.clone();
            state.token_ttl = Some(u64::MAX);
        }
    });

    let outcome = orchestrator.reachability().test_gateway(id).await;
    println!("Gateway {}: {:?}", id, outcome);
    orchestrator.stop().await?;
    Ok(())
}

fn log_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::StateChanged(state) => {
            tracing::info!("Orchestrator state: {:?}", state);
        }
        OrchestratorEvent::TriggerHandled { event_id, outcome } => {
            tracing::info!(%event_id, ?outcome, "Trigger handled");
        }
        OrchestratorEvent::Delivery(delivery) => {
            tracing::info!(?delivery, "Delivery event");
        }
        OrchestratorEvent::GatewayDiscovered { gateway_id, address } => {
            tracing::info!(gateway_id, %address, "Gateway discovered");
        }
        OrchestratorEvent::MaintenanceCompleted { gateways, reachable } => {
            tracing::debug!(gateways, reachable, "Maintenance completed");
        }
        OrchestratorEvent::Error { message } => {
            tracing::error!("Orchestrator error: {}", message);
        }
    }
}
