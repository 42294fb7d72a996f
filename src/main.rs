//! router-fleetd: hub daemon for the router fleet
//!
//! Loads the configuration and router inventory, reinstalls the proxy port
//! forwards, then runs the peer sync and session reconcile jobs until
//! SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./router-fleetd
//!
//! # Run with custom configuration
//! sudo ./router-fleetd -c /path/to/config.json
//!
//! # Run with environment overrides
//! ROUTER_FLEET_LOG_LEVEL=debug sudo ./router-fleetd
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use router_fleet::alloc::{ProxyPortAllocator, TunnelAddressAllocator};
use router_fleet::api::{RouterApiClient, RouterOsTransport};
use router_fleet::config::{load_config_with_env, Config};
use router_fleet::lock::RouterLocks;
use router_fleet::nat::{IptablesFirewall, NatRuleManager};
use router_fleet::peer::{PeerLifecycleManager, WgCommandControl};
use router_fleet::reconcile::SessionReconciler;
use router_fleet::scheduler::Scheduler;
use router_fleet::store::MemoryStore;
use router_fleet::sync::SyncOrchestrator;
use router_fleet::system::{CommandRunner, ProcessRunner};

/// Maximum wait for in-flight jobs after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/router-fleet/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("router-fleetd v{}", router_fleet::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"router-fleetd v{}

Keeps a router fleet reachable over the hub tunnel and reconciles subscriber sessions.

USAGE:
    router-fleetd [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/router-fleet/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    ROUTER_FLEET_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    ROUTER_FLEET_INVENTORY      Override router inventory path
    ROUTER_FLEET_HUB_ADDRESS    Override hub tunnel address
    ROUTER_FLEET_WG_INTERFACE   Override hub WireGuard interface

REQUIREMENTS:
    - wg and iptables on PATH (or configured binaries)
    - CAP_NET_ADMIN (or root, or peer.use_sudo)
"#,
        router_fleet::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    match (config.log.format.as_str(), config.log.timestamps) {
        ("json", true) => subscriber.json().init(),
        ("json", false) => subscriber.json().without_time().init(),
        (_, true) => subscriber.init(),
        (_, false) => subscriber.without_time().init(),
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        router_fleet::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("router-fleetd v{}", router_fleet::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let store = Arc::new(
        MemoryStore::load_inventory(&config.store.inventory)
            .context("Failed to load router inventory")?,
    );
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(
        config.peer.use_sudo,
        config.peer.command_timeout(),
    ));

    // Forwarding
    let addresses = Arc::new(TunnelAddressAllocator::new(
        config.address_pool()?,
        store.clone(),
    ));
    let ports = Arc::new(ProxyPortAllocator::new(
        config.port_pool()?,
        config.hub.public_host.clone(),
        store.clone(),
    ));
    let nat = NatRuleManager::new(
        store.clone(),
        addresses,
        ports,
        Arc::new(IptablesFirewall::new(
            runner.clone(),
            config.nat.iptables_binary.clone(),
        )),
        config.hub.address,
        config.nat.management_port,
    );
    if config.nat.rebuild_on_start {
        match nat.rebuild_all().await {
            Ok(report) if !report.failed.is_empty() => {
                warn!(failed = ?report.failed, "Some forwards could not be reinstalled");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "NAT rebuild failed"),
        }
    }

    // Peers
    let peers = Arc::new(PeerLifecycleManager::new(
        store.clone(),
        Arc::new(WgCommandControl::new(
            runner,
            config.peer.wg_binary.clone(),
            config.peer.reload_command.clone(),
        )),
        Arc::new(RouterLocks::new(
            config.peer.lock_acquire_timeout(),
            config.peer.lock_hold_timeout(),
        )),
        config.hub.interface.clone(),
        config.peer.keepalive(),
    ));
    let sync = Arc::new(
        SyncOrchestrator::new(store.clone(), peers)
            .with_concurrency(config.scheduler.max_concurrency)
            .with_phase_timeout(config.scheduler.sync_phase_timeout())
            .with_retry(config.peer.retry),
    );

    // Sessions
    let client = Arc::new(RouterApiClient::new(
        store.clone(),
        Arc::new(RouterOsTransport::new()),
        config.api.settings(),
    ));
    let reconciler = Arc::new(
        SessionReconciler::new(store.clone(), store.clone(), store, client)
            .with_policy(config.reconcile.unreachable_policy)
            .with_concurrency(config.scheduler.max_concurrency)
            .with_retry(config.reconcile.fetch_retry),
    );

    let mut scheduler = Scheduler::new();
    if let Some(period) = config.scheduler.peer_sync_interval() {
        scheduler = scheduler.with_peer_sync(sync, period);
    }
    if let Some(period) = config.scheduler.reconcile_interval() {
        scheduler = scheduler.with_reconcile(reconciler, period);
    }
    let scheduler = Arc::new(scheduler);

    let jobs = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    scheduler.shutdown();
    match tokio::time::timeout(SHUTDOWN_GRACE, jobs).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Scheduler task failed"),
        Err(_) => warn!(grace = ?SHUTDOWN_GRACE, "Jobs still running at shutdown"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
