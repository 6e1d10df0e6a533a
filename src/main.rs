mod admin;
mod cache;
mod cli;
mod config;
mod drain;
mod error;
mod ingress;
#[cfg(test)]
mod integration_tests;
mod metrics;
mod registry;
mod router;
mod secrets;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drain::DrainCoordinator;
use ingress::Ingress;
use registry::AtomicRegistry;
use router::Router;
use router::policy::RoutingPolicy;
use secrets::SecretResolver;
use transport::manager::TransportManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // A panic anywhere (including a spawned task) must never fall through
    // to the default handler, which can write to stdout and corrupt the
    // stdio ingress's JSON-RPC framing. Log to stderr and exit with the
    // dedicated panic exit code instead.
    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!(panic = %panic_info, "only1mcp panicked");
        std::process::exit(error::exit_code::PANIC);
    }));

    config::load_dotenv();

    let mut config = match config::Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config {}: {e:#}", cli.config.display());
            std::process::exit(error::exit_code::FATAL_STARTUP);
        }
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }

    // Logs go to stderr only: the HTTP ingress doesn't care, but the
    // optional stdio ingress shares the process and must keep stdout clean
    // for JSON-RPC framing.
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_ansi(false).init();

    info!(config_path = %cli.config.display(), backends = config.backends.len(), "only1mcp starting");

    let resolver = Arc::new(SecretResolver::with_defaults(config.secrets.strict));

    let registry = Arc::new(AtomicRegistry::new(config.router.virtual_nodes));
    if let Err(e) = registry.apply_update(config.to_descriptors(), Default::default()).await {
        eprintln!("initial backend set rejected: {e:#}");
        std::process::exit(error::exit_code::FATAL_STARTUP);
    }

    let transports = TransportManager::new(Arc::clone(&resolver));
    transports.reconcile(&registry.current_snapshot()).await;

    let drain = DrainCoordinator::new();
    let drain_timeout = Duration::from_secs(config.drain_timeout_secs);
    let policy = RoutingPolicy::parse(&config.router.policy);
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        drain.clone(),
        transports.clone(),
        policy,
        config.router.failure_threshold,
        config.router.success_threshold,
        Duration::from_secs(config.router.circuit_open_secs),
    ));

    let cache_path = config.cache_path.clone().unwrap_or_else(|| config::only1mcp_home().join("cache.json"));
    let ingress = Arc::new(Ingress::new(
        Arc::clone(&registry),
        Arc::clone(&router),
        transports.clone(),
        Some(cache_path),
    ));
    ingress.preload_tool_cache().await;
    tokio::spawn(Arc::clone(&ingress).run_change_listener());

    let shutdown = Arc::new(tokio::sync::Notify::new());

    {
        let router = Arc::clone(&router);
        let registry = Arc::clone(&registry);
        let transports = transports.clone();
        let drain = drain.clone();
        let health_config = config.health.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            router::health::run(router, registry, transports, drain, health_config, shutdown).await;
        });
    }

    {
        let registry = Arc::clone(&registry);
        let transports = transports.clone();
        let drain = drain.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            transport::manager::run_reconciler(registry, transports, drain, drain_timeout, shutdown).await;
        });
    }

    {
        let config_path = cli.config.clone();
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            config::watch_config(config_path, registry, shutdown).await;
        });
    }

    #[cfg(feature = "admin")]
    if config.admin.enabled {
        let state = admin::api::AdminState { registry: Arc::clone(&registry), drain: drain.clone() };
        let listen = config.admin.listen.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = admin::api::start(state, &listen, shutdown).await {
                warn!(error = %e, "admin API failed");
            }
        });
    }

    if cli.stdio {
        let ingress = Arc::clone(&ingress);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = ingress::stdio::serve(ingress, shutdown).await {
                warn!(error = %e, "stdio ingress failed");
            }
        });
    }

    let http_listen = config.listen.clone();
    let http_ingress = Arc::clone(&ingress);
    let http_shutdown = Arc::clone(&shutdown);
    let http_task = tokio::spawn(async move { ingress::http::serve(http_ingress, &http_listen, http_shutdown).await });

    let signal_result = wait_for_shutdown_signal().await;
    if let Err(e) = signal_result {
        warn!(error = %e, "failed to install signal handlers, shutting down immediately");
    }
    info!("shutdown signal received, draining backends");
    shutdown.notify_waiters();

    let mut timed_out = false;
    for backend_id in registry.current_snapshot().descriptors.keys() {
        let stats = drain.drain_backend(backend_id, drain::DrainStrategy::Graceful, drain_timeout).await;
        timed_out |= stats.timed_out;
        transports.retire(backend_id).await;
    }

    if let Err(e) = http_task.await {
        warn!(error = %e, "http ingress task panicked");
    }

    info!("only1mcp stopped");
    std::process::exit(if timed_out { error::exit_code::DRAIN_TIMEOUT } else { error::exit_code::CLEAN });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c");
    Ok(())
}
