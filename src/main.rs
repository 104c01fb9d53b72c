//! Rotagate - Entry Point
//!
//! Validates configuration, runs one refresh and evaluation cycle, then
//! serves the gateway alongside the refresh and health services until a
//! shutdown signal arrives.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use rotagate::config::{Config, LogConfig};
use rotagate::proxy::builder::TransportBuilder;
use rotagate::proxy::handler::GatewayHandler;
use rotagate::proxy::health::HealthEvaluator;
use rotagate::proxy::pool::PoolManager;
use rotagate::proxy::resolver::{Resolver, SystemResolver};
use rotagate::proxy::rotation::{create_selector, UpstreamSelector};
use rotagate::proxy::server::GatewayServer;
use rotagate::services::{HealthMonitor, RefreshService, ShutdownHandle};

#[tokio::main]
async fn main() -> rotagate::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting rotagate");

    let source = config.validate().await?;
    info!(
        "Configuration validated (source: {}, scheduler: {})",
        source.kind(),
        config.gateway.scheduler.as_str()
    );

    let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver);
    let builder = TransportBuilder::new(config.dial_timeout(), resolver.clone());
    let pool = Arc::new(PoolManager::new(Arc::new(builder)));
    let evaluator = Arc::new(HealthEvaluator::with_network_probe(config.probe_config()));

    let refresh_service = RefreshService::new(
        source,
        pool.clone(),
        evaluator.clone(),
        config.refresh_config(),
    );

    // First cycle runs before the listener opens.
    if let Err(e) = refresh_service.run_once().await {
        warn!("Initial upstream refresh failed: {}", e);
    }
    info!(
        "Loaded {} upstreams, {} available",
        pool.pool().len(),
        pool.available().len()
    );

    let selector: Arc<dyn UpstreamSelector> = Arc::from(create_selector(config.gateway.scheduler));
    let handler = Arc::new(GatewayHandler::new(
        pool.clone(),
        selector,
        resolver,
        config.handler_config(),
    ));
    let server = GatewayServer::bind(&config.listen_addr(), handler).await?;

    let (shutdown, server_shutdown) = ShutdownHandle::new();

    let refresh_shutdown = shutdown.subscribe();
    let refresh_task = tokio::spawn(async move {
        refresh_service.run(refresh_shutdown).await;
    });

    let monitor = HealthMonitor::new(pool.clone(), evaluator, config.monitor_config());
    let monitor_shutdown = shutdown.subscribe();
    let monitor_task = tokio::spawn(async move {
        monitor.run(monitor_shutdown).await;
    });

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Gateway server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    shutdown.shutdown();
    let (server, refresh, monitor) = tokio::join!(server_task, refresh_task, monitor_task);
    for (name, joined) in [("server", server), ("refresh", refresh), ("health", monitor)] {
        if let Err(e) = joined {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("Rotagate stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rotagate={}", log.level).into());

    let fmt_layer = match log.format.as_str() {
        "json" => tracing_subscriber::fmt::layer().json().boxed(),
        _ => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
