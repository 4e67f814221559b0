// ABOUTME: Shard node binary: joins the rebalancing group and serves readiness over HTTP
// ABOUTME: Readiness, shard table and status routes live in http.rs

mod http;

use dotenv::dotenv;
use shard_rebalancer::{ClusterConfig, LifecycleEvents, RebalanceCoordinator};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Validate environment variables at startup
fn validate_environment() -> Result<(), String> {
    let mut errors = Vec::new();

    if env::var("NODE_HOST").is_err() {
        // Peers sort on host:port, so a loopback default only works on one machine
        tracing::warn!("NODE_HOST not set, advertising 127.0.0.1");
    }

    if let Ok(port) = env::var("PORT") {
        if port.parse::<u16>().is_err() {
            errors.push(format!("PORT must be a valid port number, got {:?}", port));
        }
    }

    for key in [
        "REBALANCE_DELAY_MS",
        "REBALANCE_TIMEOUT_MS",
        "READY_PROBE_TIMEOUT_MS",
    ] {
        if let Ok(value) = env::var(key) {
            if value.parse::<u64>().is_err() {
                errors.push(format!("{} must be a number of milliseconds, got {:?}", key, value));
            }
        }
    }

    if !errors.is_empty() {
        return Err(format!(
            "Invalid environment variables:\n  - {}",
            errors.join("\n  - ")
        ));
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

fn init_tracing() {
    // JSON in production for log aggregation
    let is_production = env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn lifecycle_events() -> LifecycleEvents {
    LifecycleEvents::builder()
        .on_start(|| async {
            tracing::info!("Rebalance starting, shard released");
            anyhow::Ok(())
        })
        .on_end(|shard, assignment| async move {
            tracing::info!(
                shard = ?shard,
                nodes = assignment.len(),
                leader = ?assignment.leader(),
                "Rebalance finished"
            );
            anyhow::Ok(())
        })
        .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    if let Err(e) = validate_environment() {
        eprintln!("\n❌ Configuration Error:\n{}\n", e);
        std::process::exit(1);
    }

    let config = ClusterConfig::from_env()?;
    let port = config.port;
    tracing::info!(
        node = %config.node_id(),
        coordination = %config.coordination_url,
        root = %config.root_path,
        delay_ms = config.rebalance_delay.as_millis() as u64,
        timeout_ms = config.rebalance_timeout.as_millis() as u64,
        "✔︎ Configuration loaded"
    );

    let coordinator = Arc::new(RebalanceCoordinator::with_redis(config, lifecycle_events())?);
    coordinator.start().await?;
    tracing::info!(
        "✔︎ Joined rebalancing group as {}",
        coordinator.node_id()
    );

    let app = http::router(coordinator.clone());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🌐 HTTP server listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let http_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.await.ok();
            })
            .await;
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    wait_for_shutdown_signal().await;
    shutdown_tx.send(()).ok();

    tracing::info!("Shutting down gracefully...");

    // Leave the group first so peers start rebalancing without us
    if let Err(e) = coordinator.stop().await {
        tracing::warn!("Failed to leave rebalancing group cleanly: {}", e);
    }

    match tokio::time::timeout(Duration::from_secs(25), http_handle).await {
        Ok(Err(e)) => tracing::warn!("HTTP server task error: {:?}", e),
        Ok(Ok(())) => {}
        Err(_) => tracing::warn!("HTTP server shutdown timed out after 25s"),
    }

    tracing::info!("Graceful shutdown complete");

    Ok(())
}
