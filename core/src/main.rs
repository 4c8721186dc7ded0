/// GigChat development relay - Main entry point
use gigchat_core::relay::{self, Relay};
use gigchat_core::RelayConfig;
use std::env;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config =
        RelayConfig::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let relay = Relay::from_config(&config).map_err(|e| anyhow::anyhow!("Relay error: {}", e))?;
    info!("Starting GigChat relay");
    info!(
        "   Storage: {}",
        config
            .data_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );

    let frames = TcpListener::bind(config.listen_addr).await?;
    let http = TcpListener::bind(config.http_addr).await?;

    let relay_task = tokio::spawn(relay.clone().serve(frames));
    let http_task = tokio::spawn(relay::http::serve(relay.clone(), http));

    tokio::select! {
        _ = wait_for_shutdown() => info!("Shutdown signal received, stopping relay..."),
        result = relay_task => error!("Relay loop ended: {:?}", result),
        result = http_task => error!("Chat API loop ended: {:?}", result),
    }

    if let Err(e) = relay.store().flush() {
        warn!("Final flush failed: {}", e);
    }
    info!("Relay stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
