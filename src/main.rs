use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth_coordinator::tokens::HttpTokenIssuer;
use auth_coordinator::{config::Config, expiration, lock, AppState};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "auth-coordinator starting");

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration for instance: {}", config.instance.id);

    let lock = lock::connect_lock_backend(&config.lock).await?;

    // Shared HTTP client for the token authority
    let http_client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(10))
        .build()?;
    let mut issuer = HttpTokenIssuer::new(http_client);
    if let Some(endpoint) = &config.refresh.token_endpoint {
        issuer = issuer.with_token_endpoint(endpoint.clone());
    }

    let state = AppState::new(config.clone(), lock, Arc::new(issuer));

    // Start background tasks
    let cleaner_cancel = CancellationToken::new();
    let cleaner_handle = expiration::start_session_cleaner(
        Arc::clone(&state.store),
        config.store.cleanup_interval,
        cleaner_cancel.clone(),
    );
    let scheduler = Arc::new(state.scheduler()).start();

    shutdown_signal().await;

    // Let an in-flight refresh cycle finish before exiting
    info!("Shutting down background tasks");
    scheduler.stop().await;
    cleaner_cancel.cancel();
    if let Err(e) = cleaner_handle.await {
        tracing::error!(error = %e, "Session cleaner ended abnormally");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, stopping refresh scheduler");
}
