use std::time::Duration;

use soon_engine::{EngineConfig, GpoManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod audit;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soon_worker=info,soon_engine=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    // --- Configuration ---
    let config = EngineConfig::from_env();
    tracing::info!(
        domain = %config.domain_dn,
        template_root = %config.template_root.display(),
        ldb_url = %config.ldb_url,
        signing = config.signer_pkcs12.is_some(),
        "Loaded engine configuration"
    );

    let manager = GpoManager::from_config(&config);

    // --- Startup health check ---
    let health = manager.health_check().await;
    let report = serde_json::to_string(&health).unwrap_or_default();
    if health.healthy {
        tracing::info!(report = %report, "Health check passed");
    } else {
        tracing::error!(report = %report, "Health check failed");
        std::process::exit(1);
    }

    // --- Audit ---
    if config.audit_interval.is_zero() {
        let clean = audit::run_once(&manager).await;
        std::process::exit(if clean { 0 } else { 2 });
    }

    let cancel = CancellationToken::new();
    let audit_handle = tokio::spawn(audit::run(manager, config.audit_interval, cancel.clone()));

    shutdown_signal().await;

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), audit_handle).await;
    tracing::info!("Worker stopped");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
