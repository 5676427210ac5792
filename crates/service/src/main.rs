//! Entity service entry point.

use entity_service::{Config, LogFormat};
use event_bus::{Shutdown, ShutdownTrigger};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM), then fires `trigger`.
async fn shutdown_signal(trigger: ShutdownTrigger) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }

    trigger.trigger();
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Build stores, dispatcher and routes
    let service = entity_service::compose(config, metrics_handle)
        .await
        .expect("failed to build entity service");

    // 4. Serve until a signal arrives
    let (trigger, shutdown) = Shutdown::new();
    tokio::spawn(shutdown_signal(trigger));

    tracing::info!(addr = %service.config().addr(), "starting entity service");
    if let Err(e) = service.run(shutdown).await {
        tracing::error!(error = %e, "entity service stopped with an error");
    }

    // 5. Release store handles
    service.close().await;
    tracing::info!("server shut down gracefully");
}
