use anyhow::Context;
use std::net::SocketAddr;

mod analyze;
mod app;
mod audit;
mod config;
mod credentials;
mod gate;
mod iap;
mod jwks;
mod middleware;
mod telemetry;
#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = config::load_config().context("failed to load configuration")?;
    let _otel_guard = telemetry::init(&settings.telemetry).context("failed to initialize telemetry")?;

    let app = app::from_settings(&settings).with_context(|| {
        format!(
            "failed to load service account key from {}",
            settings.key_path.display()
        )
    })?;

    let addr: SocketAddr = format!("{}:{}", settings.listen_address, settings.server_port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("App listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}
