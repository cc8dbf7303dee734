use fleet_agent::{Agent, AgentConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the non-blocking file writer flushing until `main` returns.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer();

    match std::env::var("FLEET_LOG_DIR").ok().filter(|v| !v.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "fleet-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let path = AgentConfig::config_path();
    let config = AgentConfig::load(&path)?;
    tracing::info!(
        config = %path.display(),
        node = %config.node_name,
        coordinators = ?config.coordinator_urls,
        version = env!("CARGO_PKG_VERSION"),
        "fleet-agent starting"
    );
    if config.coordinator_urls.is_empty() {
        tracing::warn!("no coordinator address configured; running unmanaged");
    }

    let agent = Agent::new(config).await?;
    agent.start().await?;

    shutdown_signal().await;
    agent.shutdown().await;
    Ok(())
}
