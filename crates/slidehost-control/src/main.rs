use std::net::SocketAddr;

use anyhow::Context;
use slidehost_agent::{Registry, Settings, scaffold::DependencyMode};
use slidehost_control::{config::ApiConfig, state::AppState};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env().context("load settings")?;
    let api = ApiConfig::from_env();
    tokio::fs::create_dir_all(&settings.temp_root)
        .await
        .with_context(|| format!("create temp root {}", settings.temp_root.display()))?;

    let registry = Registry::new(&settings);
    if settings.scaffold.dependencies == DependencyMode::Template {
        registry.scaffolder().warm_template();
    }
    let sweeper = registry.spawn_sweeper(settings.sweep_interval);

    tracing::info!(
        temp_root = %settings.temp_root.display(),
        ports = %format!("{}-{}", settings.port_range.start, settings.port_range.end),
        max_concurrent = settings.max_concurrent,
        renderer = %settings.supervisor.renderer.program,
        "slidehost configured"
    );

    let addr = api.addr()?;
    let app = slidehost_control::router(AppState::new(registry.clone(), settings, api));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "slidehost-control HTTP listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    registry.shutdown().await;
    tracing::info!("slidehost-control stopped");
    Ok(())
}
