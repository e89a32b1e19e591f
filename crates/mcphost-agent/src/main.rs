use std::sync::Arc;

use mcphost_agent::{
    api,
    events::JsonlEventSink,
    host_manager::HostManager,
    settings::HostSettings,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_dir = std::env::var("MCPHOST_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty());
    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(log_dir, "mcphost-agent");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let settings = HostSettings::from_env()?;
    let events = Arc::new(JsonlEventSink::new(settings.events_path()));
    let manager = Arc::new(HostManager::new(settings.clone(), events));
    manager.init().await?;
    manager.load_existing_servers().await?;
    manager.spawn_background_loops().await;

    let addr = settings.listen_addr;
    tracing::info!(
        %addr,
        data_root = %settings.data_root.display(),
        max_servers = settings.max_servers,
        "mcphost-agent HTTP listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, api::router(manager.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await;

    manager.shutdown().await;
    served?;
    Ok(())
}
