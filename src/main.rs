use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use harvest_worker::{app::ComponentRegistry, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(|s| s.as_str())
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        sources = config.sources().len(),
        harvest_interval_secs = config.harvest_interval().as_secs(),
        gc_interval_secs = config.gc_interval().as_secs(),
        strategy = %config.sync_strategy(),
        "starting harvest worker"
    );

    let registry = ComponentRegistry::build(config)
        .await
        .context("failed to build component registry")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("shutdown signal received");

    registry.shutdown().await;
    info!("all daemons closed");

    Ok(())
}
