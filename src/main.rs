use anyhow::Context;
use funnel_monitor_lib::adapters::insights::TemplateInsights;
use funnel_monitor_lib::adapters::json_provider::JsonDirProvider;
use funnel_monitor_lib::adapters::log_notifier::LogNotifier;
use funnel_monitor_lib::config::Settings;
use funnel_monitor_lib::monitor::{Collaborators, FunnelMonitor};
use std::path::PathBuf;
use std::sync::Arc;

/// Usage: `funnel-monitor [config.yaml|config.json]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("loading settings")?;

    funnel_monitor_lib::init_tracing(&settings.log_dir)
        .map_err(|error| anyhow::anyhow!("initializing tracing: {}", error))?;
    tracing::info!(
        funnels = settings.funnels.len(),
        database = %settings.database_path.display(),
        interval_secs = settings.cycle_interval_secs,
        "funnel monitor starting"
    );

    let collaborators = Collaborators {
        provider: Arc::new(JsonDirProvider::new(settings.data_dir.clone())),
        notifier: Arc::new(LogNotifier),
        insights: Arc::new(TemplateInsights),
    };
    let monitor = FunnelMonitor::new(settings, collaborators).context("starting monitor")?;
    let ticker = monitor.start_scheduler();

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    ticker.abort();
    monitor.drain_notifications().await;
    Ok(())
}
