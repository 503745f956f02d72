use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use freight_automation::automation::{AutomationDispatcher, spawn_dispatcher};
use freight_automation::config::AutomationSettings;
use freight_automation::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = AutomationSettings::from_env()?;

    // Held until exit so buffered file output gets flushed
    let _log_guard = init_tracing(&settings);

    eprintln!("📦 Freight Automation v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", settings.db_path.display());
    eprintln!("   Interval: {}s", settings.interval.as_secs());
    eprintln!(
        "   Concurrency: {} messages, backlog {} per config",
        settings.max_concurrent_messages, settings.backlog_limit
    );
    if let Some(dir) = &settings.log_dir {
        eprintln!("   Log dir: {}", dir.display());
    }

    let store = Arc::new(LibSqlBackend::new_local(&settings.db_path).await?);

    let configs = store.list_enabled_configs().await?;
    eprintln!("   Enabled configs: {}\n", configs.len());

    let dispatcher = Arc::new(AutomationDispatcher::from_settings(
        store.clone(),
        store.clone(),
        &settings,
    ));
    let (handle, shutdown) = spawn_dispatcher(dispatcher, settings.interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    // Let an in-flight pass write its logs before exiting
    shutdown.trigger();
    handle.await?;

    Ok(())
}

/// Stderr logging, mirrored into a daily-rolling file when a log dir is set.
fn init_tracing(settings: &AutomationSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "freight-automation.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
