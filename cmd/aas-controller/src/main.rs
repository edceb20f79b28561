mod http;
mod settings;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pkg_controllers::action::ActionExecutor;
use pkg_controllers::cancel::CancelHandle;
use pkg_controllers::controller::{Controller, ControllerSettings};
use pkg_controllers::informer::TaskInformer;
use pkg_controllers::policy::{PolicyContext, PolicyManager};
use pkg_controllers::registry::Registry;
use pkg_controllers::schedule::{Clock, SystemClock};
use pkg_controllers::store::TargetStore;
use pkg_controllers::strategy::SourceFetcher;
use pkg_controllers::task::{TaskContext, TaskManager};
use pkg_metrics::MetricsRegistry;
use pkg_state::client::StateStore;
use pkg_types::config::{ControllerConfigFile, LogFormat, load_config_file};

use crate::settings::{Cli, Settings};

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let config_path = cli.config.clone();
    let file_cfg: ControllerConfigFile = load_config_file(&config_path)?;
    let settings = Settings::resolve(cli, file_cfg)?;
    init_tracing(&settings.log_level, settings.log_format);

    info!("Starting aas-controller");
    info!("  Config:    {}", config_path);
    info!("  Data dir:  {}", settings.data_dir);
    info!("  Namespace: {}", settings.namespace);
    info!("  Workers:   {}", settings.workers);
    info!("  Refresh:   {}s", settings.refresh_interval.as_secs());
    if let Some(source) = &settings.strategy_source {
        info!("  Strategies: {}", source);
    }

    let clock: Arc<dyn Clock> = match settings.utc_offset_minutes {
        Some(minutes) => Arc::new(
            SystemClock::with_utc_offset_minutes(minutes)
                .ok_or_else(|| anyhow::anyhow!("utc offset {} minutes is out of range", minutes))?,
        ),
        None => Arc::new(SystemClock::local()),
    };

    let store = StateStore::new(&settings.data_dir)
        .await
        .context("failed to open state store")?;
    let registry = Arc::new(Registry::new(store.clone()));
    let targets = registry
        .list_targets(&settings.namespace)
        .await
        .context("failed to list scaling targets")?;
    info!(
        "Found {} scaling targets in namespace {}",
        targets.len(),
        settings.namespace
    );

    let metrics = Arc::new(MetricsRegistry::for_controller());
    let tasks = Arc::new(TaskManager::new(TaskContext {
        targets: registry.clone(),
        fetcher: Arc::new(SourceFetcher::new()),
        recorder: registry.clone(),
        clock,
        metrics: metrics.clone(),
        cluster_id: settings.cluster_id.clone(),
        default_source: settings.strategy_source.clone(),
        default_refresh: settings.refresh_interval,
        call_timeout: settings.call_timeout,
    }));
    let policies = Arc::new(PolicyManager::new(PolicyContext {
        source: registry.clone(),
        executor: Arc::new(ActionExecutor::new(registry.clone(), settings.call_timeout)),
        metrics: metrics.clone(),
        interval: settings.policy_interval,
        max_sample_age: settings.max_sample_age,
        call_timeout: settings.call_timeout,
    }));
    let controller = Arc::new(Controller::new(
        registry.clone(),
        tasks,
        policies,
        metrics.clone(),
        ControllerSettings {
            workers: settings.workers,
            namespace: settings.namespace.clone(),
            shutdown_grace: settings.shutdown_grace,
            call_timeout: settings.call_timeout,
            policies: settings.policies.clone(),
        },
    ));

    let (cancel, token) = CancelHandle::new();
    let (events_tx, events_rx) = mpsc::channel(256);
    let informer = TaskInformer::new(registry.clone(), store.event_log.clone(), settings.resync)
        .spawn(events_tx, token.clone());
    let http = tokio::spawn(http::serve(
        settings.metrics_addr,
        metrics.clone(),
        registry.clone(),
        token.clone(),
    ));
    let run = tokio::spawn(controller.clone().run(events_rx, token));

    info!("Controller is running. Press Ctrl-C to stop.");
    shutdown_signal().await?;
    info!("Shutting down controller");
    cancel.cancel();

    run.await.context("controller task panicked")??;
    let _ = informer.await;
    match http.await {
        Ok(Err(e)) => warn!("Metrics endpoint failed: {}", e),
        Err(e) => warn!("Metrics endpoint task failed: {}", e),
        Ok(Ok(())) => {}
    }
    drop(registry);
    drop(controller);
    store.close().await?;
    Ok(())
}
