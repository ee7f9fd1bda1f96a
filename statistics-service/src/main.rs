use std::sync::Arc;

use anyhow::Result;
use statistics_service::{
    config::AppConfig,
    control, metrics_server, observability,
    reconcile::{spawn_account_schedules, CoordinatorSettings, ReconciliationCoordinator},
    sinks::{connect_store, TracingEntitySurface},
    sources::FileExportSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    let store = connect_store(&cfg.store).await?;
    let source = Arc::new(FileExportSource::new(cfg.source.export_dir.clone()));
    let settings = CoordinatorSettings {
        fetch: cfg.fetch.policy(),
        meter_concurrency: cfg.schedule.meter_concurrency,
    };

    let mut coordinator = ReconciliationCoordinator::new(source, store, Arc::new(TracingEntitySurface), settings);
    for entry in &cfg.accounts {
        coordinator = coordinator.with_entry(&entry.entry_id, entry.selected_accounts.iter().cloned());
    }
    let coordinator = Arc::new(coordinator);

    if coordinator.accounts().next().is_none() {
        tracing::warn!("no accounts configured, nothing to reconcile");
    }

    if let Some(control_cfg) = &cfg.control {
        control::serve(&control_cfg.bind_addr, coordinator.clone()).await?;
    }

    let handles = spawn_account_schedules(coordinator.clone(), cfg.schedule.update_interval());
    tracing::info!(
        accounts = handles.len(),
        interval_secs = cfg.schedule.update_interval().as_secs(),
        "statistics service started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    coordinator.shutdown();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "account schedule task failed");
        }
    }

    Ok(())
}
