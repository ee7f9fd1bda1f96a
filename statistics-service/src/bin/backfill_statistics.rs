use anyhow::{bail, Result};
use energy_client::domain::statistic_ids_for;
use statistics_service::{
    config::AppConfig,
    observability,
    reconcile::{CoordinatorSettings, CycleOutcome, ReconciliationCoordinator},
    sinks::{connect_store, TracingEntitySurface},
    sources::{FileExportSource, UtilitySource},
    transform,
};
use std::{env, sync::Arc};
use time::OffsetDateTime;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let (list_ids, entry_id) = match args.as_slice() {
        [] => (false, None),
        [flag] if flag == "--list-ids" => (true, None),
        [flag, entry] if flag == "--list-ids" => (true, Some(entry.clone())),
        [entry] if !entry.starts_with('-') => (false, Some(entry.clone())),
        _ => bail!("usage: backfill_statistics [--list-ids] [entry_id]"),
    };

    // Load configuration (can point STATISTICS_CONFIG to a backfill-specific file).
    let cfg = AppConfig::load()?;
    let source = Arc::new(FileExportSource::new(cfg.source.export_dir.clone()));

    let entries: Vec<_> = cfg
        .accounts
        .iter()
        .filter(|e| entry_id.as_deref().map_or(true, |id| e.entry_id == id))
        .collect();
    if let Some(id) = &entry_id {
        if entries.is_empty() {
            bail!("unknown entry '{id}'");
        }
    }

    if list_ids {
        // Statistic ids a host must clear when these entries are removed.
        for entry in &entries {
            for account_id in &entry.selected_accounts {
                let meters = source
                    .fetch_meters(account_id)
                    .await
                    .map_err(|e| anyhow::anyhow!("meter discovery failed for {account_id}: {e}"))?;
                for meter in meters.iter().filter_map(|m| transform::normalize_meter(account_id, m)) {
                    for id in statistic_ids_for(&meter) {
                        println!("{}\t{}\t{id}", entry.entry_id, account_id);
                    }
                }
            }
        }
        return Ok(());
    }

    let store = connect_store(&cfg.store).await?;
    let settings = CoordinatorSettings {
        fetch: cfg.fetch.policy(),
        meter_concurrency: cfg.schedule.meter_concurrency,
    };
    let mut coordinator = ReconciliationCoordinator::new(source, store, Arc::new(TracingEntitySurface), settings);
    for entry in &entries {
        coordinator = coordinator.with_entry(&entry.entry_id, entry.selected_accounts.iter().cloned());
    }

    let results = coordinator
        .force_full_refresh(entry_id.as_deref(), OffsetDateTime::now_utc())
        .await?;

    let mut failed = 0;
    for (account_id, res) in results {
        match res {
            Ok(CycleOutcome::Completed(report)) => tracing::info!(
                account_id = %account_id,
                meters = report.meters.len(),
                failed_meters = report.failed_meters(),
                points_written = report.points_written(),
                "backfill finished"
            ),
            Ok(other) => tracing::info!(account_id = %account_id, outcome = ?other, "backfill not run"),
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, account_id = %account_id, "backfill failed");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} account(s) failed to backfill");
    }
    Ok(())
}
