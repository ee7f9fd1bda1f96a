use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use super::coordinator::{CycleOutcome, ReconciliationCoordinator};
use crate::error::CycleError;

/// One recurring task per account. The first tick fires immediately.
///
/// A tick that arrives while the previous cycle is still running is dropped,
/// not queued. Tasks stop when the account's entry is cancelled or the
/// coordinator shuts down.
pub fn spawn_account_schedules(coordinator: Arc<ReconciliationCoordinator>, every: Duration) -> Vec<JoinHandle<()>> {
    let account_ids: Vec<String> = coordinator.accounts().map(|rt| rt.account_id.clone()).collect();

    account_ids
        .into_iter()
        .filter_map(|account_id| {
            let cancel = coordinator.account(&account_id)?.cancel_token();
            let coordinator = coordinator.clone();

            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match coordinator.run_scheduled_cycle(&account_id, OffsetDateTime::now_utc()).await {
                                Ok(CycleOutcome::Completed(_)) | Ok(CycleOutcome::Skipped) | Ok(CycleOutcome::Coalesced) => {}
                                Err(CycleError::Cancelled(_)) => break,
                                Err(e) => tracing::warn!(error = %e, account_id = %account_id, "scheduled cycle failed"),
                            }
                        }
                    }
                }
                tracing::info!(account_id = %account_id, "account schedule stopped");
            }))
        })
        .collect()
}
