//! Reconciliation coordinator: one update cycle per account.
//!
//! A cycle discovers the account's meters, then runs two phases over them:
//! a fetch phase (plan windows, fetch, normalize, overlap checks) and a
//! write phase (sum tracking, store writes, entity updates). A rejected
//! login found in the fetch phase fails the whole cycle before anything is
//! written. Any other failure is confined to its meter and source, and the
//! source is planned again from the same state next cycle.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use energy_client::domain::{
    Account, Direction, FuelKind, Granularity, Meter, Reading, SourceKind, StatisticId, StatisticMetadata,
};
use futures::StreamExt;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use super::{
    guard::{AccountGuard, CycleKind},
    sum_tracker::{SumMode, SumTracker},
    window::{FetchWindow, WindowPlanner},
};
use crate::{
    error::{CycleError, FetchError, StoreError},
    sinks::{EntitySurface, MeterSnapshot, StatisticsStore},
    sources::{fetch_with_retry, FetchPolicy, UtilitySource},
    transform::{self, overlap, NormalizeReport, OverlapGuard},
};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub fetch: FetchPolicy,
    pub meter_concurrency: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            fetch: FetchPolicy::default(),
            meter_concurrency: 4,
        }
    }
}

/// Runtime state of one billing account.
pub struct AccountRuntime {
    pub account_id: String,
    pub entry_id: String,
    pub guard: Arc<AccountGuard>,
    pub planner: WindowPlanner,
    cancel: CancellationToken,
    provider_available: AtomicBool,
}

impl AccountRuntime {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterReport {
    /// Meter as seen this cycle, `has_return` included.
    pub meter: Meter,
    pub normalize: NormalizeReport,
    /// Points written per series.
    pub written: BTreeMap<StatisticId, usize>,
    /// AMI hours dropped because the interval series already holds them.
    pub claimed_dropped: usize,
    pub rejected_replays: Vec<StatisticId>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub account: Account,
    pub kind: CycleKind,
    pub meters: Vec<MeterReport>,
}

impl CycleReport {
    pub fn points_written(&self) -> usize {
        self.meters.iter().flat_map(|m| m.written.values()).sum()
    }

    pub fn failed_meters(&self) -> usize {
        self.meters.iter().filter(|m| !m.failures.is_empty()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Scheduled tick skipped: the account was busy or a refresh is waiting.
    Skipped,
    /// Forced refresh folded into one that was already waiting.
    Coalesced,
}

struct SeriesBatch {
    source: SourceKind,
    metadata: StatisticMetadata,
    readings: Vec<Reading>,
    mode: SumMode,
}

/// Output of the fetch phase for one meter.
struct MeterBatch {
    report: MeterReport,
    snapshot: MeterSnapshot,
    series: Vec<SeriesBatch>,
    fetched: Vec<SourceKind>,
    provider_failure: Option<String>,
}

impl MeterBatch {
    fn new(account_id: &str, meter: Meter) -> Self {
        let snapshot = MeterSnapshot {
            account_id: account_id.to_string(),
            service_point: meter.service_point.clone(),
            fuel: meter.fuel,
            last_billing_usage: None,
            last_billing_cost: None,
            is_smart_meter: meter.capabilities.is_smart_meter,
        };
        Self {
            report: MeterReport {
                meter,
                normalize: NormalizeReport::default(),
                written: BTreeMap::new(),
                claimed_dropped: 0,
                rejected_replays: Vec::new(),
                failures: Vec::new(),
            },
            snapshot,
            series: Vec::new(),
            fetched: Vec::new(),
            provider_failure: None,
        }
    }

    fn meter(&self) -> &Meter {
        &self.report.meter
    }

    fn fetch_failed(&mut self, source: SourceKind, error: &FetchError) {
        tracing::warn!(
            service_point = %self.report.meter.service_point,
            source = %source,
            error = %error,
            "fetch failed, retrying next cycle"
        );
        self.report.failures.push(format!("{source}: {error}"));
        self.provider_failure.get_or_insert_with(|| error.to_string());
    }

    fn store_failed(&mut self, source: SourceKind, error: &StoreError) {
        tracing::error!(
            service_point = %self.report.meter.service_point,
            source = %source,
            error = %error,
            "statistics store query failed"
        );
        self.report.failures.push(format!("{source}: {error}"));
    }

    fn note_return(&mut self, readings: &[Reading]) {
        if readings.iter().any(|r| r.direction == Direction::Return) {
            self.report.meter.capabilities.has_return = true;
        }
    }

    fn push_series(&mut self, window: &FetchWindow, direction: Direction, granularity: Granularity, readings: Vec<Reading>) {
        if readings.is_empty() {
            return;
        }
        let meter = &self.report.meter;
        self.series.push(SeriesBatch {
            source: window.source,
            metadata: StatisticMetadata::for_series(&meter.service_point, meter.fuel, direction, granularity),
            readings,
            mode: if window.forced {
                SumMode::FullRefresh
            } else {
                SumMode::Incremental
            },
        });
    }
}

fn split_by_direction(readings: Vec<Reading>) -> BTreeMap<Direction, Vec<Reading>> {
    let mut out: BTreeMap<Direction, Vec<Reading>> = BTreeMap::new();
    for r in readings {
        out.entry(r.direction).or_default().push(r);
    }
    out
}

/// Directions a meter can produce series for.
fn directions(fuel: FuelKind) -> &'static [Direction] {
    match fuel {
        FuelKind::Electric => &Direction::ALL,
        FuelKind::Gas => &[Direction::Consumption],
    }
}

pub struct ReconciliationCoordinator {
    source: Arc<dyn UtilitySource>,
    store: Arc<dyn StatisticsStore>,
    entities: Arc<dyn EntitySurface>,
    overlap: OverlapGuard,
    settings: CoordinatorSettings,
    shutdown: CancellationToken,
    accounts: BTreeMap<String, Arc<AccountRuntime>>,
}

impl ReconciliationCoordinator {
    pub fn new(
        source: Arc<dyn UtilitySource>,
        store: Arc<dyn StatisticsStore>,
        entities: Arc<dyn EntitySurface>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            source,
            store,
            entities,
            overlap: OverlapGuard::new(),
            settings,
            shutdown: CancellationToken::new(),
            accounts: BTreeMap::new(),
        }
    }

    /// Register the billing accounts of one entry.
    pub fn with_entry<I, S>(mut self, entry_id: &str, account_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for account_id in account_ids {
            let account_id = account_id.into();
            let runtime = AccountRuntime {
                account_id: account_id.clone(),
                entry_id: entry_id.to_string(),
                guard: AccountGuard::new(),
                planner: WindowPlanner::new(),
                cancel: self.shutdown.child_token(),
                provider_available: AtomicBool::new(true),
            };
            self.accounts.insert(account_id, Arc::new(runtime));
        }
        self
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Arc<AccountRuntime>> {
        self.accounts.values()
    }

    pub fn account(&self, account_id: &str) -> Option<&Arc<AccountRuntime>> {
        self.accounts.get(account_id)
    }

    /// Accounts of `entry_id`, or every account when `None`.
    pub fn accounts_for(&self, entry_id: Option<&str>) -> Result<Vec<Arc<AccountRuntime>>, CycleError> {
        let selected: Vec<_> = self
            .accounts
            .values()
            .filter(|rt| entry_id.map_or(true, |e| rt.entry_id == e))
            .cloned()
            .collect();

        match entry_id {
            Some(entry) if selected.is_empty() => Err(CycleError::UnknownEntry(entry.to_string())),
            _ => Ok(selected),
        }
    }

    /// Cancel in-flight and future cycles of an unloaded entry.
    pub fn cancel_entry(&self, entry_id: &str) {
        for rt in self.accounts.values().filter(|rt| rt.entry_id == entry_id) {
            rt.cancel.cancel();
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Move every (meter, source) of the selected accounts to `FullRefresh`.
    pub fn mark_full_refresh(&self, entry_id: Option<&str>) -> Result<Vec<String>, CycleError> {
        let accounts = self.accounts_for(entry_id)?;
        for rt in &accounts {
            rt.planner.request_full_refresh();
        }
        Ok(accounts.into_iter().map(|rt| rt.account_id.clone()).collect())
    }

    /// Scheduled cycle for one account. Skipped if the account is busy.
    pub async fn run_scheduled_cycle(
        &self,
        account_id: &str,
        now: OffsetDateTime,
    ) -> Result<CycleOutcome, CycleError> {
        let rt = self
            .account(account_id)
            .ok_or_else(|| CycleError::UnknownAccount(account_id.to_string()))?;

        let Some(permit) = rt.guard.try_begin_regular() else {
            metrics::counter!("cycles_skipped_total").increment(1);
            tracing::info!(account_id, "account busy, skipping scheduled cycle");
            return Ok(CycleOutcome::Skipped);
        };

        let report = self.cancellable(rt, self.run_cycle(rt, permit.kind(), now)).await?;
        Ok(CycleOutcome::Completed(report))
    }

    /// Replay full history for the accounts of `entry_id` (all when `None`).
    ///
    /// Each account waits for its in-flight cycle; accounts run concurrently.
    pub async fn force_full_refresh(
        &self,
        entry_id: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<Vec<(String, Result<CycleOutcome, CycleError>)>, CycleError> {
        let accounts = self.accounts_for(entry_id)?;
        tracing::info!(entry_id = entry_id.unwrap_or("*"), accounts = accounts.len(), "forced full refresh requested");

        let runs = accounts.iter().map(|rt| async move {
            let res = self.refresh_account(rt, now).await;
            (rt.account_id.clone(), res)
        });
        Ok(futures::future::join_all(runs).await)
    }

    async fn refresh_account(&self, rt: &AccountRuntime, now: OffsetDateTime) -> Result<CycleOutcome, CycleError> {
        let Some(permit) = self.cancellable(rt, async { Ok(rt.guard.begin_refresh().await) }).await? else {
            tracing::info!(account_id = %rt.account_id, "refresh already pending, coalesced");
            return Ok(CycleOutcome::Coalesced);
        };

        // Marked only once the account is ours, so a cycle finishing in the
        // meantime cannot consume the request.
        rt.planner.request_full_refresh();
        let report = self.cancellable(rt, self.run_cycle(rt, permit.kind(), now)).await?;
        Ok(CycleOutcome::Completed(report))
    }

    async fn cancellable<T, F>(&self, rt: &AccountRuntime, fut: F) -> Result<T, CycleError>
    where
        F: Future<Output = Result<T, CycleError>>,
    {
        tokio::select! {
            biased;
            _ = rt.cancel.cancelled() => {
                tracing::info!(account_id = %rt.account_id, "cycle cancelled");
                Err(CycleError::Cancelled(rt.account_id.clone()))
            }
            res = fut => res,
        }
    }

    async fn fetch<T, F, Fut>(&self, what: &str, op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        fetch_with_retry(&self.settings.fetch, what, op).await
    }

    async fn discover(&self, rt: &AccountRuntime) -> Result<Account, CycleError> {
        let account_id = rt.account_id.as_str();
        let raw = match self.fetch("meters", || self.source.fetch_meters(account_id)).await {
            Ok(raw) => raw,
            Err(e @ FetchError::Auth(_)) => return Err(self.reauth(rt, e).await),
            Err(e) => {
                self.note_availability(rt, Some(&e.to_string()));
                return Err(CycleError::Discovery {
                    account_id: account_id.to_string(),
                    source: e,
                });
            }
        };

        let meters = raw
            .iter()
            .filter_map(|m| transform::normalize_meter(account_id, m))
            .collect();

        Ok(Account {
            account_id: account_id.to_string(),
            entry_id: rt.entry_id.clone(),
            meters,
        })
    }

    async fn reauth(&self, rt: &AccountRuntime, error: FetchError) -> CycleError {
        self.entities.reauth_required(&rt.entry_id, &rt.account_id).await;
        CycleError::ReauthRequired {
            account_id: rt.account_id.clone(),
            source: error,
        }
    }

    fn note_availability(&self, rt: &AccountRuntime, failure: Option<&str>) {
        match failure {
            Some(reason) => {
                if rt.provider_available.swap(false, Ordering::SeqCst) {
                    tracing::warn!(account_id = %rt.account_id, reason, "utility provider unavailable");
                }
            }
            None => {
                if !rt.provider_available.swap(true, Ordering::SeqCst) {
                    tracing::info!(account_id = %rt.account_id, "utility provider recovered");
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        rt: &AccountRuntime,
        kind: CycleKind,
        now: OffsetDateTime,
    ) -> Result<CycleReport, CycleError> {
        let account = self.discover(rt).await?;
        let concurrency = self.settings.meter_concurrency.max(1);

        let fetched: Vec<Result<MeterBatch, FetchError>> = futures::stream::iter(account.meters.iter().cloned())
            .map(|meter| self.fetch_meter(rt, meter, now))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut batches = Vec::with_capacity(fetched.len());
        for res in fetched {
            match res {
                Ok(batch) => batches.push(batch),
                Err(e) => return Err(self.reauth(rt, e).await),
            }
        }

        let provider_failure = batches.iter().find_map(|b| b.provider_failure.clone());
        self.note_availability(rt, provider_failure.as_deref());

        let tracker = SumTracker::new(self.store.clone());
        let mut meters: Vec<MeterReport> = futures::stream::iter(batches)
            .map(|batch| self.write_meter(rt, &tracker, batch))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        meters.sort_by(|a, b| a.meter.service_point.cmp(&b.meter.service_point));

        let service_points: Vec<String> = account.meters.iter().map(|m| m.service_point.clone()).collect();
        rt.planner.settle_refresh_request(&service_points);

        let report = CycleReport { account, kind, meters };
        metrics::counter!("cycles_completed_total").increment(1);
        tracing::info!(
            account_id = %rt.account_id,
            kind = ?kind,
            meters = report.meters.len(),
            failed_meters = report.failed_meters(),
            points_written = report.points_written(),
            "reconciliation cycle finished"
        );
        Ok(report)
    }

    /// Fetch phase for one meter. Only an auth failure is returned as an error.
    async fn fetch_meter(&self, rt: &AccountRuntime, meter: Meter, now: OffsetDateTime) -> Result<MeterBatch, FetchError> {
        let mut batch = MeterBatch::new(&rt.account_id, meter);

        self.fetch_billing(rt, &mut batch, now).await?;

        if batch.meter().capabilities.supports_ami {
            let ami_high_water = self.fetch_ami(rt, &mut batch, now).await?;
            if batch.meter().capabilities.supports_interval {
                match ami_high_water {
                    Some(high_water) => self.fetch_interval(rt, &mut batch, now, high_water).await?,
                    None => batch
                        .report
                        .failures
                        .push("interval: skipped, AMI state unknown this cycle".to_string()),
                }
            }
        }

        Ok(batch)
    }

    async fn fetch_billing(&self, rt: &AccountRuntime, batch: &mut MeterBatch, now: OffsetDateTime) -> Result<(), FetchError> {
        let meter = batch.meter().clone();
        let window = rt.planner.plan(&meter, SourceKind::Billing, now);
        let account_id = rt.account_id.as_str();

        let usage = self
            .fetch("billing", || self.source.fetch_billing(account_id, &meter, window.since))
            .await;
        let costs = self
            .fetch("costs", || self.source.fetch_costs(account_id, &meter, window.since))
            .await;

        match (usage, costs) {
            (Err(e @ FetchError::Auth(_)), _) | (_, Err(e @ FetchError::Auth(_))) => Err(e),
            (Err(e), _) | (_, Err(e)) => {
                batch.fetch_failed(SourceKind::Billing, &e);
                Ok(())
            }
            (Ok(usage), Ok(costs)) => {
                let readings = transform::normalize_billing(&meter, &usage, &window, &mut batch.report.normalize);
                batch.note_return(&readings);
                batch.snapshot.last_billing_usage = readings.iter().max_by_key(|r| r.ts).map(|r| {
                    let signed = match r.direction {
                        Direction::Consumption => r.quantity,
                        Direction::Return => -r.quantity,
                    };
                    (r.ts, signed)
                });
                batch.snapshot.last_billing_cost = transform::latest_cost(&meter, &costs);
                batch.fetched.push(SourceKind::Billing);
                Ok(())
            }
        }
    }

    /// Returns the AMI high-water mark, or `None` if AMI could not be settled
    /// this cycle. A meter with no AMI data at all yields the epoch.
    async fn fetch_ami(
        &self,
        rt: &AccountRuntime,
        batch: &mut MeterBatch,
        now: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, FetchError> {
        let meter = batch.meter().clone();
        let window = rt.planner.plan(&meter, SourceKind::AmiHourly, now);

        let raw = match self
            .fetch("ami", || self.source.fetch_ami(&meter, window.since, window.until))
            .await
        {
            Ok(raw) => raw,
            Err(e @ FetchError::Auth(_)) => return Err(e),
            Err(e) => {
                batch.fetch_failed(SourceKind::AmiHourly, &e);
                return Ok(None);
            }
        };

        let readings = transform::normalize_ami(&meter, &raw, &window, &mut batch.report.normalize);
        batch.note_return(&readings);
        let mut by_direction = split_by_direction(readings);

        let mut high_water: Option<OffsetDateTime> = None;
        let mut accepted = Vec::new();
        for &direction in directions(meter.fuel) {
            let readings = by_direction.remove(&direction).unwrap_or_default();
            let hourly_id = StatisticId::new(&meter.service_point, meter.fuel, direction, Granularity::Hourly);

            let claimed = if meter.capabilities.supports_interval {
                let interval_id = StatisticId::new(&meter.service_point, meter.fuel, direction, Granularity::Interval);
                match self
                    .store
                    .get_points(&interval_id, window.since, window.until + Duration::HOUR)
                    .await
                {
                    Ok(points) => points.into_iter().map(|p| p.start).collect(),
                    Err(e) => {
                        batch.store_failed(SourceKind::AmiHourly, &e);
                        return Ok(None);
                    }
                }
            } else {
                BTreeSet::new()
            };

            let stored_last = match self.store.get_last(&hourly_id).await {
                Ok(state) => state.map(|s| s.last_start),
                Err(e) => {
                    batch.store_failed(SourceKind::AmiHourly, &e);
                    return Ok(None);
                }
            };

            let (kept, dropped) = overlap::exclude_claimed(readings, &claimed);
            if dropped > 0 {
                tracing::debug!(statistic_id = %hourly_id, dropped, "AMI hours already held by interval series");
            }
            batch.report.claimed_dropped += dropped;

            high_water = high_water.max(overlap::ami_high_water(stored_last, &kept));
            accepted.push((direction, kept));
        }

        for (direction, kept) in accepted {
            batch.push_series(&window, direction, Granularity::Hourly, kept);
        }
        batch.fetched.push(SourceKind::AmiHourly);
        Ok(Some(high_water.unwrap_or(OffsetDateTime::UNIX_EPOCH)))
    }

    async fn fetch_interval(
        &self,
        rt: &AccountRuntime,
        batch: &mut MeterBatch,
        now: OffsetDateTime,
        ami_high_water: OffsetDateTime,
    ) -> Result<(), FetchError> {
        let meter = batch.meter().clone();
        let window = rt.planner.plan_interval(&meter, now, Some(ami_high_water));
        if window.is_empty() {
            batch.fetched.push(SourceKind::Interval);
            return Ok(());
        }

        let raw = match self
            .fetch("interval", || self.source.fetch_interval(&meter, window.since, window.until))
            .await
        {
            Ok(raw) => raw,
            Err(e @ FetchError::Auth(_)) => return Err(e),
            Err(e) => {
                batch.fetch_failed(SourceKind::Interval, &e);
                return Ok(());
            }
        };

        let readings = transform::normalize_interval(&meter, &raw, &window, &mut batch.report.normalize);
        batch.note_return(&readings);
        let mut by_direction = split_by_direction(readings);

        let mut violated = false;
        for &direction in directions(meter.fuel) {
            let readings = by_direction.remove(&direction).unwrap_or_default();
            let interval_id = StatisticId::new(&meter.service_point, meter.fuel, direction, Granularity::Interval);

            match self
                .overlap
                .release_interval_hours(&interval_id, &readings, Some(ami_high_water))
            {
                Ok(hours) => batch.push_series(&window, direction, Granularity::Interval, hours),
                Err(violation) => {
                    tracing::error!(error = %violation, "interval batch overlaps AMI hours, skipping");
                    batch.report.failures.push(format!("interval: {violation}"));
                    violated = true;
                }
            }
        }

        if !violated {
            batch.fetched.push(SourceKind::Interval);
        }
        Ok(())
    }

    /// Write phase for one meter.
    async fn write_meter(&self, rt: &AccountRuntime, tracker: &SumTracker, batch: MeterBatch) -> MeterReport {
        let MeterBatch {
            mut report,
            snapshot,
            series,
            fetched,
            ..
        } = batch;

        let mut failed: HashSet<SourceKind> = HashSet::new();
        for s in series {
            let id = s.metadata.statistic_id.clone();
            match tracker.apply(&s.metadata, &s.readings, s.mode).await {
                Ok(outcome) => {
                    if outcome.rejected {
                        report.rejected_replays.push(id.clone());
                    }
                    report.written.insert(id, outcome.written);
                }
                Err(e) => {
                    tracing::error!(error = %e, statistic_id = %id, "statistics write failed, retrying next cycle");
                    report.failures.push(format!("{}: {e}", s.source));
                    failed.insert(s.source);
                }
            }
        }

        for source in fetched.into_iter().filter(|s| !failed.contains(s)) {
            rt.planner.mark_synced(&report.meter.service_point, source);
        }

        self.entities.publish_meter(&snapshot).await;
        report
    }
}

#[cfg(test)]
mod tests {
    use energy_client::domain::StatisticPoint;
    use time::macros::datetime;

    use super::*;
    use crate::{
        reconcile::{
            test_support::{ami_hours, interval_quarters, raw_meter, RecordingEntities, ScriptedSource},
            window::PlannerState,
        },
        sinks::MemoryStatisticsStore,
        sources::RawBillingUsage,
    };

    struct Harness {
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStatisticsStore>,
        entities: Arc<RecordingEntities>,
        coordinator: ReconciliationCoordinator,
    }

    /// `(entry_id, account_id)` pairs.
    fn harness(accounts: &[(&str, &str)]) -> Harness {
        let source = Arc::new(ScriptedSource::new());
        let store = Arc::new(MemoryStatisticsStore::new());
        let entities = Arc::new(RecordingEntities::default());
        let settings = CoordinatorSettings {
            fetch: FetchPolicy {
                timeout: std::time::Duration::from_secs(5),
                max_attempts: 2,
                retry_backoff: std::time::Duration::from_millis(1),
            },
            meter_concurrency: 2,
        };

        let mut coordinator =
            ReconciliationCoordinator::new(source.clone(), store.clone(), entities.clone(), settings);
        for (entry, account) in accounts {
            coordinator = coordinator.with_entry(entry, [*account]);
        }

        Harness {
            source,
            store,
            entities,
            coordinator,
        }
    }

    fn id(sp: &str, direction: Direction, granularity: Granularity) -> StatisticId {
        StatisticId::new(sp, FuelKind::Electric, direction, granularity)
    }

    fn sums(points: &[StatisticPoint]) -> Vec<f64> {
        points.iter().map(|p| p.sum).collect()
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("cycle did not complete: {other:?}"),
        }
    }

    const DAY: OffsetDateTime = datetime!(2025-01-15 00:00 UTC);

    #[tokio::test]
    async fn ami_cycles_accumulate_and_skip_redelivered_hours() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0, 2.0, 1.5]));

        let now = datetime!(2025-01-15 12:00 UTC);
        completed(h.coordinator.run_scheduled_cycle("acct1", now).await.unwrap());

        let hourly = id("SP1", Direction::Consumption, Granularity::Hourly);
        assert_eq!(sums(&h.store.series(&hourly)), vec![1.0, 3.0, 4.5]);

        // Next cycle re-delivers the same hours plus one new one.
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0, 2.0, 1.5, 0.5]));
        let report = completed(
            h.coordinator
                .run_scheduled_cycle("acct1", now + Duration::HOUR)
                .await
                .unwrap(),
        );

        assert_eq!(report.meters[0].written[&hourly], 1);
        assert_eq!(sums(&h.store.series(&hourly)), vec![1.0, 3.0, 4.5, 5.0]);

        let ami_fetches = h.source.fetches_of("SP1", SourceKind::AmiHourly);
        assert_eq!(ami_fetches[0].span(), Some(Duration::days(1825)));
        assert_eq!(ami_fetches[1].span(), Some(Duration::hours(48)));
    }

    #[tokio::test]
    async fn ami_and_interval_never_write_the_same_hour() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        // AMI lags: hours 00:00-10:00 so far.
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0; 11]));
        // Interval covers 08:00 yesterday through the last full hour.
        let now = datetime!(2025-01-16 12:00 UTC);
        h.source.set_interval(
            "SP1",
            interval_quarters(DAY + Duration::hours(8), datetime!(2025-01-16 12:00 UTC), 0.25),
        );

        completed(h.coordinator.run_scheduled_cycle("acct1", now).await.unwrap());

        let hourly = id("SP1", Direction::Consumption, Granularity::Hourly);
        let interval = id("SP1", Direction::Consumption, Granularity::Interval);
        let disjoint = |store: &MemoryStatisticsStore| {
            let ami: BTreeSet<_> = store.series(&hourly).iter().map(|p| p.start).collect();
            let int: BTreeSet<_> = store.series(&interval).iter().map(|p| p.start).collect();
            assert!(!ami.is_empty() && !int.is_empty());
            assert!(ami.is_disjoint(&int), "hours written by both feeds");
            (ami, int)
        };

        let (ami, int) = disjoint(&h.store);
        assert_eq!(ami.iter().next_back(), Some(&(DAY + Duration::hours(10))));
        assert_eq!(int.iter().next(), Some(&(DAY + Duration::hours(11))));
        assert_eq!(h.store.series(&interval)[0].state, 1.0);

        // Late AMI hours for 11:00-20:00 arrive; interval already holds them.
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0; 21]));
        let report = completed(
            h.coordinator
                .run_scheduled_cycle("acct1", now + Duration::HOUR)
                .await
                .unwrap(),
        );
        assert_eq!(report.meters[0].claimed_dropped, 10);
        disjoint(&h.store);

        let windows = h.source.fetches_of("SP1", SourceKind::Interval);
        assert_eq!(windows[1].span(), Some(Duration::hours(24)));
    }

    #[tokio::test]
    async fn forced_refresh_without_entry_covers_every_account() {
        let h = harness(&[("entry-1", "acct1"), ("entry-2", "acct2")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        h.source.set_meters("acct2", vec![raw_meter("SP2", "Electric", true)]);
        let now = datetime!(2025-01-15 12:00 UTC);

        for account in ["acct1", "acct2"] {
            completed(h.coordinator.run_scheduled_cycle(account, now).await.unwrap());
        }
        assert_eq!(
            h.coordinator.account("acct1").unwrap().planner.state("SP1", SourceKind::AmiHourly),
            PlannerState::Incremental
        );

        let marked = h.coordinator.mark_full_refresh(None).unwrap();
        assert_eq!(marked, vec!["acct1".to_string(), "acct2".to_string()]);
        for (account, sp) in [("acct1", "SP1"), ("acct2", "SP2")] {
            let planner = &h.coordinator.account(account).unwrap().planner;
            for source in SourceKind::ALL {
                assert_eq!(planner.state(sp, source), PlannerState::FullRefresh);
            }
        }

        let later = now + Duration::HOUR;
        let results = h.coordinator.force_full_refresh(None, later).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, res)| matches!(res, Ok(CycleOutcome::Completed(_)))));

        for sp in ["SP1", "SP2"] {
            let ami = h.source.fetches_of(sp, SourceKind::AmiHourly);
            let last = ami.last().unwrap();
            assert_eq!(last.since, later - Duration::days(1825));
            let billing = h.source.fetches_of(sp, SourceKind::Billing);
            assert_eq!(billing.last().unwrap().since, datetime!(2023-10-01 00:00 UTC));
        }
    }

    #[tokio::test]
    async fn forced_refresh_for_unknown_entry_is_rejected() {
        let h = harness(&[("entry-1", "acct1")]);
        let res = h.coordinator.force_full_refresh(Some("nope"), DAY).await;
        assert!(matches!(res, Err(CycleError::UnknownEntry(_))));
        assert!(matches!(h.coordinator.mark_full_refresh(Some("nope")), Err(CycleError::UnknownEntry(_))));
    }

    #[tokio::test]
    async fn full_refresh_heals_gaps_and_keeps_sums_monotone() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        let now = datetime!(2025-01-15 12:00 UTC);

        // Provider initially misses hour 01:00.
        let mut partial = ami_hours(DAY, &[1.0]);
        partial.extend(ami_hours(DAY + Duration::hours(2), &[3.0]));
        h.source.set_ami("SP1", partial);
        completed(h.coordinator.run_scheduled_cycle("acct1", now).await.unwrap());

        let hourly = id("SP1", Direction::Consumption, Granularity::Hourly);
        assert_eq!(sums(&h.store.series(&hourly)), vec![1.0, 4.0]);

        h.source.set_ami("SP1", ami_hours(DAY, &[1.0, 2.0, 3.0, 4.0]));
        h.coordinator
            .force_full_refresh(Some("entry-1"), now + Duration::HOUR)
            .await
            .unwrap();

        let series = h.store.series(&hourly);
        assert_eq!(sums(&series), vec![1.0, 3.0, 6.0, 10.0]);
        assert!(series.windows(2).all(|w| w[0].start < w[1].start && w[0].sum <= w[1].sum));
        assert_eq!(
            h.coordinator.account("acct1").unwrap().planner.state("SP1", SourceKind::AmiHourly),
            PlannerState::Incremental
        );
    }

    #[tokio::test]
    async fn full_refresh_missing_a_stored_hour_keeps_sums_monotone() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0, 2.0, 1.5, 4.0]));
        let now = datetime!(2025-01-15 12:00 UTC);
        completed(h.coordinator.run_scheduled_cycle("acct1", now).await.unwrap());

        // The replay carries an unusable record for 01:00, which the normalizer drops.
        let mut replay = ami_hours(DAY, &[1.0, 2.0, 1.5, 4.0]);
        replay[1].quantity = None;
        h.source.set_ami("SP1", replay);
        let results = h
            .coordinator
            .force_full_refresh(Some("entry-1"), now + Duration::HOUR)
            .await
            .unwrap();
        assert!(matches!(results[0].1, Ok(CycleOutcome::Completed(_))));

        let series = h.store.series(&id("SP1", Direction::Consumption, Granularity::Hourly));
        assert_eq!(sums(&series), vec![1.0, 3.0, 4.5, 8.5]);
        assert!(series.windows(2).all(|w| w[0].sum <= w[1].sum));
    }

    #[tokio::test]
    async fn interval_hours_are_whole_when_the_cycle_runs_mid_hour() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        // AMI lags more than a day behind the second cycle.
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0; 11]));
        completed(
            h.coordinator
                .run_scheduled_cycle("acct1", datetime!(2025-01-16 00:00 UTC))
                .await
                .unwrap(),
        );

        let now = datetime!(2025-01-16 12:30 UTC);
        h.source
            .set_interval("SP1", interval_quarters(DAY + Duration::hours(8), now, 0.25));
        completed(h.coordinator.run_scheduled_cycle("acct1", now).await.unwrap());

        let window = h.source.fetches_of("SP1", SourceKind::Interval).last().unwrap().clone();
        assert_eq!(window.since.minute(), 0);

        let series = h.store.series(&id("SP1", Direction::Consumption, Granularity::Interval));
        assert!(!series.is_empty());
        assert!(series[0].start >= DAY + Duration::hours(11));
        assert!(series.iter().all(|p| p.start.minute() == 0 && p.state == 1.0), "{series:?}");
        assert_eq!(series.last().unwrap().start, datetime!(2025-01-16 11:00 UTC));
    }

    #[tokio::test]
    async fn one_failing_meter_does_not_stop_the_others() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters(
            "acct1",
            vec![raw_meter("SP1", "Electric", true), raw_meter("SP2", "Electric", true)],
        );
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0]));
        h.source.set_ami("SP2", ami_hours(DAY, &[2.0]));
        h.source.fail("SP1", SourceKind::AmiHourly, FetchError::Unavailable("503".into()));

        let now = datetime!(2025-01-15 12:00 UTC);
        let report = completed(h.coordinator.run_scheduled_cycle("acct1", now).await.unwrap());

        assert_eq!(report.failed_meters(), 1);
        assert!(h.store.series(&id("SP1", Direction::Consumption, Granularity::Hourly)).is_empty());
        assert_eq!(h.store.series(&id("SP2", Direction::Consumption, Granularity::Hourly)).len(), 1);
        // Interval is not attempted without a settled AMI high-water mark.
        assert!(h.source.fetches_of("SP1", SourceKind::Interval).is_empty());

        let planner = &h.coordinator.account("acct1").unwrap().planner;
        assert_eq!(planner.state("SP1", SourceKind::AmiHourly), PlannerState::Uninitialized);
        assert_eq!(planner.state("SP2", SourceKind::AmiHourly), PlannerState::Incremental);
        assert_eq!(h.entities.snapshots().len(), 2);

        // Recovers on the next cycle with the full window.
        h.source.clear_failures();
        completed(h.coordinator.run_scheduled_cycle("acct1", now + Duration::HOUR).await.unwrap());
        assert_eq!(h.store.series(&id("SP1", Direction::Consumption, Granularity::Hourly)).len(), 1);
        let sp1 = h.source.fetches_of("SP1", SourceKind::AmiHourly);
        assert_eq!(sp1.last().unwrap().span(), Some(Duration::days(1825)));
    }

    #[tokio::test]
    async fn rejected_login_writes_nothing_and_asks_for_reauth() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters(
            "acct1",
            vec![raw_meter("SP1", "Electric", true), raw_meter("SP2", "Electric", true)],
        );
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0]));
        h.source.set_ami("SP2", ami_hours(DAY, &[2.0]));
        h.source.fail("SP2", SourceKind::Interval, FetchError::Auth("token expired".into()));

        let res = h
            .coordinator
            .run_scheduled_cycle("acct1", datetime!(2025-01-15 12:00 UTC))
            .await;

        assert!(matches!(res, Err(CycleError::ReauthRequired { .. })));
        assert!(h.store.statistic_ids().is_empty());
        assert!(h.entities.snapshots().is_empty());
        assert_eq!(h.entities.reauth(), vec![("entry-1".to_string(), "acct1".to_string())]);
    }

    #[tokio::test]
    async fn negative_reads_become_a_return_series_and_billing_reaches_entities() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        h.source.set_ami("SP1", ami_hours(DAY, &[1.0, -0.5, 2.0]));
        h.source.set_billing(
            "acct1",
            vec![
                RawBillingUsage {
                    usage_year_month: Some(202412),
                    usage_type: Some("TOTAL_KWH".to_string()),
                    usage: Some(610.0),
                },
                RawBillingUsage {
                    usage_year_month: Some(202411),
                    usage_type: Some("TOTAL_KWH".to_string()),
                    usage: Some(540.0),
                },
            ],
            vec![crate::sources::RawBillingCost {
                month: Some(202412),
                fuel_type: Some("ELECTRIC".to_string()),
                amount: Some(98.4),
            }],
        );

        let report = completed(
            h.coordinator
                .run_scheduled_cycle("acct1", datetime!(2025-01-15 12:00 UTC))
                .await
                .unwrap(),
        );

        assert!(report.meters[0].meter.capabilities.has_return);
        assert_eq!(sums(&h.store.series(&id("SP1", Direction::Consumption, Granularity::Hourly))), vec![1.0, 3.0]);
        let ret = id("SP1", Direction::Return, Granularity::Hourly);
        assert_eq!(sums(&h.store.series(&ret)), vec![0.5]);
        assert_eq!(h.store.metadata(&ret).unwrap().name, "SP1 Electric Return Hourly Usage");

        let snapshot = &h.entities.snapshots()[0];
        assert_eq!(snapshot.last_billing_usage, Some((datetime!(2024-12-01 00:00 UTC), 610.0)));
        assert_eq!(snapshot.last_billing_cost, Some((datetime!(2024-12-01 00:00 UTC), 98.4)));
        assert!(snapshot.is_smart_meter);
    }

    #[tokio::test]
    async fn gas_ami_is_written_in_ccf_without_interval() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("G1", "Gas", true)]);
        h.source.set_ami("G1", ami_hours(DAY, &[10.0]));

        completed(
            h.coordinator
                .run_scheduled_cycle("acct1", datetime!(2025-01-15 12:00 UTC))
                .await
                .unwrap(),
        );

        let gas = StatisticId::new("G1", FuelKind::Gas, Direction::Consumption, Granularity::Hourly);
        assert_eq!(sums(&h.store.series(&gas)), vec![10.38]);
        assert_eq!(h.store.metadata(&gas).unwrap().unit_of_measurement, "CCF");
        assert!(h.source.fetches_of("G1", SourceKind::Interval).is_empty());
    }

    #[tokio::test]
    async fn busy_account_skips_tick_and_cancelled_entry_stops() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![]);
        let rt = h.coordinator.account("acct1").unwrap().clone();

        let held = rt.guard.try_begin_regular().unwrap();
        let outcome = h.coordinator.run_scheduled_cycle("acct1", DAY).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped);
        drop(held);

        h.coordinator.cancel_entry("entry-1");
        let res = h.coordinator.run_scheduled_cycle("acct1", DAY).await;
        assert!(matches!(res, Err(CycleError::Cancelled(_))));

        let res = h.coordinator.run_scheduled_cycle("nobody", DAY).await;
        assert!(matches!(res, Err(CycleError::UnknownAccount(_))));
    }

    #[tokio::test]
    async fn discovery_failure_is_reported_and_recovers() {
        let h = harness(&[("entry-1", "acct1")]);
        h.source.set_meters("acct1", vec![raw_meter("SP1", "Electric", true)]);
        h.source
            .fail_discovery("acct1", FetchError::Unavailable("maintenance".into()));

        let res = h.coordinator.run_scheduled_cycle("acct1", DAY).await;
        assert!(matches!(res, Err(CycleError::Discovery { .. })));

        h.source.clear_failures();
        let report = completed(h.coordinator.run_scheduled_cycle("acct1", DAY).await.unwrap());
        assert_eq!(report.account.meters.len(), 1);
    }
}
