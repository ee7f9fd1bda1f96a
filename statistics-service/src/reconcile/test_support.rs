//! Collaborator fakes for coordinator and scheduler tests.

use std::{collections::HashMap, sync::Mutex};

use energy_client::domain::{Meter, SourceKind};
use time::{Duration, OffsetDateTime};

use crate::{
    error::FetchError,
    sinks::{EntitySurface, MeterSnapshot},
    sources::{RawAmiUsage, RawBillingCost, RawBillingUsage, RawIntervalRead, RawMeter, UtilitySource},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFetch {
    pub account_id: String,
    pub service_point: String,
    pub source: SourceKind,
    pub since: OffsetDateTime,
    pub until: Option<OffsetDateTime>,
}

impl RecordedFetch {
    pub fn span(&self) -> Option<Duration> {
        self.until.map(|until| until - self.since)
    }
}

#[derive(Default)]
struct Script {
    meters: HashMap<String, Vec<RawMeter>>,
    billing: HashMap<String, Vec<RawBillingUsage>>,
    costs: HashMap<String, Vec<RawBillingCost>>,
    ami: HashMap<String, Vec<RawAmiUsage>>,
    interval: HashMap<String, Vec<RawIntervalRead>>,
    failures: HashMap<(String, SourceKind), FetchError>,
    discovery_failures: HashMap<String, FetchError>,
}

/// Utility source returning whatever the test scripted, recording every call.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<Script>,
    fetches: Mutex<Vec<RecordedFetch>>,
}

pub fn raw_meter(service_point: &str, fuel: &str, ami: bool) -> RawMeter {
    RawMeter {
        service_point_number: Some(service_point.to_string()),
        fuel_type: Some(fuel.to_string()),
        has_ami_smart_meter: ami,
        ..RawMeter::default()
    }
}

pub fn ami(date: &str, quantity: f64) -> RawAmiUsage {
    RawAmiUsage {
        date: Some(date.to_string()),
        quantity: Some(quantity),
    }
}

/// Hourly AMI records starting at `from`.
pub fn ami_hours(from: OffsetDateTime, quantities: &[f64]) -> Vec<RawAmiUsage> {
    quantities
        .iter()
        .enumerate()
        .map(|(i, q)| RawAmiUsage {
            date: Some(format_ts(from + Duration::hours(i as i64))),
            quantity: Some(*q),
        })
        .collect()
}

/// Quarter-hour interval records from `from` (inclusive) to `to` (exclusive).
pub fn interval_quarters(from: OffsetDateTime, to: OffsetDateTime, value: f64) -> Vec<RawIntervalRead> {
    let mut out = Vec::new();
    let mut ts = from;
    while ts < to {
        out.push(RawIntervalRead {
            start_time: Some(format_ts(ts)),
            value: Some(value),
        });
        ts += Duration::minutes(15);
    }
    out
}

fn format_ts(ts: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:00.000Z",
        ts.year(),
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute()
    )
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn set_meters(&self, account_id: &str, meters: Vec<RawMeter>) {
        self.script().meters.insert(account_id.to_string(), meters);
    }

    pub fn set_billing(&self, account_id: &str, billing: Vec<RawBillingUsage>, costs: Vec<RawBillingCost>) {
        let mut script = self.script();
        script.billing.insert(account_id.to_string(), billing);
        script.costs.insert(account_id.to_string(), costs);
    }

    pub fn set_ami(&self, service_point: &str, records: Vec<RawAmiUsage>) {
        self.script().ami.insert(service_point.to_string(), records);
    }

    pub fn set_interval(&self, service_point: &str, records: Vec<RawIntervalRead>) {
        self.script().interval.insert(service_point.to_string(), records);
    }

    pub fn fail(&self, service_point: &str, source: SourceKind, error: FetchError) {
        self.script()
            .failures
            .insert((service_point.to_string(), source), error);
    }

    pub fn fail_discovery(&self, account_id: &str, error: FetchError) {
        self.script()
            .discovery_failures
            .insert(account_id.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut script = self.script();
        script.failures.clear();
        script.discovery_failures.clear();
    }

    pub fn fetches(&self) -> Vec<RecordedFetch> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetches_of(&self, service_point: &str, source: SourceKind) -> Vec<RecordedFetch> {
        self.fetches()
            .into_iter()
            .filter(|f| f.service_point == service_point && f.source == source)
            .collect()
    }

    fn record(
        &self,
        meter: &Meter,
        source: SourceKind,
        since: OffsetDateTime,
        until: Option<OffsetDateTime>,
    ) -> Result<(), FetchError> {
        self.fetches.lock().unwrap().push(RecordedFetch {
            account_id: meter.account_id.clone(),
            service_point: meter.service_point.clone(),
            source,
            since,
            until,
        });
        match self.script().failures.get(&(meter.service_point.clone(), source)) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl UtilitySource for ScriptedSource {
    async fn fetch_meters(&self, account_id: &str) -> Result<Vec<RawMeter>, FetchError> {
        let script = self.script();
        if let Some(e) = script.discovery_failures.get(account_id) {
            return Err(e.clone());
        }
        script
            .meters
            .get(account_id)
            .cloned()
            .ok_or_else(|| FetchError::Unavailable(format!("no account {account_id}")))
    }

    async fn fetch_billing(
        &self,
        account_id: &str,
        meter: &Meter,
        since: OffsetDateTime,
    ) -> Result<Vec<RawBillingUsage>, FetchError> {
        self.record(meter, SourceKind::Billing, since, None)?;
        Ok(self.script().billing.get(account_id).cloned().unwrap_or_default())
    }

    async fn fetch_costs(
        &self,
        account_id: &str,
        _meter: &Meter,
        _since: OffsetDateTime,
    ) -> Result<Vec<RawBillingCost>, FetchError> {
        Ok(self.script().costs.get(account_id).cloned().unwrap_or_default())
    }

    async fn fetch_ami(
        &self,
        meter: &Meter,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<RawAmiUsage>, FetchError> {
        self.record(meter, SourceKind::AmiHourly, since, Some(until))?;
        Ok(self.script().ami.get(&meter.service_point).cloned().unwrap_or_default())
    }

    async fn fetch_interval(
        &self,
        meter: &Meter,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<RawIntervalRead>, FetchError> {
        self.record(meter, SourceKind::Interval, since, Some(until))?;
        Ok(self
            .script()
            .interval
            .get(&meter.service_point)
            .cloned()
            .unwrap_or_default())
    }
}

/// Entity surface that keeps everything it is told.
#[derive(Default)]
pub struct RecordingEntities {
    pub snapshots: Mutex<Vec<MeterSnapshot>>,
    pub reauth: Mutex<Vec<(String, String)>>,
}

impl RecordingEntities {
    pub fn snapshots(&self) -> Vec<MeterSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn reauth(&self) -> Vec<(String, String)> {
        self.reauth.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EntitySurface for RecordingEntities {
    async fn publish_meter(&self, snapshot: &MeterSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }

    async fn reauth_required(&self, entry_id: &str, account_id: &str) {
        self.reauth
            .lock()
            .unwrap()
            .push((entry_id.to_string(), account_id.to_string()));
    }
}
