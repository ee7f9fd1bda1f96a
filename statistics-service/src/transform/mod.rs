//! Reading normalizer: raw provider records to canonical readings.
//!
//! Rules:
//! - timestamps are UTC; naive timestamps are taken as UTC;
//! - AMI timestamps are truncated to the top of the hour;
//! - negative quantities become `Return` readings with a positive magnitude;
//! - gas AMI quantities are converted from therms to CCF;
//! - unusable records are dropped and counted, never failing the batch.

pub mod overlap;

use energy_client::domain::{BillingMetadata, Direction, FuelKind, Meter, MeterCapabilities, Reading, SourceKind};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, Duration, Month,
    OffsetDateTime, PrimitiveDateTime, Time, UtcOffset,
};

use crate::{
    error::NormalizationError,
    reconcile::window::FetchWindow,
    sources::raw::{RawAmiUsage, RawBillingCost, RawBillingUsage, RawIntervalRead, RawMeter},
};

pub use overlap::{HourBucket, OverlapGuard};

/// 1 therm = 1.038 CCF.
pub const THERM_TO_CCF: f64 = 1.038;

pub fn therms_to_ccf(therms: f64) -> f64 {
    (therms * THERM_TO_CCF * 100.0).round() / 100.0
}

/// Per-batch drop accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub accepted: usize,
    pub bad_timestamp: usize,
    pub bad_quantity: usize,
    pub out_of_window: usize,
    pub other_fuel: usize,
}

impl NormalizeReport {
    pub fn dropped(&self) -> usize {
        self.bad_timestamp + self.bad_quantity + self.out_of_window + self.other_fuel
    }

    fn record_drop(&mut self, err: &NormalizationError) {
        match err {
            NormalizationError::MissingTimestamp | NormalizationError::UnparseableTimestamp(_) => {
                self.bad_timestamp += 1
            }
            NormalizationError::MissingQuantity | NormalizationError::InvalidQuantity(_) => {
                self.bad_quantity += 1
            }
            NormalizationError::OutOfWindow(_) => self.out_of_window += 1,
            NormalizationError::OtherFuel(_) => self.other_fuel += 1,
        }
        metrics::counter!("normalize_dropped_records_total", "reason" => err.reason()).increment(1);
    }

    fn collect(&mut self, res: Result<Reading, NormalizationError>, out: &mut Vec<Reading>) {
        match res {
            Ok(reading) => {
                self.accepted += 1;
                out.push(reading);
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping raw record");
                self.record_drop(&e);
            }
        }
    }
}

pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, NormalizationError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(NormalizationError::MissingTimestamp);
    }

    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(ts.to_offset(UtcOffset::UTC));
    }

    PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        .or_else(|_| {
            PrimitiveDateTime::parse(
                s,
                format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
            )
        })
        .or_else(|_| {
            PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        })
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| NormalizationError::UnparseableTimestamp(s.to_string()))
}

pub fn truncate_to_hour(ts: OffsetDateTime) -> OffsetDateTime {
    let ts = ts.to_offset(UtcOffset::UTC);
    ts.replace_time(Time::MIDNIGHT + Duration::hours(i64::from(ts.hour())))
}

/// First instant (UTC) of a `YYYYMM` month.
pub fn month_start(year_month: i64) -> Option<OffsetDateTime> {
    let year = i32::try_from(year_month / 100).ok()?;
    let month = Month::try_from(u8::try_from(year_month % 100).ok()?).ok()?;
    let date = Date::from_calendar_date(year, month, 1).ok()?;
    Some(date.midnight().assume_utc())
}

fn quantity(value: Option<f64>) -> Result<f64, NormalizationError> {
    match value {
        None => Err(NormalizationError::MissingQuantity),
        Some(q) if !q.is_finite() => Err(NormalizationError::InvalidQuantity(q)),
        Some(q) => Ok(q),
    }
}

fn check_window(ts: OffsetDateTime, window: &FetchWindow) -> Result<(), NormalizationError> {
    if window.contains(ts) {
        Ok(())
    } else {
        Err(NormalizationError::OutOfWindow(ts))
    }
}

/// Build the domain meter from a discovery record. Records without a
/// service point or with an unknown fuel are skipped.
pub fn normalize_meter(account_id: &str, raw: &RawMeter) -> Option<Meter> {
    let service_point = raw.service_point_number.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
    let fuel: FuelKind = match raw.fuel_type.as_deref().unwrap_or_default().parse() {
        Ok(fuel) => fuel,
        Err(e) => {
            tracing::debug!(error = %e, service_point, "skipping meter");
            return None;
        }
    };

    Some(Meter {
        service_point: service_point.to_string(),
        account_id: account_id.to_string(),
        fuel,
        capabilities: MeterCapabilities::derive(fuel, raw.has_ami_smart_meter, raw.is_smart_meter),
        billing: BillingMetadata {
            meter_number: raw.meter_number.clone().unwrap_or_else(|| service_point.to_string()),
            meter_point_number: raw.meter_point_number.clone().unwrap_or_default(),
            premise_number: raw.premise_number.clone().unwrap_or_default(),
            region: raw.region.clone(),
        },
    })
}

fn ami_reading(meter: &Meter, raw: &RawAmiUsage, window: &FetchWindow) -> Result<Reading, NormalizationError> {
    let ts = truncate_to_hour(parse_timestamp(raw.date.as_deref().unwrap_or_default())?);
    let (direction, magnitude) = Direction::split(quantity(raw.quantity)?);
    check_window(ts, window)?;

    let quantity = match meter.fuel {
        FuelKind::Gas => therms_to_ccf(magnitude),
        FuelKind::Electric => magnitude,
    };

    Ok(Reading {
        service_point: meter.service_point.clone(),
        fuel: meter.fuel,
        source: SourceKind::AmiHourly,
        direction,
        ts,
        quantity,
    })
}

fn interval_reading(
    meter: &Meter,
    raw: &RawIntervalRead,
    window: &FetchWindow,
) -> Result<Reading, NormalizationError> {
    let ts = parse_timestamp(raw.start_time.as_deref().unwrap_or_default())?;
    let (direction, quantity) = Direction::split(quantity(raw.value)?);
    check_window(ts, window)?;

    Ok(Reading {
        service_point: meter.service_point.clone(),
        fuel: meter.fuel,
        source: SourceKind::Interval,
        direction,
        ts,
        quantity,
    })
}

fn billing_reading(
    meter: &Meter,
    raw: &RawBillingUsage,
    window: &FetchWindow,
) -> Result<Reading, NormalizationError> {
    let usage_type = raw.usage_type.as_deref().unwrap_or_default();
    if usage_type != meter.fuel.billing_usage_type() {
        return Err(NormalizationError::OtherFuel(usage_type.to_string()));
    }

    let year_month = raw.usage_year_month.ok_or(NormalizationError::MissingTimestamp)?;
    let ts = month_start(year_month)
        .ok_or_else(|| NormalizationError::UnparseableTimestamp(year_month.to_string()))?;
    let (direction, quantity) = Direction::split(quantity(raw.usage)?);
    check_window(ts, window)?;

    Ok(Reading {
        service_point: meter.service_point.clone(),
        fuel: meter.fuel,
        source: SourceKind::Billing,
        direction,
        ts,
        quantity,
    })
}

pub fn normalize_ami(
    meter: &Meter,
    records: &[RawAmiUsage],
    window: &FetchWindow,
    report: &mut NormalizeReport,
) -> Vec<Reading> {
    let mut out = Vec::with_capacity(records.len());
    for raw in records {
        report.collect(ami_reading(meter, raw, window), &mut out);
    }
    out
}

pub fn normalize_interval(
    meter: &Meter,
    records: &[RawIntervalRead],
    window: &FetchWindow,
    report: &mut NormalizeReport,
) -> Vec<Reading> {
    let mut out = Vec::with_capacity(records.len());
    for raw in records {
        report.collect(interval_reading(meter, raw, window), &mut out);
    }
    out
}

pub fn normalize_billing(
    meter: &Meter,
    records: &[RawBillingUsage],
    window: &FetchWindow,
    report: &mut NormalizeReport,
) -> Vec<Reading> {
    let mut out = Vec::with_capacity(records.len());
    for raw in records {
        report.collect(billing_reading(meter, raw, window), &mut out);
    }
    out
}

/// Latest month's billed amount for the meter's fuel.
pub fn latest_cost(meter: &Meter, costs: &[RawBillingCost]) -> Option<(OffsetDateTime, f64)> {
    costs
        .iter()
        .filter(|c| {
            c.fuel_type
                .as_deref()
                .and_then(|f| f.parse::<FuelKind>().ok())
                == Some(meter.fuel)
        })
        .filter_map(|c| {
            let month = month_start(c.month?)?;
            let amount = c.amount.filter(|a| a.is_finite())?;
            Some((month, amount))
        })
        .max_by_key(|(month, _)| *month)
}
