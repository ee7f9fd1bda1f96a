//! Overlap guard between the AMI hourly and the interval feed of one meter.
//!
//! An hour belongs to exactly one feed. AMI owns every hour it has delivered
//! up to its high-water mark; interval is only requested after that mark and
//! owns the hours it has written. Interval points are rolled up into hour
//! buckets, and a bucket is released only once it is complete.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Mutex,
};

use energy_client::domain::{Reading, StatisticId};
use time::{Duration, OffsetDateTime};

use super::truncate_to_hour;
use crate::error::OverlapViolation;

/// Used when the spacing of a response cannot be inferred (single point).
const DEFAULT_POINTS_PER_HOUR: usize = 4;

/// Hours that ended this long before the newest point are treated as final.
const SETTLE_AFTER: Duration = Duration::hours(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourBucket {
    pub hour: OffsetDateTime,
    pub quantity: f64,
    pub points: usize,
}

/// Sum interval points per hour. A timestamp repeated in one response counts once.
pub fn bucket_by_hour(readings: &[Reading]) -> BTreeMap<OffsetDateTime, HourBucket> {
    let mut points: BTreeMap<OffsetDateTime, f64> = BTreeMap::new();
    for r in readings {
        points.entry(r.ts).or_insert(r.quantity);
    }

    let mut buckets: BTreeMap<OffsetDateTime, HourBucket> = BTreeMap::new();
    for (ts, quantity) in points {
        let hour = truncate_to_hour(ts);
        let bucket = buckets.entry(hour).or_insert(HourBucket {
            hour,
            quantity: 0.0,
            points: 0,
        });
        bucket.quantity += quantity;
        bucket.points += 1;
    }
    buckets
}

/// Points per hour implied by the smallest spacing in the response.
fn expected_points_per_hour(readings: &[Reading]) -> usize {
    let stamps: BTreeSet<i64> = readings.iter().map(|r| r.ts.unix_timestamp()).collect();
    let min_gap = stamps
        .iter()
        .zip(stamps.iter().skip(1))
        .map(|(a, b)| b - a)
        .filter(|gap| *gap > 0)
        .min();

    match min_gap {
        Some(gap) if gap <= 3600 && 3600 % gap == 0 => (3600 / gap) as usize,
        _ => DEFAULT_POINTS_PER_HOUR,
    }
}

/// Newest hour the AMI series owns after this cycle.
pub fn ami_high_water(stored_last: Option<OffsetDateTime>, accepted: &[Reading]) -> Option<OffsetDateTime> {
    let fetched = accepted.iter().map(|r| r.ts).max();
    stored_last.max(fetched)
}

/// Drop AMI readings for hours the interval series has already written.
pub fn exclude_claimed(
    readings: Vec<Reading>,
    interval_claimed: &BTreeSet<OffsetDateTime>,
) -> (Vec<Reading>, usize) {
    let before = readings.len();
    let kept: Vec<Reading> = readings
        .into_iter()
        .filter(|r| !interval_claimed.contains(&r.ts))
        .collect();
    let dropped = before - kept.len();
    if dropped > 0 {
        metrics::counter!("overlap_claimed_hours_dropped_total").increment(dropped as u64);
    }
    (kept, dropped)
}

/// Remembers, per interval series, how many points each deferred hour had
/// on the previous fetch. In memory only: after a restart a partial hour is
/// deferred one extra cycle.
#[derive(Default)]
pub struct OverlapGuard {
    pending: Mutex<HashMap<StatisticId, BTreeMap<OffsetDateTime, usize>>>,
}

impl OverlapGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll interval points of one series into hour buckets and release the
    /// complete, ascending prefix as hourly readings.
    ///
    /// A bucket is complete when it holds every point of the hour, or when a
    /// later hour is present in the response and the bucket either did not
    /// change since the previous fetch or ended well before the newest point.
    /// The first incomplete bucket and everything after it wait for the next
    /// cycle, so a late hour can never land behind an already written one.
    pub fn release_interval_hours(
        &self,
        statistic_id: &StatisticId,
        readings: &[Reading],
        ami_high_water: Option<OffsetDateTime>,
    ) -> Result<Vec<Reading>, OverlapViolation> {
        let buckets = bucket_by_hour(readings);

        if let Some(high_water) = ami_high_water {
            if let Some(bucket) = buckets.values().find(|b| b.hour <= high_water) {
                metrics::counter!("overlap_violations_total").increment(1);
                return Err(OverlapViolation {
                    statistic_id: statistic_id.clone(),
                    hour: bucket.hour,
                    ami_high_water: high_water,
                });
            }
        }

        let Some(template) = readings.first() else {
            self.lock_pending().remove(statistic_id);
            return Ok(Vec::new());
        };

        let expected = expected_points_per_hour(readings);
        let newest = readings.iter().map(|r| r.ts).max().unwrap_or(template.ts);

        let mut pending = self.lock_pending();
        let previous = pending.remove(statistic_id).unwrap_or_default();

        let mut released = Vec::new();
        let mut deferred = BTreeMap::new();
        let last_hour = buckets.keys().next_back().copied();

        for bucket in buckets.values() {
            if !deferred.is_empty() {
                deferred.insert(bucket.hour, bucket.points);
                continue;
            }

            let has_later = Some(bucket.hour) != last_hour;
            let unchanged = previous.get(&bucket.hour) == Some(&bucket.points);
            let settled = bucket.hour + Duration::HOUR + SETTLE_AFTER <= newest;
            let complete = bucket.points >= expected || (has_later && (unchanged || settled));

            if complete {
                released.push(Reading {
                    ts: bucket.hour,
                    quantity: bucket.quantity,
                    ..template.clone()
                });
            } else {
                deferred.insert(bucket.hour, bucket.points);
            }
        }

        if !deferred.is_empty() {
            metrics::counter!("interval_buckets_deferred_total").increment(deferred.len() as u64);
            tracing::debug!(
                statistic_id = %statistic_id,
                deferred = deferred.len(),
                "holding back incomplete interval hours"
            );
            pending.insert(statistic_id.clone(), deferred);
        }

        Ok(released)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<StatisticId, BTreeMap<OffsetDateTime, usize>>> {
        // A poisoned map only holds deferral hints; keep using it.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
