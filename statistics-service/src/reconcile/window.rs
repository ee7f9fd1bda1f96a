//! Window planner: which time range to fetch per meter and source.
//!
//! State per (meter, source): `Uninitialized -> Incremental`, with a manual
//! `* -> FullRefresh -> Incremental` for forced backfills. Window sizes live
//! in [`WINDOW_POLICY`], not in control flow.

use std::{collections::HashMap, sync::Mutex};

use energy_client::domain::{Meter, SourceKind};
use time::{Date, Duration, Month, OffsetDateTime};

use crate::transform::truncate_to_hour;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlannerState {
    Uninitialized,
    Incremental,
    FullRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpan {
    /// Calendar months back to the first day of the month.
    Months(i32),
    Days(i64),
    Hours(i64),
}

impl WindowSpan {
    pub fn since(&self, now: OffsetDateTime) -> OffsetDateTime {
        match *self {
            Self::Months(n) => months_back(now, n),
            Self::Days(n) => now - Duration::days(n),
            Self::Hours(n) => now - Duration::hours(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub source: SourceKind,
    /// First setup and forced refresh.
    pub full: WindowSpan,
    /// Steady-state polling.
    pub incremental: WindowSpan,
}

/// Five years, the deepest history the provider serves.
pub const FULL_HISTORY: WindowSpan = WindowSpan::Days(1825);

/// The interval incremental span must stay shorter than the AMI one.
pub const WINDOW_POLICY: [WindowPolicy; 3] = [
    WindowPolicy {
        source: SourceKind::Billing,
        full: WindowSpan::Months(15),
        incremental: WindowSpan::Months(12),
    },
    WindowPolicy {
        source: SourceKind::AmiHourly,
        full: FULL_HISTORY,
        incremental: WindowSpan::Hours(48),
    },
    WindowPolicy {
        source: SourceKind::Interval,
        full: FULL_HISTORY,
        incremental: WindowSpan::Hours(24),
    },
];

pub fn policy_for(source: SourceKind) -> &'static WindowPolicy {
    match source {
        SourceKind::Billing => &WINDOW_POLICY[0],
        SourceKind::AmiHourly => &WINDOW_POLICY[1],
        SourceKind::Interval => &WINDOW_POLICY[2],
    }
}

/// First day of the month `n` months before `now`'s month, UTC.
pub fn months_back(now: OffsetDateTime, n: i32) -> OffsetDateTime {
    let index = now.year() * 12 + i32::from(u8::from(now.month())) - 1 - n;
    let year = index.div_euclid(12);
    // rem_euclid(12) is in 0..12, so the cast is lossless.
    let month = Month::January.nth_next(index.rem_euclid(12) as u8);
    match Date::from_calendar_date(year, month, 1) {
        Ok(date) => date.midnight().assume_utc(),
        Err(_) => now - Duration::days(31 * i64::from(n)),
    }
}

/// `ts` if it is on the hour, else the start of the next hour.
fn ceil_to_hour(ts: OffsetDateTime) -> OffsetDateTime {
    let floor = truncate_to_hour(ts);
    if floor == ts {
        floor
    } else {
        floor + Duration::HOUR
    }
}

/// A planned fetch. `forced` marks a forced full refresh, which the sum
/// tracker replays instead of appending to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub source: SourceKind,
    pub since: OffsetDateTime,
    pub until: OffsetDateTime,
    pub forced: bool,
}

impl FetchWindow {
    pub fn new(source: SourceKind, since: OffsetDateTime, until: OffsetDateTime, forced: bool) -> Self {
        Self {
            source,
            since,
            until,
            forced,
        }
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.since <= ts && ts <= self.until
    }

    pub fn is_empty(&self) -> bool {
        self.since > self.until
    }

    pub fn span(&self) -> Duration {
        self.until - self.since
    }
}

#[derive(Debug, Default)]
struct PlannerInner {
    states: HashMap<(String, SourceKind), PlannerState>,
    /// Set by a forced refresh until the refresh cycle has run, so meters
    /// not seen yet are replayed too.
    refresh_requested: bool,
}

/// Planner for the meters of one account.
#[derive(Debug, Default)]
pub struct WindowPlanner {
    inner: Mutex<PlannerInner>,
}

impl WindowPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlannerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, service_point: &str, source: SourceKind) -> PlannerState {
        let inner = self.lock();
        match inner.states.get(&(service_point.to_string(), source)) {
            Some(state) => *state,
            None if inner.refresh_requested => PlannerState::FullRefresh,
            None => PlannerState::Uninitialized,
        }
    }

    pub fn plan(&self, meter: &Meter, source: SourceKind, now: OffsetDateTime) -> FetchWindow {
        let state = self.state(&meter.service_point, source);
        let policy = policy_for(source);
        let span = match state {
            PlannerState::Incremental => policy.incremental,
            PlannerState::Uninitialized | PlannerState::FullRefresh => policy.full,
        };
        FetchWindow::new(source, span.since(now), now, state == PlannerState::FullRefresh)
    }

    /// Interval window, clipped to start after the hours AMI already owns.
    ///
    /// `since` always lands on an hour boundary: a window opening mid-hour
    /// would cut that hour's leading points and write it short.
    pub fn plan_interval(
        &self,
        meter: &Meter,
        now: OffsetDateTime,
        ami_high_water: Option<OffsetDateTime>,
    ) -> FetchWindow {
        let mut window = self.plan(meter, SourceKind::Interval, now);
        window.since = ceil_to_hour(window.since);
        if let Some(high_water) = ami_high_water {
            window.since = window.since.max(high_water + Duration::HOUR);
        }
        window
    }

    /// Data for this source was fetched and written; poll incrementally from now on.
    pub fn mark_synced(&self, service_point: &str, source: SourceKind) {
        self.lock()
            .states
            .insert((service_point.to_string(), source), PlannerState::Incremental);
    }

    /// Move every (meter, source) of the account to `FullRefresh`.
    pub fn request_full_refresh(&self) {
        let mut inner = self.lock();
        inner.refresh_requested = true;
        for state in inner.states.values_mut() {
            *state = PlannerState::FullRefresh;
        }
    }

    /// Called once the refresh cycle ran. Sources that failed keep their
    /// `FullRefresh` state and are replayed on the next cycle.
    pub fn settle_refresh_request(&self, service_points: &[String]) {
        let mut inner = self.lock();
        if !inner.refresh_requested {
            return;
        }
        inner.refresh_requested = false;
        for sp in service_points {
            for source in SourceKind::ALL {
                inner
                    .states
                    .entry((sp.clone(), source))
                    .or_insert(PlannerState::FullRefresh);
            }
        }
    }

    pub fn states(&self) -> Vec<((String, SourceKind), PlannerState)> {
        let mut out: Vec<_> = self.lock().states.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
