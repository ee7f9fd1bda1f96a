use std::fmt;

use time::OffsetDateTime;

use super::{
    meter::{FuelKind, Meter},
    reading::{Direction, SourceKind},
};

/// `source` of every external statistic series we own.
pub const STATISTIC_SOURCE: &str = "national_grid";

/// Resolution label embedded in statistic identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Hourly,
    Interval,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Interval => "interval",
        }
    }

    /// Billing totals are not written as long-term statistics.
    pub fn for_source(source: SourceKind) -> Option<Self> {
        match source {
            SourceKind::Billing => None,
            SourceKind::AmiHourly => Some(Self::Hourly),
            SourceKind::Interval => Some(Self::Interval),
        }
    }
}

/// `national_grid:{service_point}_{fuel}[_return]_{granularity}_usage`.
///
/// The format is stable: it is the join key between cycles and the
/// identity of the series in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatisticId(String);

impl StatisticId {
    pub fn new(
        service_point: &str,
        fuel: FuelKind,
        direction: Direction,
        granularity: Granularity,
    ) -> Self {
        let return_segment = match direction {
            Direction::Consumption => "",
            Direction::Return => "_return",
        };
        Self(format!(
            "{STATISTIC_SOURCE}:{service_point}_{fuel}{return_segment}_{granularity}_usage",
            fuel = fuel.as_str(),
            granularity = granularity.as_str(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StatisticId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticMetadata {
    pub statistic_id: StatisticId,
    pub name: String,
    pub source: String,
    pub unit_of_measurement: String,
    pub has_sum: bool,
    pub has_mean: bool,
}

impl StatisticMetadata {
    pub fn for_series(
        service_point: &str,
        fuel: FuelKind,
        direction: Direction,
        granularity: Granularity,
    ) -> Self {
        let direction_label = match direction {
            Direction::Consumption => "",
            Direction::Return => " Return",
        };
        let granularity_label = match granularity {
            Granularity::Hourly => "Hourly",
            Granularity::Interval => "Interval",
        };

        Self {
            statistic_id: StatisticId::new(service_point, fuel, direction, granularity),
            name: format!(
                "{service_point} {}{direction_label} {granularity_label} Usage",
                fuel.title()
            ),
            source: STATISTIC_SOURCE.to_string(),
            unit_of_measurement: fuel.unit().to_string(),
            has_sum: true,
            has_mean: false,
        }
    }
}

/// One hour of a cumulative series.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct StatisticPoint {
    #[sqlx(rename = "ts")]
    pub start: OffsetDateTime,
    /// Quantity of this hour alone.
    pub state: f64,
    /// Running total up to and including this hour.
    pub sum: f64,
}

/// Last written point of a series, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct SumState {
    #[sqlx(rename = "ts")]
    pub last_start: OffsetDateTime,
    #[sqlx(rename = "sum")]
    pub last_sum: f64,
}

/// Every identifier a meter can produce, e.g. for clearing on removal.
pub fn statistic_ids_for(meter: &Meter) -> Vec<StatisticId> {
    let mut ids = Vec::new();
    let mut granularities = Vec::new();
    if meter.capabilities.supports_ami {
        granularities.push(Granularity::Hourly);
    }
    if meter.capabilities.supports_interval {
        granularities.push(Granularity::Interval);
    }

    for granularity in granularities {
        for direction in Direction::ALL {
            if direction == Direction::Return && meter.fuel == FuelKind::Gas {
                continue;
            }
            ids.push(StatisticId::new(
                &meter.service_point,
                meter.fuel,
                direction,
                granularity,
            ));
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::meter::{BillingMetadata, MeterCapabilities};

    #[test]
    fn statistic_id_format_is_stable() {
        let id = StatisticId::new("SP1", FuelKind::Electric, Direction::Consumption, Granularity::Hourly);
        assert_eq!(id.as_str(), "national_grid:SP1_electric_hourly_usage");

        let id = StatisticId::new("SP1", FuelKind::Electric, Direction::Return, Granularity::Interval);
        assert_eq!(id.as_str(), "national_grid:SP1_electric_return_interval_usage");

        let id = StatisticId::new("9001", FuelKind::Gas, Direction::Consumption, Granularity::Hourly);
        assert_eq!(id.to_string(), "national_grid:9001_gas_hourly_usage");
    }

    #[test]
    fn metadata_names_and_units_follow_fuel() {
        let meta = StatisticMetadata::for_series("SP1", FuelKind::Gas, Direction::Consumption, Granularity::Hourly);
        assert_eq!(meta.name, "SP1 Gas Hourly Usage");
        assert_eq!(meta.unit_of_measurement, "CCF");
        assert!(meta.has_sum);
        assert!(!meta.has_mean);

        let meta = StatisticMetadata::for_series("SP1", FuelKind::Electric, Direction::Return, Granularity::Interval);
        assert_eq!(meta.name, "SP1 Electric Return Interval Usage");
        assert_eq!(meta.unit_of_measurement, "kWh");
        assert_eq!(meta.source, "national_grid");
    }

    #[test]
    fn ids_for_ami_electric_meter_cover_both_feeds_and_directions() {
        let meter = Meter {
            service_point: "SP1".to_string(),
            account_id: "acct1".to_string(),
            fuel: FuelKind::Electric,
            capabilities: MeterCapabilities::derive(FuelKind::Electric, true, false),
            billing: BillingMetadata::default(),
        };

        let ids: Vec<String> = statistic_ids_for(&meter).iter().map(|id| id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "national_grid:SP1_electric_hourly_usage",
                "national_grid:SP1_electric_return_hourly_usage",
                "national_grid:SP1_electric_interval_usage",
                "national_grid:SP1_electric_return_interval_usage",
            ]
        );
    }
}
