use std::fmt;

use time::OffsetDateTime;

use super::meter::FuelKind;

/// Which provider feed a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SourceKind {
    /// Monthly billing-period totals.
    Billing,
    /// Hourly AMI smart-meter reads.
    AmiHourly,
    /// 15-minute interval reads.
    Interval,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::Billing, Self::AmiHourly, Self::Interval];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::AmiHourly => "ami_hourly",
            Self::Interval => "interval",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Direction {
    /// Energy drawn from the grid.
    Consumption,
    /// Energy returned to the grid (net-metered solar).
    Return,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Self::Consumption, Self::Return];

    /// Split a signed provider quantity into direction and magnitude.
    pub fn split(quantity: f64) -> (Self, f64) {
        if quantity < 0.0 {
            (Self::Return, -quantity)
        } else {
            (Self::Consumption, quantity)
        }
    }
}

/// Canonical reading. `quantity` is always a non-negative magnitude.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub service_point: String,
    pub fuel: FuelKind,
    pub source: SourceKind,
    pub direction: Direction,
    pub ts: OffsetDateTime,
    pub quantity: f64,
}
