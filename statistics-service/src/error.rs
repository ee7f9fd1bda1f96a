use std::time::Duration;

use energy_client::domain::StatisticId;
use time::OffsetDateTime;

/// Failure talking to the utility provider.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Transient failures are retried (bounded) and then left for the next cycle.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Auth(_))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("statistics query failed for {statistic_id}: {message}")]
    Query {
        statistic_id: StatisticId,
        message: String,
    },
    #[error("statistics write failed for {statistic_id}: {message}")]
    Write {
        statistic_id: StatisticId,
        message: String,
    },
}

/// Why a single raw record was dropped. Never fatal to its batch.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("unparseable timestamp '{0}'")]
    UnparseableTimestamp(String),
    #[error("missing quantity")]
    MissingQuantity,
    #[error("non-finite quantity {0}")]
    InvalidQuantity(f64),
    #[error("timestamp {0} outside fetch window")]
    OutOfWindow(OffsetDateTime),
    #[error("record belongs to another fuel ({0})")]
    OtherFuel(String),
}

impl NormalizationError {
    /// Label used for the drop counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingTimestamp | Self::UnparseableTimestamp(_) => "timestamp",
            Self::MissingQuantity | Self::InvalidQuantity(_) => "quantity",
            Self::OutOfWindow(_) => "out_of_window",
            Self::OtherFuel(_) => "other_fuel",
        }
    }
}

/// An interval bucket landed on an hour the AMI feed already owns.
///
/// The window planner never requests such hours, so this signals a planning
/// bug; the offending batch is skipped.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("interval bucket {hour} for {statistic_id} overlaps AMI data through {ami_high_water}")]
pub struct OverlapViolation {
    pub statistic_id: StatisticId,
    pub hour: OffsetDateTime,
    pub ami_high_water: OffsetDateTime,
}

/// Failure of a whole account cycle (per-meter failures are reported, not raised).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("reauthentication required for account {account_id}: {source}")]
    ReauthRequired {
        account_id: String,
        source: FetchError,
    },
    #[error("meter discovery failed for account {account_id}: {source}")]
    Discovery {
        account_id: String,
        source: FetchError,
    },
    #[error("unknown entry '{0}'")]
    UnknownEntry(String),
    #[error("unknown account '{0}'")]
    UnknownAccount(String),
    #[error("cycle for account {0} cancelled")]
    Cancelled(String),
}
