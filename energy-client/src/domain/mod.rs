pub mod meter;
pub mod reading;
pub mod statistic;

pub use meter::{Account, BillingMetadata, FuelKind, Meter, MeterCapabilities};
pub use reading::{Direction, Reading, SourceKind};
pub use statistic::{
    statistic_ids_for, Granularity, StatisticId, StatisticMetadata, StatisticPoint, SumState,
    STATISTIC_SOURCE,
};
