pub mod file_export;
pub mod raw;
pub mod retry;

use energy_client::domain::Meter;
use time::OffsetDateTime;

use crate::error::FetchError;

pub use file_export::FileExportSource;
pub use raw::{RawAmiUsage, RawBillingCost, RawBillingUsage, RawIntervalRead, RawMeter};
pub use retry::{fetch_with_retry, FetchPolicy};

/// The utility provider as seen by the reconciliation engine.
///
/// Implementations return raw provider records; the normalizer turns them
/// into canonical readings. Sources should honour the requested window but
/// the engine re-checks it.
#[async_trait::async_trait]
pub trait UtilitySource: Send + Sync {
    /// Meters currently attached to a billing account.
    async fn fetch_meters(&self, account_id: &str) -> Result<Vec<RawMeter>, FetchError>;

    async fn fetch_billing(
        &self,
        account_id: &str,
        meter: &Meter,
        since: OffsetDateTime,
    ) -> Result<Vec<RawBillingUsage>, FetchError>;

    async fn fetch_costs(
        &self,
        account_id: &str,
        meter: &Meter,
        since: OffsetDateTime,
    ) -> Result<Vec<RawBillingCost>, FetchError>;

    async fn fetch_ami(
        &self,
        meter: &Meter,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<RawAmiUsage>, FetchError>;

    async fn fetch_interval(
        &self,
        meter: &Meter,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<RawIntervalRead>, FetchError>;
}
