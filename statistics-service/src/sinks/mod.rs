pub mod entities;
pub mod memory;
pub mod questdb;

use std::{sync::Arc, time::Duration};

use energy_client::domain::{FuelKind, StatisticId, StatisticMetadata, StatisticPoint, SumState};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;

use crate::{
    config::{StoreConfig, StoreKind},
    error::StoreError,
};

pub use entities::TracingEntitySurface;
pub use memory::MemoryStatisticsStore;
pub use questdb::QuestDbStatisticsStore;

/// Long-term statistics store. Writes are upserts keyed by (statistic id, start).
#[async_trait::async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn get_last(&self, statistic_id: &StatisticId) -> Result<Option<SumState>, StoreError>;

    /// Newest point strictly before `before`.
    async fn get_last_before(
        &self,
        statistic_id: &StatisticId,
        before: OffsetDateTime,
    ) -> Result<Option<SumState>, StoreError>;

    /// Points within `[start, end)`, ascending.
    async fn get_points(
        &self,
        statistic_id: &StatisticId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<StatisticPoint>, StoreError>;

    async fn write_points(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError>;
}

/// Per-meter values published to the host each cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    pub account_id: String,
    pub service_point: String,
    pub fuel: FuelKind,
    /// Month start and usage of the latest billing period.
    pub last_billing_usage: Option<(OffsetDateTime, f64)>,
    /// Month start and amount of the latest billed cost.
    pub last_billing_cost: Option<(OffsetDateTime, f64)>,
    pub is_smart_meter: bool,
}

/// Host entity/sensor surface.
#[async_trait::async_trait]
pub trait EntitySurface: Send + Sync {
    async fn publish_meter(&self, snapshot: &MeterSnapshot);

    /// The provider rejected the account's credentials.
    async fn reauth_required(&self, entry_id: &str, account_id: &str);
}

pub async fn connect_store(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn StatisticsStore>> {
    match cfg.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStatisticsStore::new())),
        StoreKind::Questdb => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.max_connections)
                .connect(&cfg.uri)
                .await?;
            energy_client::db::statistics_queries::ensure_schema(&pool).await?;
            Ok(Arc::new(QuestDbStatisticsStore::new(
                pool,
                cfg.max_retries,
                Duration::from_millis(cfg.retry_backoff_ms),
            )))
        }
    }
}
