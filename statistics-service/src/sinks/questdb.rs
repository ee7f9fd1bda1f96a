use std::{future::Future, time::Duration};

use energy_client::{
    db::statistics_queries,
    domain::{StatisticId, StatisticMetadata, StatisticPoint, SumState},
};
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use super::StatisticsStore;
use crate::error::StoreError;

#[derive(Clone, Copy)]
enum Op {
    Query,
    Write,
}

/// Statistics store on QuestDB over pgwire.
pub struct QuestDbStatisticsStore {
    pool: PgPool,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbStatisticsStore {
    pub fn new(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_backoff,
        }
    }

    async fn with_retry<T, F, Fut>(&self, statistic_id: &StatisticId, op: Op, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        statistic_id = %statistic_id,
                        "questdb statistics call failed, retrying with backoff"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, statistic_id = %statistic_id, "questdb statistics call failed, giving up");
                    metrics::counter!("statistics_store_errors_total").increment(1);
                    let message = format!("{e:#}");
                    return Err(match op {
                        Op::Query => StoreError::Query {
                            statistic_id: statistic_id.clone(),
                            message,
                        },
                        Op::Write => StoreError::Write {
                            statistic_id: statistic_id.clone(),
                            message,
                        },
                    });
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl StatisticsStore for QuestDbStatisticsStore {
    async fn get_last(&self, statistic_id: &StatisticId) -> Result<Option<SumState>, StoreError> {
        self.with_retry(statistic_id, Op::Query, || {
            statistics_queries::last_statistic(&self.pool, statistic_id)
        })
        .await
    }

    async fn get_last_before(
        &self,
        statistic_id: &StatisticId,
        before: OffsetDateTime,
    ) -> Result<Option<SumState>, StoreError> {
        self.with_retry(statistic_id, Op::Query, || {
            statistics_queries::last_statistic_before(&self.pool, statistic_id, before)
        })
        .await
    }

    async fn get_points(
        &self,
        statistic_id: &StatisticId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<StatisticPoint>, StoreError> {
        self.with_retry(statistic_id, Op::Query, || {
            statistics_queries::statistic_series(&self.pool, statistic_id, start, end)
        })
        .await
    }

    async fn write_points(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let id = &metadata.statistic_id;
        self.with_retry(id, Op::Write, || async {
            statistics_queries::upsert_metadata(&self.pool, metadata).await?;
            statistics_queries::upsert_points(&self.pool, id, points).await
        })
        .await?;

        metrics::counter!("statistics_points_written_total").increment(points.len() as u64);
        Ok(())
    }
}
