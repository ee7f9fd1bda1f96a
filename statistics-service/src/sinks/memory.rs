use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use energy_client::domain::{StatisticId, StatisticMetadata, StatisticPoint, SumState};
use time::OffsetDateTime;

use super::StatisticsStore;
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    series: HashMap<StatisticId, BTreeMap<OffsetDateTime, StatisticPoint>>,
    metadata: HashMap<StatisticId, StatisticMetadata>,
}

/// Process-local store with the same upsert semantics as the QuestDB tables.
/// Used for dry runs and tests.
#[derive(Default)]
pub struct MemoryStatisticsStore {
    inner: Mutex<Inner>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Full series, ascending.
    pub fn series(&self, statistic_id: &StatisticId) -> Vec<StatisticPoint> {
        self.lock()
            .series
            .get(statistic_id)
            .map(|points| points.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn metadata(&self, statistic_id: &StatisticId) -> Option<StatisticMetadata> {
        self.lock().metadata.get(statistic_id).cloned()
    }

    pub fn statistic_ids(&self) -> Vec<StatisticId> {
        let mut ids: Vec<_> = self.lock().series.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn sum_state(point: &StatisticPoint) -> SumState {
    SumState {
        last_start: point.start,
        last_sum: point.sum,
    }
}

#[async_trait::async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn get_last(&self, statistic_id: &StatisticId) -> Result<Option<SumState>, StoreError> {
        Ok(self
            .lock()
            .series
            .get(statistic_id)
            .and_then(|points| points.values().next_back())
            .map(sum_state))
    }

    async fn get_last_before(
        &self,
        statistic_id: &StatisticId,
        before: OffsetDateTime,
    ) -> Result<Option<SumState>, StoreError> {
        Ok(self
            .lock()
            .series
            .get(statistic_id)
            .and_then(|points| points.range(..before).next_back())
            .map(|(_, p)| sum_state(p)))
    }

    async fn get_points(
        &self,
        statistic_id: &StatisticId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<StatisticPoint>, StoreError> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()
            .series
            .get(statistic_id)
            .map(|points| points.range(start..end).map(|(_, p)| *p).collect())
            .unwrap_or_default())
    }

    async fn write_points(
        &self,
        metadata: &StatisticMetadata,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock();
        let id = metadata.statistic_id.clone();
        inner.metadata.insert(id.clone(), metadata.clone());
        let series = inner.series.entry(id).or_default();
        for p in points {
            series.insert(p.start, *p);
        }
        metrics::counter!("statistics_points_written_total").increment(points.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use energy_client::domain::{Direction, FuelKind, Granularity};
    use time::macros::datetime;

    use super::*;

    fn meta() -> StatisticMetadata {
        StatisticMetadata::for_series("SP1", FuelKind::Electric, Direction::Consumption, Granularity::Hourly)
    }

    fn point(start: OffsetDateTime, state: f64, sum: f64) -> StatisticPoint {
        StatisticPoint { start, state, sum }
    }

    #[tokio::test]
    async fn writes_upsert_by_start_and_queries_are_ordered() {
        let store = MemoryStatisticsStore::new();
        let meta = meta();
        let id = meta.statistic_id.clone();

        store
            .write_points(
                &meta,
                &[
                    point(datetime!(2025-01-15 01:00 UTC), 2.0, 3.0),
                    point(datetime!(2025-01-15 00:00 UTC), 1.0, 1.0),
                ],
            )
            .await
            .unwrap();
        store
            .write_points(&meta, &[point(datetime!(2025-01-15 01:00 UTC), 2.5, 3.5)])
            .await
            .unwrap();

        let series = store.series(&id);
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].sum, 3.5);

        let last = store.get_last(&id).await.unwrap().unwrap();
        assert_eq!(last.last_start, datetime!(2025-01-15 01:00 UTC));

        let before = store
            .get_last_before(&id, datetime!(2025-01-15 01:00 UTC))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.last_sum, 1.0);

        let window = store
            .get_points(&id, datetime!(2025-01-15 00:30 UTC), datetime!(2025-01-15 02:00 UTC))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(store.metadata(&id), Some(meta));
    }

    #[tokio::test]
    async fn unknown_series_is_empty() {
        let store = MemoryStatisticsStore::new();
        let id = meta().statistic_id;
        assert_eq!(store.get_last(&id).await.unwrap(), None);
        assert!(store.statistic_ids().is_empty());
    }
}
