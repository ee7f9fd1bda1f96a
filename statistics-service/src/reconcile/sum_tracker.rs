//! Sum tracker: incremental quantities to the cumulative series the store keeps.
//!
//! The running sum is re-derived from the store at the start of every cycle
//! and cached per statistic id only for the lifetime of one tracker. A tracker
//! is created per cycle, so nothing survives a restart except what was written.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use energy_client::domain::{Reading, StatisticId, StatisticMetadata, StatisticPoint, SumState};
use time::OffsetDateTime;

use crate::{error::StoreError, sinks::StatisticsStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SumMode {
    /// Append after the stored last point; anything at or before it is a re-delivery.
    Incremental,
    /// Replay the whole batch over the stored series.
    FullRefresh,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackOutcome {
    pub written: usize,
    pub discarded: usize,
    pub final_sum: Option<f64>,
    /// A replay ended before the stored series does and was not written.
    pub rejected: bool,
}

type Cursor = Arc<tokio::sync::Mutex<Option<SumState>>>;

pub struct SumTracker {
    store: Arc<dyn StatisticsStore>,
    cursors: Mutex<HashMap<StatisticId, Cursor>>,
}

/// Ascending by timestamp, first occurrence of a repeated timestamp wins.
fn ordered_quantities(readings: &[Reading]) -> Vec<(OffsetDateTime, f64)> {
    let mut batch: Vec<(OffsetDateTime, f64)> = readings.iter().map(|r| (r.ts, r.quantity)).collect();
    batch.sort_by_key(|(ts, _)| *ts);
    batch.dedup_by_key(|(ts, _)| *ts);
    batch
}

fn accumulate(batch: &[(OffsetDateTime, f64)], base: f64) -> Vec<StatisticPoint> {
    let mut sum = base;
    batch
        .iter()
        .map(|(start, state)| {
            sum += state;
            StatisticPoint {
                start: *start,
                state: *state,
                sum,
            }
        })
        .collect()
}

impl SumTracker {
    pub fn new(store: Arc<dyn StatisticsStore>) -> Self {
        Self {
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn cursor(&self, statistic_id: &StatisticId) -> Cursor {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        cursors.entry(statistic_id.clone()).or_default().clone()
    }

    /// Accumulate `readings` onto the series of `metadata` and write the points.
    ///
    /// All calls for one statistic id are serialized.
    pub async fn apply(
        &self,
        metadata: &StatisticMetadata,
        readings: &[Reading],
        mode: SumMode,
    ) -> Result<TrackOutcome, StoreError> {
        let id = &metadata.statistic_id;
        let cursor = self.cursor(id);
        let mut last = cursor.lock().await;

        let batch = ordered_quantities(readings);
        let duplicates = readings.len() - batch.len();

        let (fresh, base, discarded) = match mode {
            SumMode::Incremental => {
                if last.is_none() {
                    *last = self.store.get_last(id).await?;
                }
                let state = *last;
                let fresh: Vec<_> = match state {
                    Some(s) => batch.into_iter().filter(|(ts, _)| *ts > s.last_start).collect(),
                    None => batch,
                };
                let discarded = readings.len() - fresh.len();
                (fresh, state.map(|s| s.last_sum).unwrap_or(0.0), discarded)
            }
            SumMode::FullRefresh => {
                let (Some((first, _)), Some((newest, _))) = (batch.first().copied(), batch.last().copied()) else {
                    return Ok(TrackOutcome {
                        discarded: duplicates,
                        ..TrackOutcome::default()
                    });
                };

                if let Some(stored) = self.store.get_last(id).await? {
                    if stored.last_start > newest {
                        tracing::warn!(
                            statistic_id = %id,
                            stored_last = %stored.last_start,
                            replay_newest = %newest,
                            "full refresh ends before stored series, not replaying"
                        );
                        metrics::counter!("sum_replay_rejected_total").increment(1);
                        *last = Some(stored);
                        return Ok(TrackOutcome {
                            rejected: true,
                            final_sum: Some(stored.last_sum),
                            discarded: readings.len(),
                            ..TrackOutcome::default()
                        });
                    }
                }

                // Stored hours the replay lacks are carried over with their
                // stored state, so every point in the range is re-summed.
                let stored = self
                    .store
                    .get_points(id, first, newest + time::Duration::HOUR)
                    .await?;
                let replayed: HashSet<OffsetDateTime> = batch.iter().map(|(ts, _)| *ts).collect();
                let kept: Vec<(OffsetDateTime, f64)> = stored
                    .iter()
                    .filter(|p| !replayed.contains(&p.start))
                    .map(|p| (p.start, p.state))
                    .collect();
                if !kept.is_empty() {
                    tracing::debug!(statistic_id = %id, kept = kept.len(), "replay keeps stored hours it did not deliver");
                }

                let mut merged = batch;
                merged.extend(kept);
                merged.sort_by_key(|(ts, _)| *ts);

                let base = self.store.get_last_before(id, first).await?;
                (merged, base.map(|s| s.last_sum).unwrap_or(0.0), duplicates)
            }
        };

        if fresh.is_empty() {
            return Ok(TrackOutcome {
                written: 0,
                discarded,
                final_sum: last.map(|s| s.last_sum),
                rejected: false,
            });
        }

        let points = accumulate(&fresh, base);
        if let Err(e) = self.store.write_points(metadata, &points).await {
            *last = None;
            return Err(e);
        }

        let tail = points[points.len() - 1];
        *last = Some(SumState {
            last_start: tail.start,
            last_sum: tail.sum,
        });

        tracing::debug!(
            statistic_id = %id,
            written = points.len(),
            discarded,
            final_sum = tail.sum,
            "statistics appended"
        );

        Ok(TrackOutcome {
            written: points.len(),
            discarded,
            final_sum: Some(tail.sum),
            rejected: false,
        })
    }
}
