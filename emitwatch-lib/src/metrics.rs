//! Rolling per-category emit counts for charting.
//!
//! The series holds a constant number of buckets, oldest first. It is seeded
//! once from stored history ([`MetricsSeries::backfill`]) and afterwards
//! advanced by one bucket per flush ([`MetricsSeries::ingest`]).

use crate::models::{BatchSummary, CategoryCounts, EventRecord};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// One bucket of the series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    /// Bucket timestamp in epoch milliseconds.
    pub ts_ms: i64,
    pub counts: CategoryCounts,
}

impl From<&BatchSummary> for SeriesPoint {
    fn from(summary: &BatchSummary) -> Self {
        Self {
            ts_ms: summary.ts_ms,
            counts: summary.counts,
        }
    }
}

/// Fixed-length rolling window of bucketed category counts.
#[derive(Debug, Clone)]
pub struct MetricsSeries {
    max_points: usize,
    bucket_ms: i64,
    points: VecDeque<SeriesPoint>,
}

impl MetricsSeries {
    /// Series of `max_points` empty buckets ending one bucket before `now_ms`.
    ///
    /// A `max_points` of zero is raised to one and a zero bucket width to one
    /// millisecond.
    pub fn new(max_points: usize, bucket_ms: u64, now_ms: i64) -> Self {
        let max_points = max_points.max(1);
        let bucket_ms = i64::try_from(bucket_ms).unwrap_or(i64::MAX).max(1);
        let points = (0..max_points)
            .map(|idx| SeriesPoint {
                ts_ms: now_ms.saturating_sub(offset(max_points.saturating_sub(idx), bucket_ms)),
                counts: CategoryCounts::default(),
            })
            .collect();
        Self {
            max_points,
            bucket_ms,
            points,
        }
    }

    /// Number of buckets, constant for the lifetime of the series.
    pub const fn len(&self) -> usize {
        self.max_points
    }

    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Rebuild the series from history.
    ///
    /// Records older than `max_points` bucket widths before `now_ms` are
    /// ignored. The result is `max_points` contiguous buckets whose last one
    /// contains `now_ms`; buckets with no records are zero. Calling this twice
    /// with the same inputs yields the same series.
    pub fn backfill<'a>(&mut self, records: impl IntoIterator<Item = &'a EventRecord>, now_ms: i64) {
        let min_ts = now_ms.saturating_sub(offset(self.max_points, self.bucket_ms));
        let mut buckets: HashMap<i64, CategoryCounts> = HashMap::new();

        for record in records {
            if record.ts_ms < min_ts {
                continue;
            }
            let Some(ref kind) = record.kind else {
                continue;
            };
            buckets
                .entry(self.bucket_key(record.ts_ms))
                .or_default()
                .record(kind);
        }

        let last = self.max_points.saturating_sub(1);
        self.points = (0..self.max_points)
            .map(|idx| {
                let ts_ms = now_ms.saturating_sub(offset(last.saturating_sub(idx), self.bucket_ms));
                SeriesPoint {
                    ts_ms,
                    counts: buckets
                        .get(&self.bucket_key(ts_ms))
                        .copied()
                        .unwrap_or_default(),
                }
            })
            .collect();
    }

    /// Append one sample as the newest bucket, dropping the oldest.
    pub fn ingest(&mut self, sample: SeriesPoint) {
        if self.points.len() >= self.max_points {
            self.points.pop_front();
        }
        self.points.push_back(sample);
    }

    /// Copy of the current buckets, oldest first.
    pub fn points(&self) -> Vec<SeriesPoint> {
        self.points.iter().copied().collect()
    }

    fn bucket_key(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.bucket_ms).saturating_mul(self.bucket_ms)
    }
}

/// `steps` bucket widths in milliseconds.
fn offset(steps: usize, bucket_ms: i64) -> i64 {
    i64::try_from(steps).unwrap_or(i64::MAX).saturating_mul(bucket_ms)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::indexing_slicing, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use crate::models::EmitKind;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_new_series_is_contiguous_and_empty() {
        let series = MetricsSeries::new(24, 3_000, NOW);
        let points = series.points();

        assert_eq!(points.len(), 24);
        assert_eq!(points[0].ts_ms, NOW - 24 * 3_000);
        assert_eq!(points[23].ts_ms, NOW - 3_000);
        assert!(points.windows(2).all(|w| w[1].ts_ms - w[0].ts_ms == 3_000));
        assert!(points.iter().all(|p| p.counts.total() == 0));
    }

    #[test]
    fn test_backfill_buckets_history() {
        let mut series = MetricsSeries::new(4, 1_000, NOW);
        let records = vec![
            EventRecord::new(EmitKind::OcrRaw, NOW),
            EventRecord::new(EmitKind::OcrRaw, NOW - 10),
            EventRecord::new(EmitKind::Speeding, NOW - 2_500),
            // Outside the window
            EventRecord::new(EmitKind::Speeding, NOW - 60_000),
            EventRecord::new(EmitKind::Other("NOISE".to_owned()), NOW),
        ];

        series.backfill(&records, NOW);
        let points = series.points();

        assert_eq!(points.len(), 4);
        assert_eq!(points[3].ts_ms, NOW);
        let total: u32 = points.iter().map(|p| p.counts.total()).sum();
        assert_eq!(total, 3);
        assert_eq!(points[0].counts.speeding + points[1].counts.speeding, 1);
        assert_eq!(
            points[2].counts.ocr_raw + points[3].counts.ocr_raw,
            2
        );
    }

    #[test]
    fn test_backfill_empty_history_is_all_zero() {
        let mut series = MetricsSeries::new(26, 3_000, NOW);
        series.backfill(std::iter::empty(), NOW);
        let points = series.points();
        assert_eq!(points.len(), 26);
        assert!(points.iter().all(|p| p.counts == CategoryCounts::default()));
    }

    #[test]
    fn test_backfill_is_idempotent() {
        let records: Vec<EventRecord> = (0..50)
            .map(|i| EventRecord::new(EmitKind::PlateFinal, NOW - i * 700))
            .collect();
        let mut series = MetricsSeries::new(10, 2_000, NOW);

        series.backfill(&records, NOW);
        let first = series.points();
        series.backfill(&records, NOW);
        assert_eq!(first, series.points());
    }

    #[test]
    fn test_ingest_drops_oldest() {
        let mut series = MetricsSeries::new(3, 1_000, NOW);
        let before = series.points();

        let sample = SeriesPoint {
            ts_ms: NOW,
            counts: CategoryCounts {
                wrong_direction: 1,
                ..CategoryCounts::default()
            },
        };
        series.ingest(sample);

        let points = series.points();
        assert_eq!(points.len(), 3);
        assert_eq!(points[..2], before[1..]);
        assert_eq!(points[2], sample);
    }

    #[test]
    fn test_points_is_a_copy() {
        let series = MetricsSeries::new(2, 1_000, NOW);
        let mut copy = series.points();
        copy[0].counts.ocr_raw = 99;
        assert_eq!(series.points()[0].counts.ocr_raw, 0);
    }
}
