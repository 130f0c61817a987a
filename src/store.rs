use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{BucketKey, DateRange, Granularity, MetricRecord, SegmentFilter, UpsertSummary};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricStore {
    db: Arc<Database>,
}

impl MetricStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Integrity violations (exits + conversions > entries) are logged and
    /// the record is stored as delivered.
    pub fn upsert(&self, records: &[MetricRecord]) -> AppResult<UpsertSummary> {
        let mut warnings = 0usize;
        for record in records.iter().filter(|record| record.violates_integrity()) {
            warnings += 1;
            tracing::warn!(
                funnel_id = %record.funnel_id,
                step = record.step_number,
                date = %record.date,
                hour = ?record.hour,
                segment = ?record.segment_key,
                entries = record.entries,
                exits = record.exits,
                conversions = record.conversions,
                "data integrity warning: exits + conversions exceed entries"
            );
        }

        let mut summary = self.db.upsert_metric_records(records)?;
        summary.integrity_warnings = warnings;
        Ok(summary)
    }

    pub fn query(
        &self,
        funnel_id: &str,
        step_number: Option<u32>,
        range: DateRange,
        segment: &SegmentFilter,
    ) -> AppResult<Vec<MetricRecord>> {
        self.db.query_metric_records(funnel_id, step_number, range, segment)
    }

    pub fn aggregate(
        &self,
        funnel_id: &str,
        range: DateRange,
        granularity: Granularity,
        segment: &SegmentFilter,
    ) -> AppResult<Vec<MetricRecord>> {
        let records = self.query(funnel_id, None, range, segment)?;
        Ok(rollup(&records, granularity))
    }
}

#[derive(Default)]
struct Accumulator {
    entries: u64,
    exits: u64,
    conversions: u64,
    weighted_time: f64,
    timed_entries: u64,
}

impl Accumulator {
    fn add(&mut self, record: &MetricRecord) {
        self.entries = self.entries.saturating_add(record.entries);
        self.exits = self.exits.saturating_add(record.exits);
        self.conversions = self.conversions.saturating_add(record.conversions);
        if let Some(seconds) = record.avg_time_on_step {
            self.weighted_time += seconds * record.entries as f64;
            self.timed_entries = self.timed_entries.saturating_add(record.entries);
        }
    }

    fn avg_time_on_step(&self) -> Option<f64> {
        if self.timed_entries == 0 {
            None
        } else {
            Some(self.weighted_time / self.timed_entries as f64)
        }
    }
}

/// Sums sub-buckets up to `granularity`, per segment. For a daily rollup a
/// stored daily bucket wins over that day's hourly buckets so the same
/// traffic is never counted twice; hourly rows are only summed for days
/// without a daily row. Average time on step is entries-weighted.
pub fn rollup(records: &[MetricRecord], granularity: Granularity) -> Vec<MetricRecord> {
    let mut daily_present: std::collections::HashSet<BucketKey> = std::collections::HashSet::new();
    if granularity == Granularity::Daily {
        for record in records.iter().filter(|record| record.hour.is_none()) {
            daily_present.insert(record.key());
        }
    }

    let mut buckets: BTreeMap<BucketKey, Accumulator> = BTreeMap::new();
    for record in records {
        let mut key = record.key();
        match granularity {
            Granularity::Hourly => {
                if record.hour.is_none() {
                    continue;
                }
            }
            Granularity::Daily => {
                key.hour = None;
                if record.hour.is_some() && daily_present.contains(&key) {
                    continue;
                }
            }
        }
        buckets.entry(key).or_default().add(record);
    }

    buckets
        .into_iter()
        .map(|(key, acc)| MetricRecord {
            avg_time_on_step: acc.avg_time_on_step(),
            funnel_id: key.funnel_id,
            step_number: key.step_number,
            date: key.date,
            hour: key.hour,
            segment_key: key.segment_key,
            entries: acc.entries,
            exits: acc.exits,
            conversions: acc.conversions,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{rollup, MetricStore};
    use crate::db::Database;
    use crate::models::{DateRange, Granularity, MetricRecord, SegmentFilter};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).expect("date")
    }

    fn hourly(step: u32, date: NaiveDate, hour: u8, entries: u64, exits: u64) -> MetricRecord {
        let mut record = MetricRecord::daily("quiz", step, date, entries, exits, 0);
        record.hour = Some(hour);
        record
    }

    #[test]
    fn hourly_buckets_sum_into_a_day() {
        let records = vec![hourly(1, day(10), 0, 10, 2), hourly(1, day(10), 1, 30, 4)];
        let daily = rollup(&records, Granularity::Daily);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].entries, 40);
        assert_eq!(daily[0].exits, 6);
        assert!(daily[0].hour.is_none());
    }

    #[test]
    fn stored_daily_bucket_is_not_double_counted() {
        let records = vec![
            MetricRecord::daily("quiz", 1, day(10), 40, 6, 0),
            hourly(1, day(10), 0, 10, 2),
            hourly(1, day(10), 1, 30, 4),
        ];
        let daily = rollup(&records, Granularity::Daily);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].entries, 40);
    }

    #[test]
    fn hourly_granularity_drops_daily_rows() {
        let records = vec![MetricRecord::daily("quiz", 1, day(10), 40, 6, 0), hourly(1, day(10), 3, 10, 2)];
        let hourly_rows = rollup(&records, Granularity::Hourly);
        assert_eq!(hourly_rows.len(), 1);
        assert_eq!(hourly_rows[0].hour, Some(3));
    }

    #[test]
    fn avg_time_is_weighted_by_entries() {
        let mut first = hourly(1, day(10), 0, 10, 0);
        first.avg_time_on_step = Some(10.0);
        let mut second = hourly(1, day(10), 1, 30, 0);
        second.avg_time_on_step = Some(20.0);
        let daily = rollup(&[first, second], Granularity::Daily);
        let avg = daily[0].avg_time_on_step.expect("avg");
        assert!((avg - 17.5).abs() < 1e-9);
    }

    #[test]
    fn store_counts_integrity_warnings_but_keeps_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let store = MetricStore::new(db);

        let summary = store
            .upsert(&[MetricRecord::daily("quiz", 1, day(10), 10, 8, 8)])
            .expect("upsert");
        assert_eq!(summary.integrity_warnings, 1);
        assert_eq!(summary.inserted, 1);

        let aggregated = store
            .aggregate("quiz", DateRange::single(day(10)), Granularity::Daily, &SegmentFilter::Rollup)
            .expect("aggregate");
        assert_eq!(aggregated[0].exits, 8);
    }
}
