use super::{parse_date, Database};
use crate::errors::AppResult;
use crate::models::{DateRange, MetricRecord, SegmentFilter, UpsertSummary};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

const DAILY_HOUR: i64 = -1;
const ROLLUP_SEGMENT: &str = "";

impl Database {
    /// Writes each bucket, skipping rows whose stored values already match.
    /// Differing values replace the stored row and count as corrections.
    pub fn upsert_metric_records(&self, records: &[MetricRecord]) -> AppResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for record in records {
            let hour = encode_hour(record.hour);
            let segment = record.segment_key.as_deref().unwrap_or(ROLLUP_SEGMENT);
            let date = record.date.to_string();

            let existing = tx
                .query_row(
                    "SELECT funnel_id, step_number, date, hour, segment_key, entries, exits, conversions, avg_time_on_step
                     FROM metric_records
                     WHERE funnel_id = ?1 AND step_number = ?2 AND date = ?3 AND hour = ?4 AND segment_key = ?5",
                    params![record.funnel_id, record.step_number, date, hour, segment],
                    parse_metric_row,
                )
                .optional()?;

            match existing {
                Some(stored) if stored.same_values(record) => {
                    summary.unchanged += 1;
                    continue;
                }
                Some(stored) => {
                    tracing::info!(
                        funnel_id = %record.funnel_id,
                        step = record.step_number,
                        date = %record.date,
                        previous_entries = stored.entries,
                        entries = record.entries,
                        "metric bucket corrected"
                    );
                    summary.corrected += 1;
                }
                None => summary.inserted += 1,
            }

            tx.execute(
                "INSERT INTO metric_records (
                   funnel_id, step_number, date, hour, segment_key, entries, exits, conversions, avg_time_on_step, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (funnel_id, step_number, date, hour, segment_key) DO UPDATE SET
                   entries = excluded.entries,
                   exits = excluded.exits,
                   conversions = excluded.conversions,
                   avg_time_on_step = excluded.avg_time_on_step,
                   updated_at = excluded.updated_at",
                params![
                    record.funnel_id,
                    record.step_number,
                    date,
                    hour,
                    segment,
                    record.entries,
                    record.exits,
                    record.conversions,
                    record.avg_time_on_step,
                    now
                ],
            )?;
        }
        tx.commit()?;

        Ok(summary)
    }

    pub fn query_metric_records(
        &self,
        funnel_id: &str,
        step_number: Option<u32>,
        range: DateRange,
        segment: &SegmentFilter,
    ) -> AppResult<Vec<MetricRecord>> {
        let mut query = String::from(
            "SELECT funnel_id, step_number, date, hour, segment_key, entries, exits, conversions, avg_time_on_step
             FROM metric_records WHERE funnel_id = ? AND date >= ? AND date <= ?",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(funnel_id.to_string()),
            Box::new(range.start.to_string()),
            Box::new(range.end.to_string()),
        ];

        if let Some(step_number) = step_number {
            query.push_str(" AND step_number = ?");
            params_vec.push(Box::new(step_number));
        }
        match segment {
            SegmentFilter::Rollup => {
                query.push_str(" AND segment_key = ?");
                params_vec.push(Box::new(ROLLUP_SEGMENT.to_string()));
            }
            SegmentFilter::Segment(key) => {
                query.push_str(" AND segment_key = ?");
                params_vec.push(Box::new(key.clone()));
            }
            SegmentFilter::AllSegments => {
                query.push_str(" AND segment_key <> ?");
                params_vec.push(Box::new(ROLLUP_SEGMENT.to_string()));
            }
        }
        query.push_str(" ORDER BY date ASC, step_number ASC, hour ASC, segment_key ASC");

        let conn = self.connection()?;
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|param| param.as_ref())),
            parse_metric_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn encode_hour(hour: Option<u8>) -> i64 {
    hour.map(i64::from).unwrap_or(DAILY_HOUR)
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRecord> {
    let hour: i64 = row.get(3)?;
    let segment_key: String = row.get(4)?;
    Ok(MetricRecord {
        funnel_id: row.get(0)?,
        step_number: row.get(1)?,
        date: parse_date(&row.get::<_, String>(2)?)?,
        hour: u8::try_from(hour).ok(),
        segment_key: if segment_key.is_empty() { None } else { Some(segment_key) },
        entries: row.get(5)?,
        exits: row.get(6)?,
        conversions: row.get(7)?,
        avg_time_on_step: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::models::{DateRange, MetricRecord, SegmentFilter};
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).expect("date")
    }

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn repeated_upsert_is_a_no_op() {
        let (_dir, db) = open();
        let record = MetricRecord::daily("quiz", 1, day(10), 100, 20, 5);

        let first = db.upsert_metric_records(&[record.clone()]).expect("first upsert");
        assert_eq!(first.inserted, 1);
        let second = db.upsert_metric_records(&[record]).expect("second upsert");
        assert_eq!(second.written(), 0);
        assert_eq!(second.unchanged, 1);

        let rows = db
            .query_metric_records("quiz", None, DateRange::single(day(10)), &SegmentFilter::Rollup)
            .expect("query");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn correction_replaces_instead_of_adding() {
        let (_dir, db) = open();
        db.upsert_metric_records(&[MetricRecord::daily("quiz", 1, day(10), 100, 20, 5)])
            .expect("first upsert");
        let summary = db
            .upsert_metric_records(&[MetricRecord::daily("quiz", 1, day(10), 120, 20, 5)])
            .expect("correction");
        assert_eq!(summary.corrected, 1);

        let rows = db
            .query_metric_records("quiz", Some(1), DateRange::single(day(10)), &SegmentFilter::Rollup)
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entries, 120);
    }

    #[test]
    fn rollup_and_segments_are_kept_apart() {
        let (_dir, db) = open();
        let rollup = MetricRecord::daily("quiz", 1, day(10), 100, 20, 5);
        let mut mobile = MetricRecord::daily("quiz", 1, day(10), 60, 10, 3);
        mobile.segment_key = Some("mobile".to_string());
        let mut desktop = MetricRecord::daily("quiz", 1, day(10), 40, 10, 2);
        desktop.segment_key = Some("desktop".to_string());
        db.upsert_metric_records(&[rollup, mobile, desktop]).expect("upsert");

        let range = DateRange::single(day(10));
        let rollup_rows = db
            .query_metric_records("quiz", None, range, &SegmentFilter::Rollup)
            .expect("rollup");
        assert_eq!(rollup_rows.len(), 1);
        assert!(rollup_rows[0].segment_key.is_none());

        let mobile_rows = db
            .query_metric_records("quiz", None, range, &SegmentFilter::Segment("mobile".to_string()))
            .expect("mobile");
        assert_eq!(mobile_rows.len(), 1);
        assert_eq!(mobile_rows[0].entries, 60);

        let segmented = db
            .query_metric_records("quiz", None, range, &SegmentFilter::AllSegments)
            .expect("segmented");
        assert_eq!(segmented.len(), 2);
    }

    #[test]
    fn hourly_buckets_keep_their_hour() {
        let (_dir, db) = open();
        let mut hourly = MetricRecord::daily("quiz", 2, day(11), 7, 1, 0);
        hourly.hour = Some(0);
        db.upsert_metric_records(&[hourly]).expect("upsert");

        let rows = db
            .query_metric_records("quiz", Some(2), DateRange::single(day(11)), &SegmentFilter::Rollup)
            .expect("query");
        assert_eq!(rows[0].hour, Some(0));
    }
}
