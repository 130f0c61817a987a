use crate::errors::AppResult;
use crate::models::{Baseline, DateRange, Granularity, MetricName, MetricRecord, SegmentFilter};
use crate::store::MetricStore;
use chrono::{Duration, NaiveDate, Utc};
use std::collections::BTreeMap;

pub const BASELINE_WINDOW_DAYS: i64 = 7;

pub type DailySeries = BTreeMap<NaiveDate, f64>;

#[derive(Clone)]
pub struct BaselineCalculator {
    store: MetricStore,
    min_samples: usize,
}

impl BaselineCalculator {
    pub fn new(store: MetricStore, min_samples: usize) -> Self {
        Self { store, min_samples }
    }

    /// Recomputes from the store every call; nothing is cached between cycles.
    pub fn compute(
        &self,
        funnel_id: &str,
        step_number: Option<u32>,
        metric: MetricName,
        as_of: NaiveDate,
    ) -> AppResult<Baseline> {
        let range = DateRange::new(as_of - Duration::days(BASELINE_WINDOW_DAYS), as_of);
        let records = self
            .store
            .aggregate(funnel_id, range, Granularity::Daily, &SegmentFilter::Rollup)?;
        Ok(compute_from_records(funnel_id, &records, step_number, metric, as_of, self.min_samples))
    }
}

/// `records` must be daily rollup buckets of one funnel.
pub fn compute_from_records(
    funnel_id: &str,
    records: &[MetricRecord],
    step_number: Option<u32>,
    metric: MetricName,
    as_of: NaiveDate,
    min_samples: usize,
) -> Baseline {
    let values = series(records, step_number, metric);
    baseline_from_series(funnel_id, step_number, metric, &values, as_of, min_samples)
}

pub fn baseline_from_series(
    funnel_id: &str,
    step_number: Option<u32>,
    metric: MetricName,
    values: &DailySeries,
    as_of: NaiveDate,
    min_samples: usize,
) -> Baseline {
    // Missing days mean no sync happened, not zero activity: skip them.
    let window: Vec<f64> = (1..=BASELINE_WINDOW_DAYS)
        .filter_map(|offset| values.get(&(as_of - Duration::days(offset))).copied())
        .collect();
    let sample_count = window.len();
    let seven_day_average = if sample_count >= min_samples.max(1) {
        Some(window.iter().sum::<f64>() / sample_count as f64)
    } else {
        None
    };

    Baseline {
        funnel_id: funnel_id.to_string(),
        step_number,
        metric,
        as_of,
        current_value: values.get(&as_of).copied(),
        previous_value: values.get(&(as_of - Duration::days(1))).copied(),
        seven_day_average,
        sample_count,
        computed_at: Utc::now(),
    }
}

/// Per-day values of `metric`. Ratios are derived here from the stored
/// counters, so a corrected `entries` value flows into every rate.
pub fn series(records: &[MetricRecord], step_number: Option<u32>, metric: MetricName) -> DailySeries {
    if metric.is_funnel_wide() {
        return funnel_series(records, metric);
    }

    records
        .iter()
        .filter(|record| record.hour.is_none() && Some(record.step_number) == step_number)
        .filter_map(|record| step_value(record, metric).map(|value| (record.date, value)))
        .collect()
}

pub fn step_value(record: &MetricRecord, metric: MetricName) -> Option<f64> {
    match metric {
        MetricName::Entries => Some(record.entries as f64),
        MetricName::Exits => Some(record.exits as f64),
        MetricName::Conversions => Some(record.conversions as f64),
        MetricName::DropOffRate => record.drop_off_rate(),
        MetricName::ConversionRate => record.conversion_rate(),
        MetricName::AvgTimeOnStep => record.avg_time_on_step,
        MetricName::FunnelStarts | MetricName::FunnelCompletions | MetricName::OverallConversion => None,
    }
}

/// Funnel starts are entries into the first step, completions are
/// conversions out of the last step.
fn funnel_series(records: &[MetricRecord], metric: MetricName) -> DailySeries {
    let Some((first_step, last_step)) = step_bounds(records) else {
        return DailySeries::new();
    };

    let mut starts: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    let mut completions: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    for record in records.iter().filter(|record| record.hour.is_none()) {
        if record.step_number == first_step {
            starts.insert(record.date, record.entries);
        }
        if record.step_number == last_step {
            completions.insert(record.date, record.conversions);
        }
    }

    match metric {
        MetricName::FunnelStarts => starts.into_iter().map(|(date, value)| (date, value as f64)).collect(),
        MetricName::FunnelCompletions => completions
            .into_iter()
            .map(|(date, value)| (date, value as f64))
            .collect(),
        MetricName::OverallConversion => starts
            .into_iter()
            .filter_map(|(date, started)| {
                let completed = completions.get(&date)?;
                crate::models::ratio(*completed, started).map(|rate| (date, rate))
            })
            .collect(),
        _ => DailySeries::new(),
    }
}

pub fn step_bounds(records: &[MetricRecord]) -> Option<(u32, u32)> {
    let first = records.iter().map(|record| record.step_number).min()?;
    let last = records.iter().map(|record| record.step_number).max()?;
    Some((first, last))
}
