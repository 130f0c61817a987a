use crate::adapters::MetricsProvider;
use crate::config::Settings;
use crate::errors::AppError;
use crate::models::{BucketKey, DateRange, Granularity, MetricRecord, RawMetricEvent};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.fetch_max_retries.saturating_add(1),
            base_backoff: Duration::from_millis(settings.fetch_backoff_ms),
        }
    }

    /// `base * 2^(attempt - 1)` plus up to half of that again as jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let multiplier: u32 = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_backoff.saturating_mul(multiplier);
        let jitter_cap = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=jitter_cap);
        delay.saturating_add(Duration::from_millis(jitter))
    }
}

#[derive(Debug)]
pub struct FetchFailure {
    pub error: AppError,
    pub attempts: u32,
}

/// Calls the provider, retrying retryable errors with exponential backoff.
/// Returns the events and the number of attempts it took.
pub async fn fetch_with_retry(
    provider: &dyn MetricsProvider,
    funnel_id: &str,
    range: DateRange,
    granularity: Granularity,
    policy: &RetryPolicy,
) -> Result<(Vec<RawMetricEvent>, u32), FetchFailure> {
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        match provider.fetch(funnel_id, range.start, range.end, granularity).await {
            Ok(events) => return Ok((events, attempt)),
            Err(error) => {
                if !error.is_retryable() || attempt >= policy.max_attempts.max(1) {
                    tracing::warn!(
                        funnel_id = %funnel_id,
                        attempt,
                        error = %error,
                        "metrics fetch failed"
                    );
                    return Err(FetchFailure {
                        error,
                        attempts: attempt,
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::info!(
                    funnel_id = %funnel_id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "metrics fetch retry scheduled"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<MetricRecord>,
    pub rejected: usize,
    pub duplicates: usize,
}

/// Turns untrusted provider rows into store records for one funnel. Rows for
/// other funnels, outside `range`, with negative counters or an impossible
/// hour are dropped. When one bucket appears more than once the row with the
/// latest `observed_at` wins, and among equals the later row.
pub fn normalize_events(funnel_id: &str, events: Vec<RawMetricEvent>, range: DateRange) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut buckets: BTreeMap<BucketKey, (Option<DateTime<Utc>>, MetricRecord)> = BTreeMap::new();

    for event in events {
        if event.funnel_id != funnel_id || !range.contains(event.date) {
            batch.rejected += 1;
            continue;
        }
        let Some(record) = to_record(&event) else {
            tracing::warn!(
                funnel_id = %funnel_id,
                step = event.step_number,
                date = %event.date,
                hour = ?event.hour,
                entries = event.entries,
                exits = event.exits,
                conversions = event.conversions,
                "rejected malformed metric event"
            );
            batch.rejected += 1;
            continue;
        };

        let key = record.key();
        match buckets.get(&key) {
            Some((seen_at, _)) => {
                batch.duplicates += 1;
                if event.observed_at >= *seen_at {
                    buckets.insert(key, (event.observed_at, record));
                }
            }
            None => {
                buckets.insert(key, (event.observed_at, record));
            }
        }
    }

    batch.records = buckets.into_values().map(|(_, record)| record).collect();
    batch
}

fn to_record(event: &RawMetricEvent) -> Option<MetricRecord> {
    if event.hour.is_some_and(|hour| hour > 23) {
        return None;
    }
    let entries = u64::try_from(event.entries).ok()?;
    let exits = u64::try_from(event.exits).ok()?;
    let conversions = u64::try_from(event.conversions).ok()?;
    let segment_key = event
        .segment_key
        .as_ref()
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty());

    Some(MetricRecord {
        funnel_id: event.funnel_id.clone(),
        step_number: event.step_number,
        date: event.date,
        hour: event.hour,
        segment_key,
        entries,
        exits,
        conversions,
        avg_time_on_step: event
            .avg_time_on_step
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0),
    })
}
