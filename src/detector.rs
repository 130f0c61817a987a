use crate::baseline::{compute_from_records, series, BASELINE_WINDOW_DAYS};
use crate::config::Thresholds;
use crate::errors::AppResult;
use crate::models::{
    AlertCandidate, AlertKey, AlertType, Baseline, Comparison, DateRange, Granularity, MetricName, MetricRecord,
    SegmentFilter, Severity,
};
use crate::store::MetricStore;
use chrono::{Duration, NaiveDate};
use std::collections::HashSet;

/// Everything the rules look at for one funnel and evaluation date.
#[derive(Debug, Clone)]
pub struct FunnelSnapshot {
    pub funnel_id: String,
    pub as_of: NaiveDate,
    pub steps: Vec<StepSnapshot>,
    pub starts: Baseline,
    pub conversion: Baseline,
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub step_number: u32,
    pub drop_off: Baseline,
    /// Daily drop-off rates before `as_of`, oldest first, missing days skipped.
    pub drop_off_history: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleVerdict {
    Fired(AlertCandidate),
    Clear,
    /// The rule could not be evaluated (no data, short history, zero baseline).
    Suppressed(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub key: AlertKey,
    pub verdict: RuleVerdict,
}

impl FunnelSnapshot {
    /// `records` must be daily rollup buckets for this funnel covering at
    /// least the baseline window before `as_of`.
    pub fn from_records(
        funnel_id: &str,
        as_of: NaiveDate,
        records: &[MetricRecord],
        thresholds: &Thresholds,
    ) -> Self {
        let min_samples = thresholds.baseline_min_samples;
        let mut step_numbers: Vec<u32> = records.iter().map(|record| record.step_number).collect();
        step_numbers.sort_unstable();
        step_numbers.dedup();

        let history_start = as_of - Duration::days(i64::from(thresholds.step_anomaly_window_days.max(1)));
        let steps = step_numbers
            .into_iter()
            .map(|step_number| {
                let rates = series(records, Some(step_number), MetricName::DropOffRate);
                StepSnapshot {
                    step_number,
                    drop_off: compute_from_records(
                        funnel_id,
                        records,
                        Some(step_number),
                        MetricName::DropOffRate,
                        as_of,
                        min_samples,
                    ),
                    drop_off_history: rates
                        .range(history_start..as_of)
                        .map(|(_, value)| *value)
                        .collect(),
                }
            })
            .collect();

        Self {
            funnel_id: funnel_id.to_string(),
            as_of,
            steps,
            starts: compute_from_records(funnel_id, records, None, MetricName::FunnelStarts, as_of, min_samples),
            conversion: compute_from_records(
                funnel_id,
                records,
                None,
                MetricName::OverallConversion,
                as_of,
                min_samples,
            ),
        }
    }
}

#[derive(Clone)]
pub struct AnomalyDetector {
    store: MetricStore,
    thresholds: Thresholds,
}

impl AnomalyDetector {
    pub fn new(store: MetricStore, thresholds: Thresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn snapshot(&self, funnel_id: &str, as_of: NaiveDate) -> AppResult<FunnelSnapshot> {
        let lookback = i64::from(self.thresholds.step_anomaly_window_days).max(BASELINE_WINDOW_DAYS);
        let range = DateRange::new(as_of - Duration::days(lookback), as_of);
        let records = self
            .store
            .aggregate(funnel_id, range, Granularity::Daily, &SegmentFilter::Rollup)?;
        Ok(FunnelSnapshot::from_records(funnel_id, as_of, &records, &self.thresholds))
    }

    /// Loads the snapshot for `as_of` and runs every rule against it.
    pub fn evaluate(&self, funnel_id: &str, as_of: NaiveDate) -> AppResult<Vec<RuleOutcome>> {
        let snapshot = self.snapshot(funnel_id, as_of)?;
        Ok(evaluate(&snapshot, &self.thresholds))
    }
}

pub fn detect(snapshot: &FunnelSnapshot, thresholds: &Thresholds) -> Vec<AlertCandidate> {
    fired(&evaluate(snapshot, thresholds))
}

/// The candidates of the rules that fired, in outcome order.
pub fn fired(outcomes: &[RuleOutcome]) -> Vec<AlertCandidate> {
    outcomes
        .iter()
        .filter_map(|outcome| match &outcome.verdict {
            RuleVerdict::Fired(candidate) => Some(candidate.clone()),
            RuleVerdict::Clear | RuleVerdict::Suppressed(_) => None,
        })
        .collect()
}

/// Runs every rule against the snapshot. Deterministic: outcomes are sorted
/// by key and depend only on the snapshot and thresholds.
pub fn evaluate(snapshot: &FunnelSnapshot, thresholds: &Thresholds) -> Vec<RuleOutcome> {
    let mut outcomes = Vec::new();

    outcomes.push(RuleOutcome {
        key: AlertKey {
            step_number: None,
            alert_type: AlertType::Conversion,
        },
        verdict: conversion_rule(&snapshot.conversion, thresholds),
    });
    outcomes.push(RuleOutcome {
        key: AlertKey {
            step_number: None,
            alert_type: AlertType::Volume,
        },
        verdict: volume_rule(&snapshot.starts, thresholds),
    });

    for step in &snapshot.steps {
        outcomes.push(RuleOutcome {
            key: AlertKey {
                step_number: Some(step.step_number),
                alert_type: AlertType::DropOff,
            },
            verdict: drop_off_rule(step, thresholds),
        });
        outcomes.push(RuleOutcome {
            key: AlertKey {
                step_number: Some(step.step_number),
                alert_type: AlertType::StepAnomaly,
            },
            verdict: step_anomaly_rule(step, thresholds),
        });
    }

    compound_step_anomalies(&mut outcomes);
    outcomes.sort_by_key(|outcome| outcome.key);
    outcomes
}

/// A step anomaly on a step whose drop-off rule also fired is raised to warning.
fn compound_step_anomalies(outcomes: &mut [RuleOutcome]) {
    let drop_off_steps: HashSet<u32> = outcomes
        .iter()
        .filter(|outcome| outcome.key.alert_type == AlertType::DropOff)
        .filter(|outcome| matches!(outcome.verdict, RuleVerdict::Fired(_)))
        .filter_map(|outcome| outcome.key.step_number)
        .collect();

    for outcome in outcomes.iter_mut() {
        if let RuleVerdict::Fired(AlertCandidate::StepAnomaly {
            step_number, severity, ..
        }) = &mut outcome.verdict
        {
            if drop_off_steps.contains(&*step_number) && *severity < Severity::Warning {
                *severity = Severity::Warning;
            }
        }
    }
}

/// (current - baseline) / baseline; undefined for a missing or zero baseline.
pub fn relative_change(current: f64, baseline: Option<f64>) -> Option<f64> {
    let baseline = baseline?;
    if baseline == 0.0 || !baseline.is_finite() || !current.is_finite() {
        return None;
    }
    Some((current - baseline) / baseline)
}

fn comparison_for(baseline: &Baseline, thresholds: &Thresholds) -> Result<Comparison, &'static str> {
    let Some(current) = baseline.current_value else {
        return Err("no data for evaluated day");
    };
    if baseline.sample_count < thresholds.baseline_min_samples {
        return Err("insufficient baseline data");
    }
    let comparison = Comparison {
        current,
        previous_day: baseline.previous_value,
        seven_day_average: baseline.seven_day_average,
        change_vs_previous: relative_change(current, baseline.previous_value),
        change_vs_average: relative_change(current, baseline.seven_day_average),
    };
    if comparison.change_vs_previous.is_none() && comparison.change_vs_average.is_none() {
        return Err("baseline is zero or missing");
    }
    Ok(comparison)
}

fn drop_off_rule(step: &StepSnapshot, thresholds: &Thresholds) -> RuleVerdict {
    let comparison = match comparison_for(&step.drop_off, thresholds) {
        Ok(comparison) => comparison,
        Err(reason) => return RuleVerdict::Suppressed(reason),
    };

    let vs_previous = comparison
        .change_vs_previous
        .is_some_and(|change| change > thresholds.drop_off_vs_previous);
    let vs_average = comparison
        .change_vs_average
        .is_some_and(|change| change > thresholds.drop_off_vs_average);
    if !vs_previous && !vs_average {
        return RuleVerdict::Clear;
    }

    let severity = if comparison.current > thresholds.drop_off_critical_rate {
        Severity::Critical
    } else if comparison.current > thresholds.drop_off_warning_rate {
        Severity::Warning
    } else {
        Severity::Info
    };

    RuleVerdict::Fired(AlertCandidate::DropOff {
        step_number: step.step_number,
        severity,
        comparison,
    })
}

fn conversion_rule(baseline: &Baseline, thresholds: &Thresholds) -> RuleVerdict {
    let comparison = match comparison_for(baseline, thresholds) {
        Ok(comparison) => comparison,
        Err(reason) => return RuleVerdict::Suppressed(reason),
    };

    // Each satisfied condition grades on its own; the highest grade wins.
    let grade = |change: f64| {
        if change < -thresholds.conversion_critical_drop {
            Severity::Critical
        } else {
            Severity::Warning
        }
    };
    let severity = [
        comparison
            .change_vs_previous
            .filter(|change| *change < -thresholds.conversion_vs_previous)
            .map(grade),
        comparison
            .change_vs_average
            .filter(|change| *change < -thresholds.conversion_vs_average)
            .map(grade),
    ]
    .into_iter()
    .flatten()
    .max();

    match severity {
        Some(severity) => RuleVerdict::Fired(AlertCandidate::Conversion { severity, comparison }),
        None => RuleVerdict::Clear,
    }
}

fn volume_rule(baseline: &Baseline, thresholds: &Thresholds) -> RuleVerdict {
    let comparison = match comparison_for(baseline, thresholds) {
        Ok(comparison) => comparison,
        Err(reason) => return RuleVerdict::Suppressed(reason),
    };

    let vs_previous = comparison
        .change_vs_previous
        .is_some_and(|change| change < -thresholds.volume_vs_previous);
    let vs_average = comparison
        .change_vs_average
        .is_some_and(|change| change < -thresholds.volume_vs_average);
    if !vs_previous && !vs_average {
        return RuleVerdict::Clear;
    }

    RuleVerdict::Fired(AlertCandidate::Volume {
        severity: Severity::Warning,
        comparison,
    })
}

fn step_anomaly_rule(step: &StepSnapshot, thresholds: &Thresholds) -> RuleVerdict {
    let Some(current) = step.drop_off.current_value else {
        return RuleVerdict::Suppressed("no data for evaluated day");
    };
    let history = &step.drop_off_history;
    if history.len() < thresholds.step_anomaly_min_samples.max(2) {
        return RuleVerdict::Suppressed("not enough history for a distribution");
    }

    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let variance = history.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (history.len() - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return RuleVerdict::Suppressed("flat history");
    }

    let deviation_sigma = (current - mean).abs() / std_dev;
    if deviation_sigma <= thresholds.step_anomaly_sigma {
        return RuleVerdict::Clear;
    }

    RuleVerdict::Fired(AlertCandidate::StepAnomaly {
        step_number: step.step_number,
        severity: Severity::Info,
        current_value: current,
        mean,
        std_dev,
        deviation_sigma,
    })
}
