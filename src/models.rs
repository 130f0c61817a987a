use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ─── Metric buckets ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketKey {
    pub funnel_id: String,
    pub step_number: u32,
    pub date: NaiveDate,
    pub hour: Option<u8>,
    pub segment_key: Option<String>,
}

/// Counters for one bucket. A `None` segment is the all-devices rollup and is
/// never summed together with segmented buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub funnel_id: String,
    pub step_number: u32,
    pub date: NaiveDate,
    pub hour: Option<u8>,
    pub segment_key: Option<String>,
    pub entries: u64,
    pub exits: u64,
    pub conversions: u64,
    pub avg_time_on_step: Option<f64>,
}

impl MetricRecord {
    pub fn daily(funnel_id: &str, step_number: u32, date: NaiveDate, entries: u64, exits: u64, conversions: u64) -> Self {
        Self {
            funnel_id: funnel_id.to_string(),
            step_number,
            date,
            hour: None,
            segment_key: None,
            entries,
            exits,
            conversions,
            avg_time_on_step: None,
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            funnel_id: self.funnel_id.clone(),
            step_number: self.step_number,
            date: self.date,
            hour: self.hour,
            segment_key: self.segment_key.clone(),
        }
    }

    pub fn drop_off_rate(&self) -> Option<f64> {
        ratio(self.exits, self.entries)
    }

    pub fn conversion_rate(&self) -> Option<f64> {
        ratio(self.conversions, self.entries)
    }

    pub fn violates_integrity(&self) -> bool {
        self.exits.saturating_add(self.conversions) > self.entries
    }

    pub fn same_values(&self, other: &MetricRecord) -> bool {
        self.entries == other.entries
            && self.exits == other.exits
            && self.conversions == other.conversions
            && self.avg_time_on_step == other.avg_time_on_step
    }
}

pub fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        return None;
    }
    Some(numerator as f64 / denominator as f64)
}

/// Inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    #[cfg(test)]
    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hourly,
    Daily,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SegmentFilter {
    /// Only the all-devices rollup buckets (null segment key).
    #[default]
    Rollup,
    Segment(String),
    /// Every segmented bucket, excluding the rollup.
    AllSegments,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSummary {
    pub inserted: usize,
    pub corrected: usize,
    pub unchanged: usize,
    pub integrity_warnings: usize,
}

impl UpsertSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.corrected
    }
}

/// A row as reported by the upstream provider. Untrusted: counters may be
/// negative, duplicated, or out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetricEvent {
    pub funnel_id: String,
    pub step_number: u32,
    pub date: NaiveDate,
    #[serde(default)]
    pub hour: Option<u8>,
    #[serde(default)]
    pub segment_key: Option<String>,
    pub entries: i64,
    pub exits: i64,
    pub conversions: i64,
    #[serde(default)]
    pub avg_time_on_step: Option<f64>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

// ─── Baselines ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Entries,
    Exits,
    Conversions,
    DropOffRate,
    ConversionRate,
    AvgTimeOnStep,
    FunnelStarts,
    FunnelCompletions,
    OverallConversion,
}

impl MetricName {
    pub fn is_funnel_wide(self) -> bool {
        matches!(self, Self::FunnelStarts | Self::FunnelCompletions | Self::OverallConversion)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub funnel_id: String,
    pub step_number: Option<u32>,
    pub metric: MetricName,
    pub as_of: NaiveDate,
    pub current_value: Option<f64>,
    pub previous_value: Option<f64>,
    /// `None` whenever `sample_count` is below the configured minimum.
    pub seven_day_average: Option<f64>,
    pub sample_count: usize,
    pub computed_at: DateTime<Utc>,
}

// ─── Alerts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DropOff,
    Conversion,
    Volume,
    StepAnomaly,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropOff => "drop_off",
            Self::Conversion => "conversion",
            Self::Volume => "volume",
            Self::StepAnomaly => "step_anomaly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Acknowledged)
    }
}

/// Identity used for deduplication within one funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub step_number: Option<u32>,
    pub alert_type: AlertType,
}

/// Current value against the two baselines, with the relative change to each
/// when the baseline is usable and non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub current: f64,
    pub previous_day: Option<f64>,
    pub seven_day_average: Option<f64>,
    pub change_vs_previous: Option<f64>,
    pub change_vs_average: Option<f64>,
}

impl Comparison {
    pub fn headline_change(&self) -> Option<f64> {
        self.change_vs_previous.or(self.change_vs_average)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCandidate {
    DropOff {
        step_number: u32,
        severity: Severity,
        comparison: Comparison,
    },
    Conversion {
        severity: Severity,
        comparison: Comparison,
    },
    Volume {
        severity: Severity,
        comparison: Comparison,
    },
    StepAnomaly {
        step_number: u32,
        severity: Severity,
        current_value: f64,
        mean: f64,
        std_dev: f64,
        deviation_sigma: f64,
    },
}

impl AlertCandidate {
    pub fn alert_type(&self) -> AlertType {
        match self {
            Self::DropOff { .. } => AlertType::DropOff,
            Self::Conversion { .. } => AlertType::Conversion,
            Self::Volume { .. } => AlertType::Volume,
            Self::StepAnomaly { .. } => AlertType::StepAnomaly,
        }
    }

    pub fn step_number(&self) -> Option<u32> {
        match self {
            Self::DropOff { step_number, .. } | Self::StepAnomaly { step_number, .. } => Some(*step_number),
            Self::Conversion { .. } | Self::Volume { .. } => None,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            step_number: self.step_number(),
            alert_type: self.alert_type(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::DropOff { severity, .. }
            | Self::Conversion { severity, .. }
            | Self::Volume { severity, .. }
            | Self::StepAnomaly { severity, .. } => *severity,
        }
    }

    pub fn current_value(&self) -> f64 {
        match self {
            Self::DropOff { comparison, .. } | Self::Conversion { comparison, .. } | Self::Volume { comparison, .. } => {
                comparison.current
            }
            Self::StepAnomaly { current_value, .. } => *current_value,
        }
    }

    pub fn previous_day_value(&self) -> Option<f64> {
        self.comparison().and_then(|comparison| comparison.previous_day)
    }

    /// Step anomalies are judged against their longer window mean, which
    /// stays in the candidate detail and is not reported as a 7-day average.
    pub fn seven_day_average(&self) -> Option<f64> {
        self.comparison().and_then(|comparison| comparison.seven_day_average)
    }

    pub fn percentage_change(&self) -> Option<f64> {
        match self {
            Self::StepAnomaly { current_value, mean, .. } => {
                if *mean == 0.0 {
                    None
                } else {
                    Some((current_value - mean) / mean)
                }
            }
            _ => self.comparison().and_then(Comparison::headline_change),
        }
    }

    fn comparison(&self) -> Option<&Comparison> {
        match self {
            Self::DropOff { comparison, .. } | Self::Conversion { comparison, .. } | Self::Volume { comparison, .. } => {
                Some(comparison)
            }
            Self::StepAnomaly { .. } => None,
        }
    }

    pub fn describe(&self, step_label: Option<&str>) -> String {
        let step_name = |step: u32| match step_label {
            Some(label) => format!("Step {} ({})", step, label),
            None => format!("Step {}", step),
        };
        match self {
            Self::DropOff { step_number, comparison, .. } => format!(
                "{} drop-off rose to {}{}",
                step_name(*step_number),
                format_percent(comparison.current),
                format_changes(comparison)
            ),
            Self::Conversion { comparison, .. } => format!(
                "Overall conversion fell to {}{}",
                format_percent(comparison.current),
                format_changes(comparison)
            ),
            Self::Volume { comparison, .. } => format!(
                "Funnel starts fell to {:.0}{}",
                comparison.current,
                format_changes(comparison)
            ),
            Self::StepAnomaly {
                step_number,
                current_value,
                mean,
                deviation_sigma,
                ..
            } => format!(
                "{} drop-off of {} is {:.1}σ away from its usual {}",
                step_name(*step_number),
                format_percent(*current_value),
                deviation_sigma,
                format_percent(*mean)
            ),
        }
    }
}

fn format_changes(comparison: &Comparison) -> String {
    let mut parts = Vec::new();
    if let Some(change) = comparison.change_vs_previous {
        parts.push(format!("{:+.0}% vs previous day", change * 100.0));
    }
    if let Some(change) = comparison.change_vs_average {
        parts.push(format!("{:+.0}% vs 7-day average", change * 100.0));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

pub fn format_percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub funnel_id: String,
    pub step_number: Option<u32>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub current_value: f64,
    pub previous_day_value: Option<f64>,
    pub seven_day_average: Option<f64>,
    pub percentage_change: Option<f64>,
    pub message: String,
    pub status: AlertStatus,
    pub detected_for: NaiveDate,
    pub last_seen_for: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub detail: AlertCandidate,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            step_number: self.step_number,
            alert_type: self.alert_type,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAlertsFilters {
    pub funnel_id: Option<String>,
    pub status: Option<AlertStatus>,
    pub open_only: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationReason {
    Created,
    Escalated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub alert_id: String,
    pub funnel_id: String,
    pub step_number: Option<u32>,
    pub step_label: Option<String>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub current_value: f64,
    pub previous_day_value: Option<f64>,
    pub seven_day_average: Option<f64>,
    pub percentage_change: Option<f64>,
    pub message: String,
    pub reason: NotificationReason,
}

impl AlertPayload {
    pub fn from_alert(alert: &Alert, step_label: Option<String>, reason: NotificationReason) -> Self {
        Self {
            alert_id: alert.id.clone(),
            funnel_id: alert.funnel_id.clone(),
            step_number: alert.step_number,
            step_label,
            alert_type: alert.alert_type,
            severity: alert.severity,
            current_value: alert.current_value,
            previous_day_value: alert.previous_day_value,
            seven_day_average: alert.seven_day_average,
            percentage_change: alert.percentage_change,
            message: alert.message.clone(),
            reason,
        }
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub direction: TrendDirection,
    pub change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub starts: u64,
    pub completions: u64,
    pub overall_conversion_rate: Option<f64>,
    pub avg_daily_starts: Option<f64>,
    pub avg_daily_completions: Option<f64>,
    pub avg_conversion_rate: Option<f64>,
    pub starts_trend: Trend,
    pub completions_trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBreakdown {
    pub step_number: u32,
    pub label: Option<String>,
    pub entries: u64,
    pub exits: u64,
    pub conversions: u64,
    pub drop_off_rate: Option<f64>,
    pub conversion_rate: Option<f64>,
    pub previous_conversion_rate: Option<f64>,
    pub conversion_rate_delta: Option<f64>,
    pub avg_time_on_step: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRanking {
    pub step_number: u32,
    pub label: Option<String>,
    pub conversion_rate_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropOffHotspot {
    pub from_step: u32,
    pub step_number: u32,
    pub label: Option<String>,
    pub loss_rate: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub id: String,
    pub funnel_id: String,
    pub report_date: NaiveDate,
    pub summary: ReportSummary,
    pub steps: Vec<StepBreakdown>,
    pub top_steps: Vec<StepRanking>,
    pub bottom_steps: Vec<StepRanking>,
    pub hotspot: Option<DropOffHotspot>,
    pub alert_ids: Vec<String>,
    pub insights: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent: bool,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Everything the report computes, before it is given an identity by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
    pub funnel_id: String,
    pub report_date: NaiveDate,
    pub summary: ReportSummary,
    pub steps: Vec<StepBreakdown>,
    pub top_steps: Vec<StepRanking>,
    pub bottom_steps: Vec<StepRanking>,
    pub hotspot: Option<DropOffHotspot>,
    pub alert_ids: Vec<String>,
    pub insights: Vec<String>,
}

/// What goes to the notification channel for one funnel-day: the rendered
/// report, or the error blocks when assembly failed (`report_id` is `None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMessage {
    pub funnel_id: String,
    pub report_date: NaiveDate,
    pub report_id: Option<String>,
    pub blocks: serde_json::Value,
}

// ─── Cycles ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed,
    PartiallyFailed,
    Interrupted,
    Skipped,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Interrupted => "interrupted",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRun {
    pub id: String,
    pub funnel_id: String,
    pub as_of: NaiveDate,
    pub state: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetch_attempts: u32,
    pub records_written: u64,
    pub alerts_created: u64,
    pub alerts_refreshed: u64,
    pub alerts_resolved: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub run_id: Option<String>,
    pub funnel_id: String,
    pub as_of: NaiveDate,
    pub status: CycleStatus,
    pub upsert: UpsertSummary,
    pub alerts_created: Vec<String>,
    pub alerts_refreshed: Vec<String>,
    pub alerts_resolved: Vec<String>,
    pub report_id: Option<String>,
    pub error: Option<String>,
}

impl CycleReport {
    pub fn skipped(funnel_id: &str, as_of: NaiveDate) -> Self {
        Self {
            run_id: None,
            funnel_id: funnel_id.to_string(),
            as_of,
            status: CycleStatus::Skipped,
            upsert: UpsertSummary::default(),
            alerts_created: Vec::new(),
            alerts_refreshed: Vec::new(),
            alerts_resolved: Vec::new(),
            report_id: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub notifications_sent: u64,
    pub notification_failures: u64,
    pub reports_delivered: u64,
    pub report_delivery_failures: u64,
    pub cycles_completed: u64,
    pub cycles_partially_failed: u64,
    pub cycles_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn ratios_are_derived_and_guard_zero_entries() {
        let record = MetricRecord::daily("quiz", 4, date("2026-03-10"), 817, 253, 500);
        let drop_off = record.drop_off_rate().expect("rate");
        assert!((drop_off - 253.0 / 817.0).abs() < 1e-9);

        let empty = MetricRecord::daily("quiz", 4, date("2026-03-10"), 0, 0, 0);
        assert!(empty.drop_off_rate().is_none());
        assert!(empty.conversion_rate().is_none());
    }

    #[test]
    fn integrity_violation_is_detected() {
        let record = MetricRecord::daily("quiz", 1, date("2026-03-10"), 10, 6, 5);
        assert!(record.violates_integrity());
        let ok = MetricRecord::daily("quiz", 1, date("2026-03-10"), 10, 5, 5);
        assert!(!ok.violates_integrity());
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn candidate_serializes_with_type_tag() {
        let candidate = AlertCandidate::Volume {
            severity: Severity::Warning,
            comparison: Comparison {
                current: 60.0,
                previous_day: Some(100.0),
                seven_day_average: None,
                change_vs_previous: Some(-0.4),
                change_vs_average: None,
            },
        };
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["type"], "volume");
        assert_eq!(candidate.percentage_change(), Some(-0.4));
        assert!(candidate.describe(None).contains("-40% vs previous day"));
    }

    #[test]
    fn step_anomaly_reports_no_seven_day_average() {
        let candidate = AlertCandidate::StepAnomaly {
            step_number: 2,
            severity: Severity::Info,
            current_value: 0.45,
            mean: 0.21,
            std_dev: 0.01,
            deviation_sigma: 24.0,
        };
        assert_eq!(candidate.seven_day_average(), None);
        assert_eq!(candidate.previous_day_value(), None);
        let change = candidate.percentage_change().expect("change vs window mean");
        assert!((change - 0.24 / 0.21).abs() < 1e-9);
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["mean"], 0.21);
    }
}
