use crate::adapters::InsightGenerator;
use crate::baseline::{series, BASELINE_WINDOW_DAYS};
use crate::config::Settings;
use crate::db::Database;
use crate::detector::relative_change;
use crate::errors::AppResult;
use crate::models::{
    format_percent, Alert, AlertPayload, DailyReport, DateRange, DropOffHotspot, Granularity, MetricName,
    MetricRecord, NotificationReason, ReportDraft, ReportSummary, SegmentFilter, Severity, StepBreakdown,
    StepRanking, Trend, TrendDirection,
};
use crate::store::MetricStore;
use chrono::{Duration, NaiveDate};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A value within ±5% of its 7-day average is flat.
pub const TREND_BAND: f64 = 0.05;
pub const HOTSPOT_CRITICAL: f64 = 0.40;
pub const HOTSPOT_WARNING: f64 = 0.25;

#[derive(Clone)]
pub struct ReportAssembler {
    store: MetricStore,
    db: Arc<Database>,
    settings: Arc<Settings>,
    insights: Arc<dyn InsightGenerator>,
}

impl ReportAssembler {
    pub fn new(
        store: MetricStore,
        db: Arc<Database>,
        settings: Arc<Settings>,
        insights: Arc<dyn InsightGenerator>,
    ) -> Self {
        Self {
            store,
            db,
            settings,
            insights,
        }
    }

    /// Builds and stores the report for `report_date`. Safe to re-run: the
    /// row for (funnel, date) is overwritten, never duplicated.
    pub async fn assemble(&self, funnel_id: &str, report_date: NaiveDate) -> AppResult<DailyReport> {
        let range = DateRange::new(report_date - Duration::days(BASELINE_WINDOW_DAYS), report_date);
        let records = self
            .store
            .aggregate(funnel_id, range, Granularity::Daily, &SegmentFilter::Rollup)?;
        let alerts = self.db.list_alerts_seen_on(funnel_id, report_date)?;

        let labels = |step: u32| self.settings.step_label(funnel_id, step);
        let mut draft = build_draft(
            funnel_id,
            report_date,
            &records,
            &alerts,
            &labels,
            self.settings.report_ranking_size,
        );

        let payloads: Vec<AlertPayload> = alerts
            .iter()
            .map(|alert| {
                let label = alert.step_number.and_then(&labels);
                AlertPayload::from_alert(alert, label, NotificationReason::Created)
            })
            .collect();
        draft.insights = self.insights_for(&draft, &payloads).await;

        let report = self.db.upsert_daily_report(&draft)?;
        tracing::info!(
            funnel_id = %funnel_id,
            report_id = %report.id,
            report_date = %report_date,
            alerts = report.alert_ids.len(),
            insights = report.insights.len(),
            "daily report assembled"
        );
        Ok(report)
    }

    /// Message blocks for a stored report, with the alerts it references.
    pub fn render(&self, report: &DailyReport) -> AppResult<serde_json::Value> {
        let mut alerts = Vec::with_capacity(report.alert_ids.len());
        for alert_id in &report.alert_ids {
            if let Some(alert) = self.db.get_alert(alert_id)? {
                alerts.push(alert);
            }
        }
        Ok(render_blocks(
            report,
            &alerts,
            &self.funnel_name(&report.funnel_id),
            self.settings.dashboard_url.as_deref(),
        ))
    }

    pub fn render_failure(&self, funnel_id: &str, message: &str) -> serde_json::Value {
        render_error_blocks(&self.funnel_name(funnel_id), message)
    }

    fn funnel_name(&self, funnel_id: &str) -> String {
        self.settings
            .funnel(funnel_id)
            .and_then(|funnel| funnel.name.clone())
            .unwrap_or_else(|| funnel_id.to_string())
    }

    async fn insights_for(&self, draft: &ReportDraft, alerts: &[AlertPayload]) -> Vec<String> {
        let timeout = std::time::Duration::from_secs(self.settings.insight_timeout_secs.max(1));
        match tokio::time::timeout(timeout, self.insights.generate(draft, alerts)).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(error)) => {
                tracing::warn!(funnel_id = %draft.funnel_id, error = %error, "insight generation failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    funnel_id = %draft.funnel_id,
                    timeout_secs = timeout.as_secs(),
                    "insight generation timed out"
                );
                Vec::new()
            }
        }
    }
}

/// Pure report computation over daily rollup `records` covering the report
/// date and the seven days before it.
pub fn build_draft(
    funnel_id: &str,
    report_date: NaiveDate,
    records: &[MetricRecord],
    alerts: &[Alert],
    labels: &dyn Fn(u32) -> Option<String>,
    ranking_size: usize,
) -> ReportDraft {
    let steps = step_breakdown(report_date, records, labels);
    let (top_steps, bottom_steps) = rank_steps(&steps, ranking_size);

    ReportDraft {
        funnel_id: funnel_id.to_string(),
        report_date,
        summary: summarize(report_date, records),
        hotspot: find_hotspot(&steps),
        top_steps,
        bottom_steps,
        steps,
        alert_ids: alerts.iter().map(|alert| alert.id.clone()).collect(),
        insights: Vec::new(),
    }
}

pub fn classify_trend(current: f64, average: Option<f64>) -> Trend {
    let change = relative_change(current, average);
    let direction = match change {
        Some(change) if change > TREND_BAND => TrendDirection::Up,
        Some(change) if change < -TREND_BAND => TrendDirection::Down,
        Some(_) => TrendDirection::Flat,
        None => TrendDirection::Unknown,
    };
    Trend { direction, change }
}

fn summarize(report_date: NaiveDate, records: &[MetricRecord]) -> ReportSummary {
    let starts = series(records, None, MetricName::FunnelStarts);
    let completions = series(records, None, MetricName::FunnelCompletions);
    let conversion = series(records, None, MetricName::OverallConversion);

    let current_starts = starts.get(&report_date).copied().unwrap_or(0.0);
    let current_completions = completions.get(&report_date).copied().unwrap_or(0.0);
    let avg_daily_starts = prior_average(&starts, report_date);
    let avg_daily_completions = prior_average(&completions, report_date);

    ReportSummary {
        starts: current_starts as u64,
        completions: current_completions as u64,
        overall_conversion_rate: conversion.get(&report_date).copied(),
        avg_daily_starts,
        avg_daily_completions,
        avg_conversion_rate: prior_average(&conversion, report_date),
        starts_trend: classify_trend(current_starts, avg_daily_starts),
        completions_trend: classify_trend(current_completions, avg_daily_completions),
    }
}

/// Mean of the days before `date` inside the baseline window that have data.
fn prior_average(values: &BTreeMap<NaiveDate, f64>, date: NaiveDate) -> Option<f64> {
    let window: Vec<f64> = values
        .range(date - Duration::days(BASELINE_WINDOW_DAYS)..date)
        .map(|(_, value)| *value)
        .collect();
    if window.is_empty() {
        return None;
    }
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

fn step_breakdown(
    report_date: NaiveDate,
    records: &[MetricRecord],
    labels: &dyn Fn(u32) -> Option<String>,
) -> Vec<StepBreakdown> {
    let previous_date = report_date - Duration::days(1);
    let previous: BTreeMap<u32, &MetricRecord> = records
        .iter()
        .filter(|record| record.date == previous_date && record.hour.is_none())
        .map(|record| (record.step_number, record))
        .collect();

    let mut steps: Vec<StepBreakdown> = records
        .iter()
        .filter(|record| record.date == report_date && record.hour.is_none())
        .map(|record| {
            let conversion_rate = record.conversion_rate();
            let previous_conversion_rate = previous
                .get(&record.step_number)
                .and_then(|prior| prior.conversion_rate());
            StepBreakdown {
                step_number: record.step_number,
                label: labels(record.step_number),
                entries: record.entries,
                exits: record.exits,
                conversions: record.conversions,
                drop_off_rate: record.drop_off_rate(),
                conversion_rate,
                previous_conversion_rate,
                conversion_rate_delta: conversion_rate
                    .zip(previous_conversion_rate)
                    .map(|(current, prior)| current - prior),
                avg_time_on_step: record.avg_time_on_step,
            }
        })
        .collect();
    steps.sort_by_key(|step| step.step_number);
    steps
}

/// Top: largest conversion-rate gains. Bottom: largest losses. Steps without
/// a previous day to compare against are left out of both.
fn rank_steps(steps: &[StepBreakdown], size: usize) -> (Vec<StepRanking>, Vec<StepRanking>) {
    let mut ranked: Vec<StepRanking> = steps
        .iter()
        .filter_map(|step| {
            step.conversion_rate_delta.map(|delta| StepRanking {
                step_number: step.step_number,
                label: step.label.clone(),
                conversion_rate_delta: delta,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.conversion_rate_delta
            .total_cmp(&a.conversion_rate_delta)
            .then(a.step_number.cmp(&b.step_number))
    });
    let top: Vec<StepRanking> = ranked.iter().take(size).cloned().collect();

    ranked.sort_by(|a, b| {
        a.conversion_rate_delta
            .total_cmp(&b.conversion_rate_delta)
            .then(a.step_number.cmp(&b.step_number))
    });
    let bottom: Vec<StepRanking> = ranked.into_iter().take(size).collect();
    (top, bottom)
}

/// The step that loses the largest share of the users who reached the step
/// before it.
fn find_hotspot(steps: &[StepBreakdown]) -> Option<DropOffHotspot> {
    let mut hotspot: Option<DropOffHotspot> = None;
    for pair in steps.windows(2) {
        let (before, step) = (&pair[0], &pair[1]);
        if before.entries == 0 || step.entries >= before.entries {
            continue;
        }
        let loss_rate = (before.entries - step.entries) as f64 / before.entries as f64;
        if hotspot.as_ref().is_some_and(|current| current.loss_rate >= loss_rate) {
            continue;
        }
        hotspot = Some(DropOffHotspot {
            from_step: before.step_number,
            step_number: step.step_number,
            label: step.label.clone(),
            loss_rate,
            severity: hotspot_severity(loss_rate),
        });
    }
    hotspot
}

pub fn hotspot_severity(loss_rate: f64) -> Severity {
    if loss_rate > HOTSPOT_CRITICAL {
        Severity::Critical
    } else if loss_rate > HOTSPOT_WARNING {
        Severity::Warning
    } else {
        Severity::Info
    }
}

// ─── Rendering ───────────────────────────────────────────────────────────────

fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => ":red_circle:",
        Severity::Warning => ":large_orange_circle:",
        Severity::Info => ":large_yellow_circle:",
    }
}

fn trend_text(trend: &Trend) -> String {
    match (trend.direction, trend.change) {
        (TrendDirection::Up, Some(change)) => format!(" :chart_with_upwards_trend: +{:.0}%", change * 100.0),
        (TrendDirection::Down, Some(change)) => format!(" :chart_with_downwards_trend: {:.0}%", change * 100.0),
        (TrendDirection::Flat, _) => " :left_right_arrow: flat".to_string(),
        _ => String::new(),
    }
}

fn average_text(average: Option<f64>) -> String {
    average
        .map(|value| format!(" _(avg: {:.1}/day)_", value))
        .unwrap_or_default()
}

fn header_block(funnel_name: &str) -> serde_json::Value {
    json!({
        "type": "header",
        "text": { "type": "plain_text", "text": format!("{}: Daily Snapshot", funnel_name), "emoji": true }
    })
}

fn section(text: String) -> serde_json::Value {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": text } })
}

fn divider() -> serde_json::Value {
    json!({ "type": "divider" })
}

pub fn render_blocks(
    report: &DailyReport,
    alerts: &[Alert],
    funnel_name: &str,
    dashboard_url: Option<&str>,
) -> serde_json::Value {
    let summary = &report.summary;
    let week_start = report.report_date - Duration::days(BASELINE_WINDOW_DAYS);
    let week_end = report.report_date - Duration::days(1);

    let mut blocks = vec![
        header_block(funnel_name),
        json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!(
                    ":calendar: *{}* vs *7-Day Avg* ({}–{})",
                    report.report_date.format("%b %d"),
                    week_start.format("%b %d"),
                    week_end.format("%b %d")
                )
            }]
        }),
        divider(),
    ];

    let mut funnel_text = format!(
        ":bar_chart: *FUNNEL*\n• *Starts:* {}{}{}\n• *Completions:* {}{}{}",
        summary.starts,
        trend_text(&summary.starts_trend),
        average_text(summary.avg_daily_starts),
        summary.completions,
        trend_text(&summary.completions_trend),
        average_text(summary.avg_daily_completions),
    );
    if let Some(rate) = summary.overall_conversion_rate {
        funnel_text.push_str(&format!("\n• *Conversion Rate:* {}", format_percent(rate)));
        if let Some(average) = summary.avg_conversion_rate {
            funnel_text.push_str(&format!(" _(avg: {})_", format_percent(average)));
        }
    }
    blocks.push(section(funnel_text));

    if let Some(hotspot) = &report.hotspot {
        let name = hotspot
            .label
            .clone()
            .unwrap_or_else(|| format!("Step {}", hotspot.step_number));
        blocks.push(divider());
        blocks.push(section(format!(
            ":rotating_light: *DROP-OFF HOTSPOT*\n{} Biggest drop: *{}* losing *{}* of users",
            severity_marker(hotspot.severity),
            name,
            format_percent(hotspot.loss_rate)
        )));
    }

    if !alerts.is_empty() {
        let lines: Vec<String> = alerts
            .iter()
            .map(|alert| format!("{} {} _({})_", severity_marker(alert.severity), alert.message, alert.status.as_str()))
            .collect();
        blocks.push(divider());
        blocks.push(section(format!(":warning: *ALERTS*\n{}", lines.join("\n"))));
    }

    if !report.insights.is_empty() {
        let lines: Vec<String> = report.insights.iter().map(|line| format!("• {}", line)).collect();
        blocks.push(divider());
        blocks.push(section(format!(":bulb: *INSIGHTS*\n{}", lines.join("\n"))));
    }

    blocks.push(divider());
    let mut footer = ":sparkles: _Sent automatically by funnel-monitor_".to_string();
    if let Some(url) = dashboard_url {
        footer.push_str(&format!("  |  <{}|View Full Dashboard>", url));
    }
    blocks.push(json!({ "type": "context", "elements": [{ "type": "mrkdwn", "text": footer }] }));

    json!({
        "text": format!("{}: Daily Snapshot", funnel_name),
        "blocks": blocks,
    })
}

pub fn render_error_blocks(funnel_name: &str, message: &str) -> serde_json::Value {
    json!({
        "text": format!("{}: Daily Snapshot", funnel_name),
        "blocks": [
            header_block(funnel_name),
            section(format!(":warning: *Report failed:* {}", message)),
        ],
    })
}
