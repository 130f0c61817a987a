use super::InsightGenerator;
use crate::errors::AppResult;
use crate::models::{format_percent, AlertPayload, ReportDraft, Severity, TrendDirection};
use async_trait::async_trait;

/// Rule-based narrative built from the report's own numbers. Stands in for an
/// external text generator and never fails.
#[derive(Debug, Clone, Default)]
pub struct TemplateInsights;

#[async_trait]
impl InsightGenerator for TemplateInsights {
    async fn generate(&self, draft: &ReportDraft, alerts: &[AlertPayload]) -> AppResult<Vec<String>> {
        let mut lines = Vec::new();

        if let Some(hotspot) = &draft.hotspot {
            let name = hotspot
                .label
                .clone()
                .unwrap_or_else(|| format!("step {}", hotspot.step_number));
            lines.push(format!(
                "Biggest drop-off is at {}, losing {} of users from step {}.",
                name,
                format_percent(hotspot.loss_rate),
                hotspot.from_step
            ));
        }

        let trend = &draft.summary.starts_trend;
        if let (TrendDirection::Up | TrendDirection::Down, Some(change)) = (trend.direction, trend.change) {
            lines.push(format!(
                "Funnel starts are {} {:.0}% against the 7-day average.",
                if trend.direction == TrendDirection::Up { "up" } else { "down" },
                change.abs() * 100.0
            ));
        }

        if let Some(worst) = draft.bottom_steps.first().filter(|ranking| ranking.conversion_rate_delta < 0.0) {
            let name = worst
                .label
                .clone()
                .unwrap_or_else(|| format!("step {}", worst.step_number));
            lines.push(format!(
                "{} lost {:.1} points of conversion since the previous day.",
                name,
                worst.conversion_rate_delta.abs() * 100.0
            ));
        }

        if !alerts.is_empty() {
            let critical = alerts
                .iter()
                .filter(|alert| alert.severity == Severity::Critical)
                .count();
            lines.push(format!(
                "{} alert(s) were open for this day, {} critical.",
                alerts.len(),
                critical
            ));
        }

        Ok(lines)
    }
}
