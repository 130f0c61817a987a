use super::Notifier;
use crate::errors::AppResult;
use crate::models::{AlertPayload, ReportMessage};
use async_trait::async_trait;

/// Delivers to the structured log. Used when no outbound channel is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, payload: &AlertPayload) -> AppResult<()> {
        tracing::warn!(
            target: "funnel_monitor::notifications",
            alert_id = %payload.alert_id,
            funnel_id = %payload.funnel_id,
            step = ?payload.step_number,
            alert_type = payload.alert_type.as_str(),
            severity = payload.severity.as_str(),
            reason = ?payload.reason,
            payload = %serde_json::to_string(payload)?,
            "{}",
            payload.message
        );
        Ok(())
    }

    async fn send_report(&self, message: &ReportMessage) -> AppResult<()> {
        tracing::info!(
            target: "funnel_monitor::notifications",
            report_id = ?message.report_id,
            funnel_id = %message.funnel_id,
            report_date = %message.report_date,
            blocks = %message.blocks,
            "daily report"
        );
        Ok(())
    }
}
