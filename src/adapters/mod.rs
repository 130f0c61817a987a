pub mod insights;
pub mod json_provider;
pub mod log_notifier;

use crate::errors::AppResult;
use crate::models::{AlertPayload, Granularity, RawMetricEvent, ReportDraft, ReportMessage};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Upstream source of funnel counters. Output is untrusted: callers normalize
/// it before anything reaches the metric store.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn fetch(
        &self,
        funnel_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> AppResult<Vec<RawMetricEvent>>;
}

/// Outbound channel. Delivery is best-effort; a failure here never touches
/// persisted alert or report state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, payload: &AlertPayload) -> AppResult<()>;

    async fn send_report(&self, message: &ReportMessage) -> AppResult<()>;
}

/// Narrative lines for a report. Called with a timeout; any failure leaves
/// the report with numeric sections only.
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(&self, draft: &ReportDraft, alerts: &[AlertPayload]) -> AppResult<Vec<String>>;
}
