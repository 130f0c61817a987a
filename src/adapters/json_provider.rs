use super::MetricsProvider;
use crate::errors::{AppError, AppResult};
use crate::models::{Granularity, RawMetricEvent};
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

static FUNNEL_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

/// Reads `<dir>/<funnel_id>.json`, a JSON array of raw metric events, as a
/// stand-in for a live upstream. A missing file is an empty sync.
#[derive(Debug, Clone)]
pub struct JsonDirProvider {
    dir: PathBuf,
}

impl JsonDirProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, funnel_id: &str) -> AppResult<PathBuf> {
        if !FUNNEL_ID_RE.is_match(funnel_id) {
            return Err(AppError::Config(format!("invalid funnel id '{}'", funnel_id)));
        }
        Ok(self.dir.join(format!("{}.json", funnel_id)))
    }
}

#[async_trait]
impl MetricsProvider for JsonDirProvider {
    async fn fetch(
        &self,
        funnel_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> AppResult<Vec<RawMetricEvent>> {
        let path = self.file_for(funnel_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(funnel_id = %funnel_id, path = %path.display(), "no metrics file for funnel");
                return Ok(Vec::new());
            }
            Err(error) => {
                return Err(AppError::UpstreamFetch(format!("{}: {}", path.display(), error)));
            }
        };

        // A broken file stays broken until someone edits it: not retryable.
        let events: Vec<RawMetricEvent> = serde_json::from_str(&raw)
            .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?;

        Ok(events
            .into_iter()
            .filter(|event| start <= event.date && event.date <= end)
            .filter(|event| granularity == Granularity::Daily || event.hour.is_some())
            .collect())
    }
}
