use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thresholds {
    pub drop_off_vs_previous: f64,
    pub drop_off_vs_average: f64,
    pub drop_off_critical_rate: f64,
    pub drop_off_warning_rate: f64,
    pub conversion_vs_previous: f64,
    pub conversion_vs_average: f64,
    pub conversion_critical_drop: f64,
    pub volume_vs_previous: f64,
    pub volume_vs_average: f64,
    pub baseline_min_samples: usize,
    pub step_anomaly_sigma: f64,
    pub step_anomaly_window_days: u32,
    pub step_anomaly_min_samples: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            drop_off_vs_previous: 0.15,
            drop_off_vs_average: 0.10,
            drop_off_critical_rate: 0.50,
            drop_off_warning_rate: 0.30,
            conversion_vs_previous: 0.20,
            conversion_vs_average: 0.15,
            conversion_critical_drop: 0.35,
            volume_vs_previous: 0.30,
            volume_vs_average: 0.25,
            baseline_min_samples: 3,
            step_anomaly_sigma: 2.0,
            step_anomaly_window_days: 28,
            step_anomaly_min_samples: 14,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunnelConfig {
    pub id: String,
    pub name: Option<String>,
    pub step_labels: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub dashboard_url: Option<String>,
    pub funnels: Vec<FunnelConfig>,
    pub thresholds: Thresholds,
    pub cycle_interval_secs: u64,
    pub cycle_timeout_secs: u64,
    pub lookback_days: u32,
    pub evaluation_lag_days: u32,
    pub fetch_max_retries: u32,
    pub fetch_backoff_ms: u64,
    pub insight_timeout_secs: u64,
    pub report_hour_utc: u32,
    pub report_ranking_size: usize,
    pub scheduler_concurrency: usize,
    pub max_queue_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("funnel-monitor.sqlite"),
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            dashboard_url: None,
            funnels: Vec::new(),
            thresholds: Thresholds::default(),
            cycle_interval_secs: 900,
            cycle_timeout_secs: 120,
            lookback_days: 3,
            evaluation_lag_days: 1,
            fetch_max_retries: 3,
            fetch_backoff_ms: 1_000,
            insight_timeout_secs: 20,
            report_hour_utc: 8,
            report_ranking_size: 3,
            scheduler_concurrency: 2,
            max_queue_size: 256,
        }
    }
}

impl Settings {
    /// Defaults, deep-merged with the file at `path` when given, then env overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut merged = serde_json::to_value(Settings::default())?;
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?;
            merge_json(&mut merged, parse_config_document(path, &raw)?);
        }

        let mut settings: Settings = serde_json::from_value(merged)
            .map_err(|error| AppError::Config(error.to_string()))?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("FUNNEL_MONITOR_DB") {
            self.database_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("FUNNEL_MONITOR_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("FUNNEL_MONITOR_LOG_DIR") {
            self.log_dir = PathBuf::from(value);
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.cycle_interval_secs == 0 {
            return Err(AppError::Config("cycleIntervalSecs must be positive".to_string()));
        }
        if self.cycle_timeout_secs == 0 {
            return Err(AppError::Config("cycleTimeoutSecs must be positive".to_string()));
        }
        if self.report_hour_utc > 23 {
            return Err(AppError::Config(format!(
                "reportHourUtc must be 0-23, got {}",
                self.report_hour_utc
            )));
        }
        if self.scheduler_concurrency == 0 {
            return Err(AppError::Config("schedulerConcurrency must be positive".to_string()));
        }
        if self.thresholds.baseline_min_samples == 0 {
            return Err(AppError::Config("baselineMinSamples must be positive".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for funnel in &self.funnels {
            if funnel.id.trim().is_empty() {
                return Err(AppError::Config("funnel id cannot be empty".to_string()));
            }
            if !seen.insert(funnel.id.as_str()) {
                return Err(AppError::Config(format!("duplicate funnel id '{}'", funnel.id)));
            }
        }
        Ok(())
    }

    pub fn funnel(&self, funnel_id: &str) -> Option<&FunnelConfig> {
        self.funnels.iter().find(|funnel| funnel.id == funnel_id)
    }

    pub fn step_label(&self, funnel_id: &str, step_number: u32) -> Option<String> {
        self.funnel(funnel_id)
            .and_then(|funnel| funnel.step_labels.get(&step_number))
            .cloned()
    }

    pub fn funnel_ids(&self) -> Vec<String> {
        self.funnels.iter().map(|funnel| funnel.id.clone()).collect()
    }
}

fn parse_config_document(path: &Path, raw: &str) -> AppResult<serde_json::Value> {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());
    match extension.as_deref() {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str::<serde_json::Value>(raw)?),
        Some("json") | None => {
            serde_json::from_str(raw).map_err(|error| AppError::Config(error.to_string()))
        }
        Some(other) => Err(AppError::Config(format!(
            "unsupported config format '{}'",
            other
        ))),
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
