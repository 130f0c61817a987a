use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use funnel_monitor_lib::adapters::{InsightGenerator, MetricsProvider, Notifier};
use funnel_monitor_lib::config::{FunnelConfig, Settings};
use funnel_monitor_lib::errors::{AppError, AppResult};
use funnel_monitor_lib::models::{
    AlertPayload, AlertStatus, AlertType, CycleStatus, Granularity, ListAlertsFilters, MetricName,
    NotificationReason, RawMetricEvent, ReportDraft, ReportMessage, Severity,
};
use funnel_monitor_lib::monitor::{Collaborators, FunnelMonitor};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

const FUNNEL: &str = "quiz";

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).expect("date")
}

fn morning(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, d, 10, 0, 0).single().expect("time")
}

/// Five steps of 1000 entries each; step 4 loses `step4_exits`, every other
/// step loses 100. Completions and starts stay flat.
fn funnel_day(date: NaiveDate, step4_exits: i64) -> Vec<RawMetricEvent> {
    (1..=5)
        .map(|step| {
            let exits = if step == 4 { step4_exits } else { 100 };
            RawMetricEvent {
                funnel_id: FUNNEL.to_string(),
                step_number: step,
                date,
                hour: None,
                segment_key: None,
                entries: 1000,
                exits,
                conversions: if step == 5 { 900 } else { 1000 - exits },
                avg_time_on_step: Some(12.0),
                observed_at: None,
            }
        })
        .collect()
}

/// Previous day 18%, seven-day average 19%, evaluated day (Mar 10) 31%.
fn drop_off_history() -> Vec<RawMetricEvent> {
    let mut events = Vec::new();
    for (d, exits) in [(3, 190), (4, 190), (5, 190), (6, 190), (7, 190), (8, 200), (9, 180), (10, 310)] {
        events.extend(funnel_day(day(d), exits));
    }
    events
}

#[derive(Default)]
struct FakeProvider {
    events: Mutex<Vec<RawMetricEvent>>,
    failing: AtomicBool,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    entered: Arc<Notify>,
    delay: Option<Duration>,
}

impl FakeProvider {
    fn with_events(events: Vec<RawMetricEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    fn replace(&self, events: Vec<RawMetricEvent>) {
        *self.events.lock().expect("events lock") = events;
    }
}

#[async_trait]
impl MetricsProvider for FakeProvider {
    async fn fetch(
        &self,
        _funnel_id: &str,
        _start: NaiveDate,
        _end: NaiveDate,
        _granularity: Granularity,
    ) -> AppResult<Vec<RawMetricEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            let _permit = gate.acquire().await.expect("gate open");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamFetch("provider returned 503".to_string()));
        }
        Ok(self.events.lock().expect("events lock").clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<AlertPayload>>,
    reports: Mutex<Vec<ReportMessage>>,
    failing: bool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_alert(&self, payload: &AlertPayload) -> AppResult<()> {
        if self.failing {
            return Err(AppError::NotificationDelivery("webhook unreachable".to_string()));
        }
        self.alerts.lock().expect("alerts lock").push(payload.clone());
        Ok(())
    }

    async fn send_report(&self, message: &ReportMessage) -> AppResult<()> {
        if self.failing {
            return Err(AppError::NotificationDelivery("webhook unreachable".to_string()));
        }
        self.reports.lock().expect("reports lock").push(message.clone());
        Ok(())
    }
}

struct StaticInsights;

#[async_trait]
impl InsightGenerator for StaticInsights {
    async fn generate(&self, _draft: &ReportDraft, alerts: &[AlertPayload]) -> AppResult<Vec<String>> {
        Ok(vec![format!("{} alert(s) today", alerts.len())])
    }
}

fn settings(dir: &tempfile::TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.database_path = dir.path().join("monitor.sqlite");
    settings.lookback_days = 14;
    settings.fetch_max_retries = 2;
    settings.fetch_backoff_ms = 1;
    settings.funnels.push(FunnelConfig {
        id: FUNNEL.to_string(),
        name: Some("Quiz".to_string()),
        step_labels: [(4, "Q4 - Duration".to_string())].into_iter().collect(),
    });
    settings
}

fn monitor(
    settings: Settings,
    provider: Arc<FakeProvider>,
    notifier: Arc<RecordingNotifier>,
) -> Arc<FunnelMonitor> {
    FunnelMonitor::new(
        settings,
        Collaborators {
            provider,
            notifier,
            insights: Arc::new(StaticInsights),
        },
    )
    .expect("monitor")
}

fn open_alerts(monitor: &FunnelMonitor) -> Vec<funnel_monitor_lib::models::Alert> {
    monitor
        .list_alerts(&ListAlertsFilters {
            funnel_id: Some(FUNNEL.to_string()),
            open_only: Some(true),
            ..ListAlertsFilters::default()
        })
        .expect("list alerts")
}

#[tokio::test]
async fn drop_off_spike_raises_one_warning_and_a_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = monitor(settings(&dir), provider, notifier.clone());

    let report = monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    monitor.drain_notifications().await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.as_of, day(10));
    assert_eq!(report.alerts_created.len(), 1);

    let alerts = open_alerts(&monitor);
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.alert_type, AlertType::DropOff);
    assert_eq!(alert.step_number, Some(4));
    assert_eq!(alert.severity, Severity::Warning);
    assert_eq!(alert.status, AlertStatus::Active);
    assert!((alert.current_value - 0.31).abs() < 1e-9);
    let change = alert.percentage_change.expect("change");
    assert!((change - 0.13 / 0.18).abs() < 1e-6);
    assert!(alert.message.contains("Q4 - Duration"));

    let sent = notifier.alerts.lock().expect("alerts").clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reason, NotificationReason::Created);
    assert_eq!(sent[0].step_label.as_deref(), Some("Q4 - Duration"));

    let daily = monitor.get_report(FUNNEL, day(10)).expect("get").expect("report");
    assert_eq!(Some(daily.id.clone()), report.report_id);
    assert_eq!(daily.alert_ids, vec![alert.id.clone()]);
    assert_eq!(daily.insights, vec!["1 alert(s) today".to_string()]);
    assert!(daily.sent);
    let messages = notifier.reports.lock().expect("reports").clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].blocks.to_string().contains("ALERTS"));

    let runs = monitor.list_cycle_runs(FUNNEL, 10).expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, CycleStatus::Completed);
    assert_eq!(runs[0].alerts_created, 1);
    assert_eq!(runs[0].fetch_attempts, 1);
}

#[tokio::test]
async fn repeated_cycles_refresh_instead_of_duplicating() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = monitor(settings(&dir), provider.clone(), notifier.clone());

    monitor.run_cycle(FUNNEL, morning(11)).await.expect("first");
    monitor.drain_notifications().await;

    // Late correction for the evaluated day.
    let mut corrected = drop_off_history();
    corrected.retain(|event| event.date != day(10));
    corrected.extend(funnel_day(day(10), 350));
    provider.replace(corrected);

    let second = monitor.run_cycle(FUNNEL, morning(11)).await.expect("second");
    monitor.drain_notifications().await;

    assert!(second.alerts_created.is_empty());
    assert_eq!(second.alerts_refreshed.len(), 1);
    assert_eq!(second.upsert.corrected, 1);
    assert_eq!(second.upsert.unchanged, 39);

    let alerts = open_alerts(&monitor);
    assert_eq!(alerts.len(), 1);
    assert!((alerts[0].current_value - 0.35).abs() < 1e-9);
    // Same severity band: no second notification.
    assert_eq!(notifier.alerts.lock().expect("alerts").len(), 1);
    // The report was already delivered for the day.
    assert_eq!(notifier.reports.lock().expect("reports").len(), 1);
}

#[tokio::test]
async fn worsening_drop_off_escalates_and_notifies_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = monitor(settings(&dir), provider.clone(), notifier.clone());

    monitor.run_cycle(FUNNEL, morning(11)).await.expect("first");
    monitor.drain_notifications().await;
    let alert_id = open_alerts(&monitor)[0].id.clone();

    let mut worse = drop_off_history();
    worse.retain(|event| event.date != day(10));
    worse.extend(funnel_day(day(10), 550));
    provider.replace(worse);

    let second = monitor.run_cycle(FUNNEL, morning(11)).await.expect("second");
    monitor.drain_notifications().await;
    assert!(second.alerts_created.is_empty());
    assert_eq!(second.alerts_refreshed, vec![alert_id.clone()]);

    let sent = notifier.alerts.lock().expect("alerts").clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].reason, NotificationReason::Created);
    assert_eq!(sent[0].severity, Severity::Warning);
    assert_eq!(sent[1].reason, NotificationReason::Escalated);
    assert_eq!(sent[1].severity, Severity::Critical);
    assert_eq!(sent[1].alert_id, alert_id);
    assert!((sent[1].current_value - 0.55).abs() < 1e-9);

    let alert = monitor.get_alert(&alert_id).expect("alert");
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.status, AlertStatus::Active);
}

#[tokio::test]
async fn recovered_metric_auto_resolves_the_alert() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = monitor(settings(&dir), provider.clone(), notifier);

    monitor.run_cycle(FUNNEL, morning(11)).await.expect("first");
    let alert_id = open_alerts(&monitor)[0].id.clone();

    let mut recovered = drop_off_history();
    recovered.extend(funnel_day(day(11), 180));
    provider.replace(recovered);

    let next = monitor.run_cycle(FUNNEL, morning(12)).await.expect("next day");
    assert_eq!(next.alerts_resolved, vec![alert_id.clone()]);
    assert!(next.alerts_created.is_empty());

    let alert = monitor.get_alert(&alert_id).expect("alert");
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert!(alert.resolved_by.is_none());
    assert!(alert.acknowledged_by.is_none());
    assert!(open_alerts(&monitor).is_empty());
}

#[tokio::test]
async fn manual_transitions_follow_the_state_machine() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let monitor = monitor(settings(&dir), provider, Arc::new(RecordingNotifier::default()));

    monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    let alert_id = open_alerts(&monitor)[0].id.clone();

    let acknowledged = monitor.acknowledge_alert(&alert_id, "dana").expect("ack");
    assert_eq!(acknowledged.status, AlertStatus::Acknowledged);
    assert_eq!(acknowledged.acknowledged_by.as_deref(), Some("dana"));

    let resolved = monitor
        .resolve_alert(&alert_id, "dana", Some("copy fixed on Q4"))
        .expect("resolve");
    assert_eq!(resolved.status, AlertStatus::Resolved);

    let err = monitor
        .resolve_alert(&alert_id, "dana", None)
        .expect_err("already resolved");
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    let err = monitor.acknowledge_alert(&alert_id, "dana").expect_err("not active");
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    let unchanged = monitor.get_alert(&alert_id).expect("alert");
    assert_eq!(unchanged.status, AlertStatus::Resolved);
    assert_eq!(unchanged.resolution_note.as_deref(), Some("copy fixed on Q4"));
}

#[tokio::test]
async fn young_funnel_raises_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut events = funnel_day(day(8), 100);
    events.extend(funnel_day(day(9), 100));
    events.extend(funnel_day(day(10), 800));
    let provider = Arc::new(FakeProvider::with_events(events));
    let monitor = monitor(settings(&dir), provider, Arc::new(RecordingNotifier::default()));

    let report = monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    assert_eq!(report.status, CycleStatus::Completed);
    assert!(report.alerts_created.is_empty());
    assert!(open_alerts(&monitor).is_empty());

    let baseline = monitor
        .baseline(FUNNEL, Some(4), MetricName::DropOffRate, day(10))
        .expect("baseline");
    assert_eq!(baseline.sample_count, 2);
    assert!(baseline.seven_day_average.is_none());
}

#[tokio::test]
async fn overlapping_cycle_for_the_same_funnel_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = Arc::new(Semaphore::new(0));
    let provider = Arc::new(FakeProvider {
        events: Mutex::new(drop_off_history()),
        gate: Some(gate.clone()),
        ..FakeProvider::default()
    });
    let monitor = monitor(settings(&dir), provider.clone(), Arc::new(RecordingNotifier::default()));

    let first = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run_cycle(FUNNEL, morning(11)).await })
    };
    provider.entered.notified().await;

    let skipped = monitor.run_cycle(FUNNEL, morning(11)).await.expect("second");
    assert_eq!(skipped.status, CycleStatus::Skipped);
    assert!(skipped.run_id.is_none());

    gate.add_permits(1);
    let completed = first.await.expect("join").expect("first");
    assert_eq!(completed.status, CycleStatus::Completed);
    assert_eq!(open_alerts(&monitor).len(), 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.health().cycles_skipped, 1);
}

#[tokio::test]
async fn failed_delivery_keeps_alerts_and_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let notifier = Arc::new(RecordingNotifier {
        failing: true,
        ..RecordingNotifier::default()
    });
    let monitor = monitor(settings(&dir), provider, notifier);

    let report = monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    monitor.drain_notifications().await;

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(open_alerts(&monitor).len(), 1);
    let daily = monitor.get_report(FUNNEL, day(10)).expect("get").expect("report");
    assert!(!daily.sent);

    let health = monitor.health();
    assert_eq!(health.notification_failures, 1);
    assert_eq!(health.report_delivery_failures, 1);
    assert_eq!(health.cycles_completed, 1);
}

#[tokio::test]
async fn exhausted_fetch_marks_the_cycle_partially_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let monitor = monitor(settings(&dir), provider.clone(), Arc::new(RecordingNotifier::default()));

    monitor.run_cycle(FUNNEL, morning(11)).await.expect("healthy cycle");
    provider.failing.store(true, Ordering::SeqCst);
    provider.calls.store(0, Ordering::SeqCst);

    let report = monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    assert_eq!(report.status, CycleStatus::PartiallyFailed);
    assert!(report.error.as_deref().is_some_and(|error| error.starts_with("UPSTREAM_FETCH")));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    // Earlier facts survive the failed cycle.
    assert_eq!(open_alerts(&monitor).len(), 1);
    let runs = monitor.list_cycle_runs(FUNNEL, 10).expect("runs");
    let failed = runs
        .iter()
        .find(|run| run.state == CycleStatus::PartiallyFailed)
        .expect("failed run");
    assert_eq!(failed.fetch_attempts, 3);
    assert_eq!(monitor.health().cycles_partially_failed, 1);
}

#[tokio::test]
async fn stalled_provider_times_the_cycle_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider {
        events: Mutex::new(drop_off_history()),
        delay: Some(Duration::from_secs(5)),
        ..FakeProvider::default()
    });
    let mut settings = settings(&dir);
    settings.cycle_timeout_secs = 1;
    let monitor = monitor(settings, provider, Arc::new(RecordingNotifier::default()));

    let report = monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    assert_eq!(report.status, CycleStatus::PartiallyFailed);
    assert!(report.error.as_deref().is_some_and(|error| error.starts_with("TIMEOUT")));

    let runs = monitor.list_cycle_runs(FUNNEL, 10).expect("runs");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].finished_at.is_some());
    assert_eq!(runs[0].state, CycleStatus::PartiallyFailed);
}

#[tokio::test]
async fn reassembling_a_report_keeps_one_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = Arc::new(FakeProvider::with_events(drop_off_history()));
    let monitor = monitor(settings(&dir), provider, Arc::new(RecordingNotifier::default()));

    monitor.run_cycle(FUNNEL, morning(11)).await.expect("cycle");
    let first = monitor.get_report(FUNNEL, day(10)).expect("get").expect("report");
    let again = monitor.assemble_report(FUNNEL, day(10)).await.expect("reassemble");

    assert_eq!(again.id, first.id);
    assert_eq!(again.created_at, first.created_at);
    assert_eq!(again.summary, first.summary);
    assert_eq!(monitor.get_report(FUNNEL, day(10)).expect("get").map(|r| r.id), Some(first.id));
}
