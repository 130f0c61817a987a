use crate::adapters::{InsightGenerator, MetricsProvider, Notifier};
use crate::baseline::BaselineCalculator;
use crate::config::Settings;
use crate::db::Database;
use crate::detector::{fired, AnomalyDetector};
use crate::errors::{AppError, AppResult};
use crate::ingest::{fetch_with_retry, normalize_events, RetryPolicy};
use crate::lifecycle::AlertLifecycle;
use crate::locks::FunnelLocks;
use crate::models::{
    Alert, Baseline, CycleReport, CycleRun, CycleStatus, DailyReport, DateRange, Granularity, HealthSnapshot,
    ListAlertsFilters, MetricName, NotificationReason, ReportMessage, UpsertSummary,
};
use crate::notify::Dispatcher;
use crate::report::ReportAssembler;
use crate::scheduler::Scheduler;
use crate::store::MetricStore;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The external collaborators a monitor talks to.
pub struct Collaborators {
    pub provider: Arc<dyn MetricsProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub insights: Arc<dyn InsightGenerator>,
}

/// Wires one funnel cycle together and exposes the command interface.
#[derive(Clone)]
pub struct FunnelMonitor {
    settings: Arc<Settings>,
    db: Arc<Database>,
    store: MetricStore,
    baselines: BaselineCalculator,
    detector: AnomalyDetector,
    lifecycle: AlertLifecycle,
    reports: ReportAssembler,
    dispatcher: Dispatcher,
    provider: Arc<dyn MetricsProvider>,
    locks: FunnelLocks,
    scheduler: Scheduler,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FunnelMonitor {
    pub fn new(settings: Settings, collaborators: Collaborators) -> AppResult<Arc<Self>> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let db = Arc::new(Database::new(&settings.database_path)?);
        let store = MetricStore::new(db.clone());
        let scheduler = Scheduler::new(settings.scheduler_concurrency, settings.max_queue_size);

        let this = Arc::new(Self {
            baselines: BaselineCalculator::new(store.clone(), settings.thresholds.baseline_min_samples),
            detector: AnomalyDetector::new(store.clone(), settings.thresholds.clone()),
            lifecycle: AlertLifecycle::new(db.clone(), settings.clone()),
            reports: ReportAssembler::new(store.clone(), db.clone(), settings.clone(), collaborators.insights),
            dispatcher: Dispatcher::new(collaborators.notifier, db.clone()),
            provider: collaborators.provider,
            locks: FunnelLocks::new(),
            scheduler: scheduler.clone(),
            retry: RetryPolicy::from_settings(&settings),
            in_flight: Arc::new(Mutex::new(Vec::new())),
            store,
            db,
            settings,
        });

        match this.db.mark_orphan_cycles_interrupted() {
            Ok(interrupted) if interrupted > 0 => {
                tracing::warn!(count = interrupted, "marked orphaned cycles as interrupted on startup");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(error = %error, "failed to sweep orphaned cycles"),
        }

        let weak = Arc::downgrade(&this);
        scheduler.set_executor(Arc::new(move |funnel_id: String| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(strong) = weak.upgrade() else {
                    return true;
                };
                match strong.run_cycle(&funnel_id, Utc::now()).await {
                    Ok(report) => report.status == CycleStatus::PartiallyFailed,
                    Err(error) => {
                        tracing::error!(funnel_id = %funnel_id, error = %error, "cycle aborted");
                        true
                    }
                }
            })
        }));

        Ok(this)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Starts the queue worker and the interval ticker for every configured funnel.
    pub fn start_scheduler(&self) -> JoinHandle<()> {
        self.scheduler.start();
        self.scheduler.start_interval(
            self.settings.funnel_ids(),
            std::time::Duration::from_secs(self.settings.cycle_interval_secs),
        )
    }

    /// The day a cycle at `now` judges: the last complete day by default.
    pub fn evaluation_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.date_naive() - Duration::days(i64::from(self.settings.evaluation_lag_days))
    }

    /// One full cycle for `funnel_id`. Returns a skipped report without doing
    /// anything if a cycle for the same funnel is already running.
    pub async fn run_cycle(&self, funnel_id: &str, now: DateTime<Utc>) -> AppResult<CycleReport> {
        let as_of = self.evaluation_date(now);
        let Some(_guard) = self.locks.try_acquire(funnel_id).await else {
            tracing::info!(funnel_id = %funnel_id, "cycle already running, skipped");
            self.dispatcher.record_cycle(CycleStatus::Skipped);
            return Ok(CycleReport::skipped(funnel_id, as_of));
        };

        let mut run = self.db.insert_cycle_run(funnel_id, as_of)?;
        let mut report = CycleReport {
            run_id: Some(run.id.clone()),
            funnel_id: funnel_id.to_string(),
            as_of,
            status: CycleStatus::Running,
            upsert: UpsertSummary::default(),
            alerts_created: Vec::new(),
            alerts_refreshed: Vec::new(),
            alerts_resolved: Vec::new(),
            report_id: None,
            error: None,
        };
        tracing::info!(funnel_id = %funnel_id, run_id = %run.id, as_of = %as_of, "cycle started");

        let timeout = std::time::Duration::from_secs(self.settings.cycle_timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.execute_cycle(as_of, now, &mut run, &mut report)).await;

        // Whatever was upserted or persisted before a failure stays.
        let (status, error) = match outcome {
            Ok(Ok(())) => (CycleStatus::Completed, None),
            Ok(Err(error)) => (CycleStatus::PartiallyFailed, Some(error.to_string())),
            Err(_) => (
                CycleStatus::PartiallyFailed,
                Some(AppError::Timeout(format!("cycle exceeded {}s", timeout.as_secs())).to_string()),
            ),
        };

        run.state = status;
        run.finished_at = Some(Utc::now());
        run.last_error = error.clone();
        self.db.finish_cycle_run(&run)?;
        self.dispatcher.record_cycle(status);

        report.status = status;
        report.error = error;
        match &report.error {
            None => tracing::info!(
                funnel_id = %funnel_id,
                run_id = %run.id,
                written = report.upsert.written(),
                created = report.alerts_created.len(),
                refreshed = report.alerts_refreshed.len(),
                resolved = report.alerts_resolved.len(),
                "cycle completed"
            ),
            Some(error) => tracing::warn!(
                funnel_id = %funnel_id,
                run_id = %run.id,
                error = %error,
                "cycle partially failed"
            ),
        }
        Ok(report)
    }

    async fn execute_cycle(
        &self,
        as_of: NaiveDate,
        now: DateTime<Utc>,
        run: &mut CycleRun,
        report: &mut CycleReport,
    ) -> AppResult<()> {
        let funnel_id = run.funnel_id.clone();

        // Ingest: a late correction anywhere in the lookback window is re-fetched.
        let lookback = i64::from(self.settings.lookback_days.max(1)) - 1;
        let window = DateRange::new(as_of - Duration::days(lookback), now.date_naive());
        let events = match fetch_with_retry(self.provider.as_ref(), &funnel_id, window, Granularity::Daily, &self.retry)
            .await
        {
            Ok((events, attempts)) => {
                run.fetch_attempts = attempts;
                events
            }
            Err(failure) => {
                run.fetch_attempts = failure.attempts;
                return Err(failure.error);
            }
        };
        let batch = normalize_events(&funnel_id, events, window);
        if batch.rejected > 0 || batch.duplicates > 0 {
            tracing::info!(
                funnel_id = %funnel_id,
                rejected = batch.rejected,
                duplicates = batch.duplicates,
                "provider rows normalized"
            );
        }
        report.upsert = self.store.upsert(&batch.records)?;
        run.records_written = report.upsert.written() as u64;

        // Detect, then resolve what cleared before matching new candidates.
        let outcomes = self.detector.evaluate(&funnel_id, as_of)?;
        let resolved = self.lifecycle.auto_resolve(&funnel_id, &outcomes, now)?;
        let candidates = fired(&outcomes);
        let reconciled = self.lifecycle.reconcile(&funnel_id, as_of, &candidates, now)?;

        run.alerts_resolved = resolved.len() as u64;
        run.alerts_created = reconciled.created.len() as u64;
        run.alerts_refreshed = reconciled.refreshed.len() as u64;
        report.alerts_resolved = resolved.iter().map(|alert| alert.id.clone()).collect();
        report.alerts_created = reconciled.created.iter().map(|alert| alert.id.clone()).collect();
        report.alerts_refreshed = reconciled.refreshed.iter().map(|alert| alert.id.clone()).collect();

        // Alerts are committed; notifications cannot touch them from here on.
        let payloads = reconciled
            .created
            .iter()
            .map(|alert| self.lifecycle.payload(alert, NotificationReason::Created))
            .chain(
                reconciled
                    .escalated
                    .iter()
                    .map(|alert| self.lifecycle.payload(alert, NotificationReason::Escalated)),
            )
            .collect();
        if let Some(handle) = self.dispatcher.dispatch_alerts(payloads) {
            self.track(handle).await;
        }

        if now.hour() >= self.settings.report_hour_utc {
            report.report_id = self.daily_report_stage(&funnel_id, as_of).await?;
        }
        Ok(())
    }

    /// Once per funnel-day: skipped when the day's report was already delivered.
    async fn daily_report_stage(&self, funnel_id: &str, report_date: NaiveDate) -> AppResult<Option<String>> {
        if let Some(existing) = self.db.get_daily_report(funnel_id, report_date)? {
            if existing.sent {
                return Ok(Some(existing.id));
            }
        }

        match self.reports.assemble(funnel_id, report_date).await {
            Ok(daily) => {
                let message = ReportMessage {
                    funnel_id: funnel_id.to_string(),
                    report_date,
                    report_id: Some(daily.id.clone()),
                    blocks: self.reports.render(&daily)?,
                };
                let handle = self.dispatcher.dispatch_report(message);
                self.track(handle).await;
                Ok(Some(daily.id))
            }
            Err(error) => {
                let message = ReportMessage {
                    funnel_id: funnel_id.to_string(),
                    report_date,
                    report_id: None,
                    blocks: self.reports.render_failure(funnel_id, &error.to_string()),
                };
                let handle = self.dispatcher.dispatch_report(message);
                self.track(handle).await;
                Err(error)
            }
        }
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|pending| !pending.is_finished());
        in_flight.push(handle);
    }

    /// Waits for every notification dispatched so far.
    pub async fn drain_notifications(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock().await);
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "notification task panicked");
            }
        }
    }

    // ─── Commands ────────────────────────────────────────────────────────────

    pub fn acknowledge_alert(&self, alert_id: &str, actor: &str) -> AppResult<Alert> {
        self.lifecycle.acknowledge(alert_id, actor)
    }

    pub fn resolve_alert(&self, alert_id: &str, actor: &str, note: Option<&str>) -> AppResult<Alert> {
        self.lifecycle.resolve(alert_id, actor, note)
    }

    pub fn get_alert(&self, alert_id: &str) -> AppResult<Alert> {
        self.lifecycle.get(alert_id)
    }

    pub fn list_alerts(&self, filters: &ListAlertsFilters) -> AppResult<Vec<Alert>> {
        self.db.list_alerts(filters)
    }

    pub fn get_report(&self, funnel_id: &str, report_date: NaiveDate) -> AppResult<Option<DailyReport>> {
        self.db.get_daily_report(funnel_id, report_date)
    }

    /// Rebuilds the stored report for a date without sending it.
    pub async fn assemble_report(&self, funnel_id: &str, report_date: NaiveDate) -> AppResult<DailyReport> {
        self.reports.assemble(funnel_id, report_date).await
    }

    pub fn baseline(
        &self,
        funnel_id: &str,
        step_number: Option<u32>,
        metric: MetricName,
        as_of: NaiveDate,
    ) -> AppResult<Baseline> {
        self.baselines.compute(funnel_id, step_number, metric, as_of)
    }

    pub fn list_cycle_runs(&self, funnel_id: &str, limit: u32) -> AppResult<Vec<CycleRun>> {
        self.db.list_cycle_runs(funnel_id, limit.clamp(1, 500))
    }

    pub fn health(&self) -> HealthSnapshot {
        self.dispatcher.health()
    }
}
