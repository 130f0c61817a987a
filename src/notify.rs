use crate::adapters::Notifier;
use crate::db::Database;
use crate::models::{AlertPayload, CycleStatus, HealthSnapshot, ReportMessage};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct HealthCounters {
    notifications_sent: AtomicU64,
    notification_failures: AtomicU64,
    reports_delivered: AtomicU64,
    report_delivery_failures: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_partially_failed: AtomicU64,
    cycles_skipped: AtomicU64,
}

/// Second phase of a cycle: runs after alerts and reports are committed, on
/// its own task, so nothing it does can reach back into persisted state
/// except the report's delivery flag.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    db: Arc<Database>,
    health: Arc<HealthCounters>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, db: Arc<Database>) -> Self {
        Self {
            notifier,
            db,
            health: Arc::new(HealthCounters::default()),
        }
    }

    pub fn dispatch_alerts(&self, payloads: Vec<AlertPayload>) -> Option<JoinHandle<()>> {
        if payloads.is_empty() {
            return None;
        }
        let notifier = self.notifier.clone();
        let health = self.health.clone();
        Some(tokio::spawn(async move {
            for payload in payloads {
                match notifier.send_alert(&payload).await {
                    Ok(()) => {
                        health.notifications_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        health.notification_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            alert_id = %payload.alert_id,
                            funnel_id = %payload.funnel_id,
                            error = %error,
                            "alert notification failed"
                        );
                    }
                }
            }
        }))
    }

    /// Marks the stored report delivered once the channel accepts it.
    pub fn dispatch_report(&self, message: ReportMessage) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        let db = self.db.clone();
        let health = self.health.clone();
        tokio::spawn(async move {
            if let Err(error) = notifier.send_report(&message).await {
                health.report_delivery_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    report_id = ?message.report_id,
                    funnel_id = %message.funnel_id,
                    error = %error,
                    "report delivery failed"
                );
                return;
            }
            health.reports_delivered.fetch_add(1, Ordering::Relaxed);
            let Some(report_id) = message.report_id.as_deref() else {
                return;
            };
            if let Err(error) = db.mark_report_delivered(report_id, Utc::now()) {
                tracing::warn!(report_id = %report_id, error = %error, "could not record report delivery");
            }
        })
    }

    pub fn record_cycle(&self, status: CycleStatus) {
        let counter = match status {
            CycleStatus::Completed => &self.health.cycles_completed,
            CycleStatus::PartiallyFailed | CycleStatus::Interrupted => &self.health.cycles_partially_failed,
            CycleStatus::Skipped => &self.health.cycles_skipped,
            CycleStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health(&self) -> HealthSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HealthSnapshot {
            notifications_sent: load(&self.health.notifications_sent),
            notification_failures: load(&self.health.notification_failures),
            reports_delivered: load(&self.health.reports_delivered),
            report_delivery_failures: load(&self.health.report_delivery_failures),
            cycles_completed: load(&self.health.cycles_completed),
            cycles_partially_failed: load(&self.health.cycles_partially_failed),
            cycles_skipped: load(&self.health.cycles_skipped),
        }
    }
}
