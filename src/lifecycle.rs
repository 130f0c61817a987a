use crate::config::Settings;
use crate::db::{AlertRefresh, Database};
use crate::detector::{RuleOutcome, RuleVerdict};
use crate::errors::{AppError, AppResult};
use crate::models::{Alert, AlertCandidate, AlertKey, AlertPayload, AlertStatus, NotificationReason};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub created: Vec<Alert>,
    pub refreshed: Vec<Alert>,
    /// Subset of `refreshed` whose severity went up this cycle.
    pub escalated: Vec<Alert>,
}

/// Sole writer of `Alert::status`.
#[derive(Clone)]
pub struct AlertLifecycle {
    db: Arc<Database>,
    settings: Arc<Settings>,
}

impl AlertLifecycle {
    pub fn new(db: Arc<Database>, settings: Arc<Settings>) -> Self {
        Self { db, settings }
    }

    /// Resolves every open alert whose rule evaluated and came out clear.
    /// Rules that were suppressed (no data, short baseline) leave their alert
    /// open: not being able to judge is not the same as being back to normal.
    pub fn auto_resolve(
        &self,
        funnel_id: &str,
        outcomes: &[RuleOutcome],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Alert>> {
        let cleared: HashSet<AlertKey> = outcomes
            .iter()
            .filter(|outcome| matches!(outcome.verdict, RuleVerdict::Clear))
            .map(|outcome| outcome.key)
            .collect();

        let mut resolved = Vec::new();
        for alert in self.db.list_open_alerts(funnel_id)? {
            if !cleared.contains(&alert.key()) {
                continue;
            }
            if !self
                .db
                .transition_alert(&alert.id, alert.status, AlertStatus::Resolved, None, None, now)?
            {
                tracing::debug!(alert_id = %alert.id, "alert changed status during auto-resolution, skipped");
                continue;
            }
            tracing::info!(
                funnel_id = %funnel_id,
                alert_id = %alert.id,
                alert_type = alert.alert_type.as_str(),
                step = ?alert.step_number,
                "alert auto-resolved"
            );
            if let Some(updated) = self.db.get_alert(&alert.id)? {
                resolved.push(updated);
            }
        }
        Ok(resolved)
    }

    /// Matches candidates against open alerts on (funnel, step, type): a match
    /// is refreshed in place, anything else becomes a new active alert.
    pub fn reconcile(
        &self,
        funnel_id: &str,
        as_of: NaiveDate,
        candidates: &[AlertCandidate],
        now: DateTime<Utc>,
    ) -> AppResult<ReconcileOutcome> {
        let mut open: HashMap<AlertKey, Alert> = self
            .db
            .list_open_alerts(funnel_id)?
            .into_iter()
            .map(|alert| (alert.key(), alert))
            .collect();

        let mut outcome = ReconcileOutcome::default();
        for candidate in candidates {
            let label = candidate
                .step_number()
                .and_then(|step| self.settings.step_label(funnel_id, step));
            let message = candidate.describe(label.as_deref());

            if let Some(existing) = open.remove(&candidate.key()) {
                let refresh = AlertRefresh {
                    severity: candidate.severity(),
                    current_value: candidate.current_value(),
                    previous_day_value: candidate.previous_day_value(),
                    seven_day_average: candidate.seven_day_average(),
                    percentage_change: candidate.percentage_change(),
                    message: &message,
                    last_seen_for: as_of,
                    detail: candidate,
                };
                if self.db.refresh_open_alert(&existing.id, &refresh)? {
                    let updated = self.load(&existing.id)?;
                    if candidate.severity() > existing.severity {
                        tracing::info!(
                            alert_id = %existing.id,
                            from = existing.severity.as_str(),
                            to = candidate.severity().as_str(),
                            "alert severity escalated"
                        );
                        outcome.escalated.push(updated.clone());
                    }
                    outcome.refreshed.push(updated);
                    continue;
                }
                // Resolved by a caller between listing and refreshing: the
                // anomaly is still there, so it opens as a new alert.
                tracing::debug!(alert_id = %existing.id, "open alert closed mid-cycle");
            }

            let alert = new_alert(funnel_id, as_of, candidate, message, now);
            self.db.insert_alert(&alert)?;
            tracing::info!(
                funnel_id = %funnel_id,
                alert_id = %alert.id,
                alert_type = alert.alert_type.as_str(),
                severity = alert.severity.as_str(),
                step = ?alert.step_number,
                "alert created"
            );
            outcome.created.push(alert);
        }
        Ok(outcome)
    }

    pub fn acknowledge(&self, alert_id: &str, actor: &str) -> AppResult<Alert> {
        let alert = self.load(alert_id)?;
        if alert.status != AlertStatus::Active {
            return Err(invalid_transition(&alert, "acknowledge"));
        }
        self.transition(&alert, AlertStatus::Acknowledged, actor, None, "acknowledge")
    }

    /// Allowed from active or acknowledged.
    pub fn resolve(&self, alert_id: &str, actor: &str, note: Option<&str>) -> AppResult<Alert> {
        let alert = self.load(alert_id)?;
        if !alert.status.is_open() {
            return Err(invalid_transition(&alert, "resolve"));
        }
        self.transition(&alert, AlertStatus::Resolved, actor, note, "resolve")
    }

    pub fn get(&self, alert_id: &str) -> AppResult<Alert> {
        self.load(alert_id)
    }

    pub fn payload(&self, alert: &Alert, reason: NotificationReason) -> AlertPayload {
        let label = alert
            .step_number
            .and_then(|step| self.settings.step_label(&alert.funnel_id, step));
        AlertPayload::from_alert(alert, label, reason)
    }

    fn transition(
        &self,
        alert: &Alert,
        next: AlertStatus,
        actor: &str,
        note: Option<&str>,
        action: &str,
    ) -> AppResult<Alert> {
        let changed = self
            .db
            .transition_alert(&alert.id, alert.status, next, Some(actor), note, Utc::now())?;
        if !changed {
            // Lost the compare-and-set: report against the status that won.
            let current = self.load(&alert.id)?;
            return Err(invalid_transition(&current, action));
        }
        tracing::info!(alert_id = %alert.id, actor = %actor, to = next.as_str(), "alert transitioned");
        self.load(&alert.id)
    }

    fn load(&self, alert_id: &str) -> AppResult<Alert> {
        self.db
            .get_alert(alert_id)?
            .ok_or_else(|| AppError::NotFound(format!("alert {}", alert_id)))
    }
}

fn invalid_transition(alert: &Alert, action: &str) -> AppError {
    AppError::InvalidTransition {
        alert_id: alert.id.clone(),
        from: alert.status.as_str().to_string(),
        action: action.to_string(),
    }
}

fn new_alert(
    funnel_id: &str,
    as_of: NaiveDate,
    candidate: &AlertCandidate,
    message: String,
    now: DateTime<Utc>,
) -> Alert {
    Alert {
        id: Uuid::new_v4().to_string(),
        funnel_id: funnel_id.to_string(),
        step_number: candidate.step_number(),
        alert_type: candidate.alert_type(),
        severity: candidate.severity(),
        current_value: candidate.current_value(),
        previous_day_value: candidate.previous_day_value(),
        seven_day_average: candidate.seven_day_average(),
        percentage_change: candidate.percentage_change(),
        message,
        status: AlertStatus::Active,
        detected_for: as_of,
        last_seen_for: as_of,
        created_at: now,
        updated_at: now,
        acknowledged_by: None,
        acknowledged_at: None,
        resolved_by: None,
        resolved_at: None,
        resolution_note: None,
        detail: candidate.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunnelConfig;
    use crate::models::{AlertType, Comparison, Severity};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).expect("date")
    }

    fn setup() -> (tempfile::TempDir, AlertLifecycle, Arc<Database>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let mut settings = Settings::default();
        settings.funnels.push(FunnelConfig {
            id: "quiz".to_string(),
            name: None,
            step_labels: [(4, "Q4 - Duration".to_string())].into_iter().collect(),
        });
        let lifecycle = AlertLifecycle::new(db.clone(), Arc::new(settings));
        (dir, lifecycle, db)
    }

    fn drop_off(step: u32, current: f64, severity: Severity) -> AlertCandidate {
        AlertCandidate::DropOff {
            step_number: step,
            severity,
            comparison: Comparison {
                current,
                previous_day: Some(0.18),
                seven_day_average: Some(0.19),
                change_vs_previous: Some((current - 0.18) / 0.18),
                change_vs_average: Some((current - 0.19) / 0.19),
            },
        }
    }

    fn outcome(step: u32, verdict: RuleVerdict) -> RuleOutcome {
        RuleOutcome {
            key: AlertKey {
                step_number: Some(step),
                alert_type: AlertType::DropOff,
            },
            verdict,
        }
    }

    #[test]
    fn consecutive_candidates_refresh_one_alert() {
        let (_dir, lifecycle, db) = setup();
        let first = lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("first");
        assert_eq!(first.created.len(), 1);
        assert!(first.created[0].message.contains("Q4 - Duration"));

        let second = lifecycle
            .reconcile("quiz", day(11), &[drop_off(4, 0.35, Severity::Warning)], Utc::now())
            .expect("second");
        assert!(second.created.is_empty());
        assert_eq!(second.refreshed.len(), 1);
        assert!(second.escalated.is_empty());

        let open = db.list_open_alerts("quiz").expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, AlertStatus::Active);
        assert!((open[0].current_value - 0.35).abs() < 1e-9);
        assert_eq!(open[0].detected_for, day(10));
        assert_eq!(open[0].last_seen_for, day(11));
    }

    #[test]
    fn higher_severity_on_refresh_is_an_escalation() {
        let (_dir, lifecycle, _db) = setup();
        lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("first");
        let second = lifecycle
            .reconcile("quiz", day(11), &[drop_off(4, 0.55, Severity::Critical)], Utc::now())
            .expect("second");
        assert_eq!(second.escalated.len(), 1);
        assert_eq!(second.escalated[0].severity, Severity::Critical);
    }

    #[test]
    fn clear_outcome_resolves_without_actor() {
        let (_dir, lifecycle, db) = setup();
        let created = lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("reconcile")
            .created;
        lifecycle.acknowledge(&created[0].id, "ops").expect("ack");

        let resolved = lifecycle
            .auto_resolve("quiz", &[outcome(4, RuleVerdict::Clear)], Utc::now())
            .expect("auto resolve");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, AlertStatus::Resolved);
        assert!(resolved[0].resolved_by.is_none());
        assert!(resolved[0].resolved_at.is_some());
        assert!(db.list_open_alerts("quiz").expect("open").is_empty());
    }

    #[test]
    fn suppressed_outcome_keeps_alert_open() {
        let (_dir, lifecycle, db) = setup();
        lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("reconcile");
        let resolved = lifecycle
            .auto_resolve(
                "quiz",
                &[outcome(4, RuleVerdict::Suppressed("no data for evaluated day"))],
                Utc::now(),
            )
            .expect("auto resolve");
        assert!(resolved.is_empty());
        assert_eq!(db.list_open_alerts("quiz").expect("open").len(), 1);
    }

    #[test]
    fn resolving_twice_is_an_invalid_transition() {
        let (_dir, lifecycle, _db) = setup();
        let created = lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("reconcile")
            .created;
        let id = created[0].id.clone();

        let resolved = lifecycle.resolve(&id, "ops", Some("fixed copy")).expect("resolve");
        assert_eq!(resolved.resolution_note.as_deref(), Some("fixed copy"));

        let err = lifecycle.resolve(&id, "ops", None).expect_err("second resolve");
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        let after = lifecycle.get(&id).expect("get");
        assert_eq!(after.status, AlertStatus::Resolved);
        assert_eq!(after.resolution_note.as_deref(), Some("fixed copy"));
    }

    #[test]
    fn acknowledge_requires_active() {
        let (_dir, lifecycle, _db) = setup();
        let created = lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("reconcile")
            .created;
        let acknowledged = lifecycle.acknowledge(&created[0].id, "ops").expect("ack");
        assert_eq!(acknowledged.acknowledged_by.as_deref(), Some("ops"));

        let err = lifecycle.acknowledge(&created[0].id, "ops").expect_err("re-ack");
        assert!(err.to_string().starts_with("INVALID_TRANSITION"));
    }

    #[test]
    fn candidate_after_resolution_opens_a_new_alert() {
        let (_dir, lifecycle, _db) = setup();
        let first = lifecycle
            .reconcile("quiz", day(10), &[drop_off(4, 0.31, Severity::Warning)], Utc::now())
            .expect("reconcile")
            .created;
        lifecycle.resolve(&first[0].id, "ops", None).expect("resolve");

        let second = lifecycle
            .reconcile("quiz", day(12), &[drop_off(4, 0.33, Severity::Warning)], Utc::now())
            .expect("reconcile")
            .created;
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].id, first[0].id);
        assert_eq!(lifecycle.get(&first[0].id).expect("old").status, AlertStatus::Resolved);
    }

    #[test]
    fn unknown_alert_is_not_found() {
        let (_dir, lifecycle, _db) = setup();
        let err = lifecycle.acknowledge("missing", "ops").expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
