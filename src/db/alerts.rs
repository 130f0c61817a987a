use super::{parse_date, parse_json, parse_time, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{Alert, AlertCandidate, AlertStatus, AlertType, ListAlertsFilters, Severity};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

const ALERT_COLUMNS: &str = "id, funnel_id, step_number, alert_type, severity, current_value, previous_day_value,
     seven_day_average, percentage_change, message, status, detected_for, last_seen_for, created_at, updated_at,
     acknowledged_by, acknowledged_at, resolved_by, resolved_at, resolution_note, detail_json";

/// Fields replaced when an open alert is seen again on a later cycle.
#[derive(Debug, Clone)]
pub struct AlertRefresh<'a> {
    pub severity: Severity,
    pub current_value: f64,
    pub previous_day_value: Option<f64>,
    pub seven_day_average: Option<f64>,
    pub percentage_change: Option<f64>,
    pub message: &'a str,
    pub last_seen_for: NaiveDate,
    pub detail: &'a AlertCandidate,
}

impl Database {
    pub fn insert_alert(&self, alert: &Alert) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO alerts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                ALERT_COLUMNS
            ),
            params![
                alert.id,
                alert.funnel_id,
                alert.step_number,
                alert.alert_type.as_str(),
                alert.severity.as_str(),
                alert.current_value,
                alert.previous_day_value,
                alert.seven_day_average,
                alert.percentage_change,
                alert.message,
                alert.status.as_str(),
                alert.detected_for.to_string(),
                alert.last_seen_for.to_string(),
                alert.created_at.to_rfc3339(),
                alert.updated_at.to_rfc3339(),
                alert.acknowledged_by,
                alert.acknowledged_at.map(|at| at.to_rfc3339()),
                alert.resolved_by,
                alert.resolved_at.map(|at| at.to_rfc3339()),
                alert.resolution_note,
                serde_json::to_string(&alert.detail)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_alert(&self, alert_id: &str) -> AppResult<Option<Alert>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
            [alert_id],
            parse_alert_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_open_alerts(&self, funnel_id: &str) -> AppResult<Vec<Alert>> {
        self.list_alerts(&ListAlertsFilters {
            funnel_id: Some(funnel_id.to_string()),
            open_only: Some(true),
            limit: Some(10_000),
            ..ListAlertsFilters::default()
        })
    }

    pub fn list_alerts(&self, filters: &ListAlertsFilters) -> AppResult<Vec<Alert>> {
        let mut query = format!("SELECT {} FROM alerts WHERE 1 = 1", ALERT_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(funnel_id) = &filters.funnel_id {
            query.push_str(" AND funnel_id = ?");
            params_vec.push(funnel_id.clone());
        }
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        if filters.open_only.unwrap_or(false) {
            query.push_str(" AND status IN ('active', 'acknowledged')");
        }

        query.push_str(" ORDER BY created_at DESC, id ASC");
        let limit = filters.limit.unwrap_or(100);
        let offset = filters.offset.unwrap_or(0);
        query.push_str(" LIMIT ? OFFSET ?");

        let conn = self.connection()?;
        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);
        dyn_params.push(&offset);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_alert_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Alerts that were open at some point while `date` was being evaluated.
    pub fn list_alerts_seen_on(&self, funnel_id: &str, date: NaiveDate) -> AppResult<Vec<Alert>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts
             WHERE funnel_id = ?1 AND detected_for <= ?2 AND last_seen_for >= ?2
             ORDER BY created_at ASC, id ASC",
            ALERT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![funnel_id, date.to_string()], parse_alert_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Refreshes an open alert in place. Returns false if the alert is no longer open.
    pub fn refresh_open_alert(&self, alert_id: &str, refresh: &AlertRefresh<'_>) -> AppResult<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE alerts
             SET severity = ?1, current_value = ?2, previous_day_value = ?3, seven_day_average = ?4,
                 percentage_change = ?5, message = ?6, last_seen_for = MAX(last_seen_for, ?7),
                 updated_at = ?8, detail_json = ?9
             WHERE id = ?10 AND status IN ('active', 'acknowledged')",
            params![
                refresh.severity.as_str(),
                refresh.current_value,
                refresh.previous_day_value,
                refresh.seven_day_average,
                refresh.percentage_change,
                refresh.message,
                refresh.last_seen_for.to_string(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(refresh.detail)?,
                alert_id
            ],
        )?;
        Ok(changed == 1)
    }

    /// Compare-and-set on `status`: the update only lands if the stored status
    /// still equals `expected`.
    pub fn transition_alert(
        &self,
        alert_id: &str,
        expected: AlertStatus,
        next: AlertStatus,
        actor: Option<&str>,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let at = at.to_rfc3339();
        let conn = self.connection()?;
        let changed = match next {
            AlertStatus::Acknowledged => conn.execute(
                "UPDATE alerts SET status = ?1, acknowledged_by = ?2, acknowledged_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![next.as_str(), actor, at, alert_id, expected.as_str()],
            )?,
            AlertStatus::Resolved => conn.execute(
                "UPDATE alerts SET status = ?1, resolved_by = ?2, resolved_at = ?3, resolution_note = ?4, updated_at = ?3
                 WHERE id = ?5 AND status = ?6",
                params![next.as_str(), actor, at, note, alert_id, expected.as_str()],
            )?,
            AlertStatus::Active => conn.execute(
                "UPDATE alerts SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![next.as_str(), at, alert_id, expected.as_str()],
            )?,
        };
        Ok(changed == 1)
    }
}

fn parse_alert_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        funnel_id: row.get(1)?,
        step_number: row.get(2)?,
        alert_type: parse_alert_type(&row.get::<_, String>(3)?)?,
        severity: parse_severity(&row.get::<_, String>(4)?),
        current_value: row.get(5)?,
        previous_day_value: row.get(6)?,
        seven_day_average: row.get(7)?,
        percentage_change: row.get(8)?,
        message: row.get(9)?,
        status: parse_alert_status(&row.get::<_, String>(10)?)?,
        detected_for: parse_date(&row.get::<_, String>(11)?)?,
        last_seen_for: parse_date(&row.get::<_, String>(12)?)?,
        created_at: parse_time(&row.get::<_, String>(13)?)?,
        updated_at: parse_time(&row.get::<_, String>(14)?)?,
        acknowledged_by: row.get(15)?,
        acknowledged_at: row
            .get::<_, Option<String>>(16)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        resolved_by: row.get(17)?,
        resolved_at: row
            .get::<_, Option<String>>(18)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        resolution_note: row.get(19)?,
        detail: parse_json::<AlertCandidate>(&row.get::<_, String>(20)?)?,
    })
}

fn parse_alert_type(raw: &str) -> rusqlite::Result<AlertType> {
    match raw {
        "drop_off" => Ok(AlertType::DropOff),
        "conversion" => Ok(AlertType::Conversion),
        "volume" => Ok(AlertType::Volume),
        "step_anomaly" => Ok(AlertType::StepAnomaly),
        other => Err(super::conversion_error(format!("Unknown alert type '{}'", other))),
    }
}

fn parse_severity(raw: &str) -> Severity {
    match raw {
        "critical" => Severity::Critical,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

fn parse_alert_status(raw: &str) -> rusqlite::Result<AlertStatus> {
    match raw {
        "active" => Ok(AlertStatus::Active),
        "acknowledged" => Ok(AlertStatus::Acknowledged),
        "resolved" => Ok(AlertStatus::Resolved),
        other => Err(super::conversion_error(format!("Unknown alert status '{}'", other))),
    }
}
