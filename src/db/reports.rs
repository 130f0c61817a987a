use super::{parse_date, parse_json, parse_time, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{DailyReport, ReportDraft};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

impl Database {
    /// One row per funnel and date: re-running replaces the computed fields and
    /// the alert references but keeps the row's identity and delivery status.
    pub fn upsert_daily_report(&self, draft: &ReportDraft) -> AppResult<DailyReport> {
        let now = Utc::now().to_rfc3339();
        let report_date = draft.report_date.to_string();

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO daily_reports (
               id, funnel_id, report_date, summary_json, steps_json, top_steps_json, bottom_steps_json,
               hotspot_json, insights_json, created_at, updated_at, sent, delivered_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 0, NULL)
             ON CONFLICT (funnel_id, report_date) DO UPDATE SET
               summary_json = excluded.summary_json,
               steps_json = excluded.steps_json,
               top_steps_json = excluded.top_steps_json,
               bottom_steps_json = excluded.bottom_steps_json,
               hotspot_json = excluded.hotspot_json,
               insights_json = excluded.insights_json,
               updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                draft.funnel_id,
                report_date,
                serde_json::to_string(&draft.summary)?,
                serde_json::to_string(&draft.steps)?,
                serde_json::to_string(&draft.top_steps)?,
                serde_json::to_string(&draft.bottom_steps)?,
                draft.hotspot.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&draft.insights)?,
                now
            ],
        )?;

        let report_id: String = tx.query_row(
            "SELECT id FROM daily_reports WHERE funnel_id = ?1 AND report_date = ?2",
            params![draft.funnel_id, report_date],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM report_alerts WHERE report_id = ?1", [&report_id])?;
        for alert_id in &draft.alert_ids {
            tx.execute(
                "INSERT OR IGNORE INTO report_alerts (report_id, alert_id) VALUES (?1, ?2)",
                params![report_id, alert_id],
            )?;
        }
        tx.commit()?;
        drop(conn);

        self.get_daily_report(&draft.funnel_id, draft.report_date)?
            .ok_or_else(|| AppError::Internal(format!("report {} vanished after upsert", report_id)))
    }

    pub fn get_daily_report(&self, funnel_id: &str, report_date: NaiveDate) -> AppResult<Option<DailyReport>> {
        let conn = self.connection()?;
        let report = conn
            .query_row(
                "SELECT id, funnel_id, report_date, summary_json, steps_json, top_steps_json, bottom_steps_json,
                        hotspot_json, insights_json, created_at, updated_at, sent, delivered_at
                 FROM daily_reports WHERE funnel_id = ?1 AND report_date = ?2",
                params![funnel_id, report_date.to_string()],
                parse_report_row,
            )
            .optional()?;

        let Some(mut report) = report else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT alert_id FROM report_alerts WHERE report_id = ?1 ORDER BY alert_id ASC",
        )?;
        report.alert_ids = stmt
            .query_map([&report.id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(report))
    }

    pub fn count_daily_reports(&self, funnel_id: &str) -> AppResult<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM daily_reports WHERE funnel_id = ?1",
            [funnel_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn mark_report_delivered(&self, report_id: &str, delivered_at: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE daily_reports SET sent = 1, delivered_at = ?1 WHERE id = ?2",
            params![delivered_at.to_rfc3339(), report_id],
        )?;
        Ok(changed == 1)
    }
}

fn parse_report_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyReport> {
    Ok(DailyReport {
        id: row.get(0)?,
        funnel_id: row.get(1)?,
        report_date: parse_date(&row.get::<_, String>(2)?)?,
        summary: parse_json(&row.get::<_, String>(3)?)?,
        steps: parse_json(&row.get::<_, String>(4)?)?,
        top_steps: parse_json(&row.get::<_, String>(5)?)?,
        bottom_steps: parse_json(&row.get::<_, String>(6)?)?,
        hotspot: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_json(&raw))
            .transpose()?,
        alert_ids: Vec::new(),
        insights: parse_json(&row.get::<_, String>(8)?)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
        sent: row.get::<_, i32>(11)? != 0,
        delivered_at: row
            .get::<_, Option<String>>(12)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}
