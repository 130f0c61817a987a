mod alerts;
mod metrics;
mod reports;

pub use alerts::AlertRefresh;

use crate::errors::{AppError, AppResult};
use crate::models::{CycleRun, CycleStatus};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Cycle runs ──────────────────────────────────────────────────────────

    pub fn insert_cycle_run(&self, funnel_id: &str, as_of: NaiveDate) -> AppResult<CycleRun> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO cycle_runs (id, funnel_id, as_of, state, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                funnel_id,
                as_of.to_string(),
                CycleStatus::Running.as_str(),
                now.to_rfc3339()
            ],
        )?;
        Ok(CycleRun {
            id,
            funnel_id: funnel_id.to_string(),
            as_of,
            state: CycleStatus::Running,
            started_at: now,
            finished_at: None,
            fetch_attempts: 0,
            records_written: 0,
            alerts_created: 0,
            alerts_refreshed: 0,
            alerts_resolved: 0,
            last_error: None,
        })
    }

    pub fn finish_cycle_run(&self, run: &CycleRun) -> AppResult<()> {
        let finished_at = run.finished_at.unwrap_or_else(Utc::now);
        let conn = self.connection()?;
        conn.execute(
            "UPDATE cycle_runs
             SET state = ?1, finished_at = ?2, fetch_attempts = ?3, records_written = ?4,
                 alerts_created = ?5, alerts_refreshed = ?6, alerts_resolved = ?7, last_error = ?8
             WHERE id = ?9 AND state = 'running'",
            params![
                run.state.as_str(),
                finished_at.to_rfc3339(),
                run.fetch_attempts,
                run.records_written,
                run.alerts_created,
                run.alerts_refreshed,
                run.alerts_resolved,
                run.last_error,
                run.id
            ],
        )?;
        Ok(())
    }

    pub fn list_cycle_runs(&self, funnel_id: &str, limit: u32) -> AppResult<Vec<CycleRun>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, funnel_id, as_of, state, started_at, finished_at, fetch_attempts,
                    records_written, alerts_created, alerts_refreshed, alerts_resolved, last_error
             FROM cycle_runs WHERE funnel_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![funnel_id, limit], |row| {
                Ok(CycleRun {
                    id: row.get(0)?,
                    funnel_id: row.get(1)?,
                    as_of: parse_date(&row.get::<_, String>(2)?)?,
                    state: parse_cycle_status(&row.get::<_, String>(3)?),
                    started_at: parse_time(&row.get::<_, String>(4)?)?,
                    finished_at: row
                        .get::<_, Option<String>>(5)?
                        .map(|raw| parse_time(&raw))
                        .transpose()?,
                    fetch_attempts: row.get(6)?,
                    records_written: row.get(7)?,
                    alerts_created: row.get(8)?,
                    alerts_refreshed: row.get(9)?,
                    alerts_resolved: row.get(10)?,
                    last_error: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_orphan_cycles_interrupted(&self) -> AppResult<u64> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE cycle_runs
             SET state = 'interrupted', finished_at = ?1, last_error = 'Process restarted during cycle'
             WHERE state = 'running'",
            [Utc::now().to_rfc3339()],
        )?;
        Ok(changed as u64)
    }
}

fn parse_cycle_status(raw: &str) -> CycleStatus {
    match raw {
        "running" => CycleStatus::Running,
        "completed" => CycleStatus::Completed,
        "partially_failed" => CycleStatus::PartiallyFailed,
        "skipped" => CycleStatus::Skipped,
        _ => CycleStatus::Interrupted,
    }
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| conversion_error(error.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| conversion_error(error.to_string()))
}
