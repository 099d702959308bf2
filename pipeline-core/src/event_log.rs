//! Append-only archive of run events, keyed by alert id.

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    RunStarted,
    StageCompleted,
    TicketCreated,
    NoTicket,
    RunCompleted,
    RunFailed,
}

impl EventType {
    fn is_terminal(&self) -> bool {
        matches!(self, EventType::RunCompleted | EventType::RunFailed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub alert_id: String,
    pub run_id: String,
    pub event_type: EventType,
    pub description: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("event log sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("event log encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A run that was started but never reached a terminal event, usually
/// because the process stopped mid-run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnfinishedRun {
    pub alert_id: String,
    pub run_id: String,
}

#[derive(Clone)]
pub struct EventLog {
    db_path: Arc<PathBuf>,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                description TEXT NOT NULL,
                details TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_events_alert ON run_events(alert_id);
            CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);
            ",
        )?;

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn append(&self, event: &Event) -> Result<i64, EventLogError> {
        let conn = Connection::open(&*self.db_path)?;
        let event_type = serde_json::to_string(&event.event_type)?;
        let details = event.details.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO run_events (alert_id, run_id, event_type, description, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.alert_id,
                event.run_id,
                event_type,
                event.description,
                details,
                event.timestamp,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn events_for_alert(&self, alert_id: &str) -> Result<Vec<Event>, EventLogError> {
        self.query(
            "SELECT id, alert_id, run_id, event_type, description, details, timestamp
             FROM run_events
             WHERE alert_id = ?1
             ORDER BY id ASC",
            alert_id,
        )
    }

    pub fn events_for_run(&self, run_id: &str) -> Result<Vec<Event>, EventLogError> {
        self.query(
            "SELECT id, alert_id, run_id, event_type, description, details, timestamp
             FROM run_events
             WHERE run_id = ?1
             ORDER BY id ASC",
            run_id,
        )
    }

    pub fn unfinished_runs(&self) -> Result<Vec<UnfinishedRun>, EventLogError> {
        let conn = Connection::open(&*self.db_path)?;
        let terminal: Vec<String> = [EventType::RunCompleted, EventType::RunFailed]
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT alert_id, run_id
             FROM run_events
             GROUP BY run_id
             HAVING SUM(CASE WHEN event_type IN (?1, ?2) THEN 1 ELSE 0 END) = 0
             ORDER BY MIN(id) ASC",
        )?;
        let rows = stmt.query_map(params![terminal[0], terminal[1]], |row| {
            Ok(UnfinishedRun {
                alert_id: row.get(0)?,
                run_id: row.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query(&self, sql: &str, key: &str) -> Result<Vec<Event>, EventLogError> {
        let conn = Connection::open(&*self.db_path)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![key], map_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

/// True when the run's events end in a terminal event.
pub fn is_finished(events: &[Event]) -> bool {
    events.last().is_some_and(|e| e.event_type.is_terminal())
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type_str: String = row.get(3)?;
    let details_str: Option<String> = row.get(5)?;

    let event_type: EventType = serde_json::from_str(&event_type_str).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;

    let details = details_str
        .map(|s| {
            serde_json::from_str(&s).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
            })
        })
        .transpose()?;

    Ok(Event {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        run_id: row.get(2)?,
        event_type,
        description: row.get(4)?,
        details,
        timestamp: row.get(6)?,
    })
}
