use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use turnstile_core::{SessionId, TurnId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts, parse_ts};

/// A persisted drive turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriveRow {
    pub turn_id: TurnId,
    pub user_id: String,
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl DriveRow {
    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }
}

#[derive(Clone)]
pub struct DriveRepo {
    db: Database,
}

const DRIVE_COLUMNS: &str = "drive_id, user_id, session_id, start_time, stop_time";

impl DriveRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a drive and return the id the database assigned.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn start(
        &self,
        user_id: &str,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<TurnId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drives (user_id, session_id, start_time) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, session_id.as_str(), format_ts(at)],
            )?;
            Ok(TurnId::from_raw(conn.last_insert_rowid()))
        })
    }

    /// Stamp the stop time. Stopping an already stopped drive is a conflict.
    #[instrument(skip(self), fields(turn_id = %turn_id))]
    pub fn stop(&self, turn_id: TurnId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE drives SET stop_time = ?1 WHERE drive_id = ?2 AND stop_time IS NULL",
                rusqlite::params![format_ts(at), turn_id.get()],
            )?;
            if updated == 1 {
                return Ok(());
            }
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM drives WHERE drive_id = ?1)",
                [turn_id.get()],
                |row| row.get(0),
            )?;
            if exists {
                Err(StoreError::Conflict(format!("drive {turn_id} already stopped")))
            } else {
                Err(StoreError::NotFound(format!("drive {turn_id}")))
            }
        })
    }

    pub fn get(&self, turn_id: TurnId) -> Result<DriveRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {DRIVE_COLUMNS} FROM drives WHERE drive_id = ?1"))?;
            let mut rows = stmt.query([turn_id.get()])?;
            match rows.next()? {
                Some(row) => row_to_drive(row),
                None => Err(StoreError::NotFound(format!("drive {turn_id}"))),
            }
        })
    }

    /// Drives without a stop time, oldest first.
    pub fn open_drives(&self) -> Result<Vec<DriveRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DRIVE_COLUMNS} FROM drives WHERE stop_time IS NULL ORDER BY drive_id"
            ))?;
            let mut rows = stmt.query([])?;
            let mut drives = Vec::new();
            while let Some(row) = rows.next()? {
                drives.push(row_to_drive(row)?);
            }
            Ok(drives)
        })
    }

    /// Close drives left open by a previous process. Returns how many were closed.
    pub fn close_dangling(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let closed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE drives SET stop_time = ?1 WHERE stop_time IS NULL",
                [format_ts(at)],
            )?)
        })?;
        if closed > 0 {
            info!(closed, "closed drives left open by a previous run");
        }
        Ok(closed)
    }
}

fn row_to_drive(row: &rusqlite::Row<'_>) -> Result<DriveRow, StoreError> {
    let start: String = row_helpers::get(row, 3, "drives", "start_time")?;
    let stop: Option<String> = row_helpers::get(row, 4, "drives", "stop_time")?;
    Ok(DriveRow {
        turn_id: TurnId::from_raw(row_helpers::get(row, 0, "drives", "drive_id")?),
        user_id: row_helpers::get(row, 1, "drives", "user_id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 2, "drives", "session_id")?),
        started_at: parse_ts(&start, "drives", "start_time")?,
        stopped_at: stop
            .map(|s| parse_ts(&s, "drives", "stop_time"))
            .transpose()?,
    })
}
