use chrono::{DateTime, Utc};
use tracing::instrument;
use turnstile_core::{Identity, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::format_ts;
use crate::users::row_to_identity;

/// Login records: who logged in from where, and when they left.
#[derive(Clone)]
pub struct LoginSessionRepo {
    db: Database,
}

impl LoginSessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a login. Re-logging the same session replaces the record.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn open(
        &self,
        session_id: &SessionId,
        user_id: &str,
        ip_address: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let known: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
                [user_id],
                |row| row.get(0),
            )?;
            if !known {
                return Err(StoreError::NotFound(format!("user {user_id}")));
            }
            conn.execute(
                "INSERT OR REPLACE INTO login_sessions (session_id, user_id, ip_address, login_time, logout_time)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                rusqlite::params![session_id.as_str(), user_id, ip_address, format_ts(at)],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn close(&self, session_id: &SessionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE login_sessions SET logout_time = ?1 WHERE session_id = ?2",
                rusqlite::params![format_ts(at), session_id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    /// Identity behind a session that has not logged out.
    pub fn identity(&self, session_id: &SessionId) -> Result<Identity, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.user_id, u.nickname, u.right_flag
                 FROM login_sessions s JOIN users u ON u.user_id = s.user_id
                 WHERE s.session_id = ?1 AND s.logout_time IS NULL",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_identity(row),
                None => Err(StoreError::NotFound(format!("session {session_id}"))),
            }
        })
    }
}
