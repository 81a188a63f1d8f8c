use chrono::{DateTime, Utc};
use tracing::instrument;
use turnstile_core::{Position, TelemetrySample, TurnId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts, parse_ts};

/// GPS samples recorded during drives.
#[derive(Clone)]
pub struct TelemetryRepo {
    db: Database,
}

impl TelemetryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), level = "debug", fields(turn_id = %turn_id))]
    pub fn append(
        &self,
        turn_id: TurnId,
        position: Position,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO gps (drive_id, time, latitude, longitude) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![turn_id.get(), format_ts(at), position.latitude, position.longitude],
            )?;
            Ok(())
        })
    }

    /// All samples of one drive in recording order.
    pub fn for_turn(&self, turn_id: TurnId) -> Result<Vec<TelemetrySample>, StoreError> {
        self.query(
            "SELECT drive_id, time, latitude, longitude FROM gps WHERE drive_id = ?1 ORDER BY time, id",
            &[&turn_id.get()],
        )
    }

    /// Samples of any drive with `begin <= time <= end`.
    pub fn between(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetrySample>, StoreError> {
        self.query(
            "SELECT drive_id, time, latitude, longitude FROM gps
             WHERE time >= ?1 AND time <= ?2 ORDER BY time, id",
            &[&format_ts(begin), &format_ts(end)],
        )
    }

    pub fn count_for_turn(&self, turn_id: TurnId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM gps WHERE drive_id = ?1",
                [turn_id.get()],
                |row| row.get(0),
            )?)
        })
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<TelemetrySample>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                let time: String = row_helpers::get(row, 1, "gps", "time")?;
                samples.push(TelemetrySample {
                    turn_id: TurnId::from_raw(row_helpers::get(row, 0, "gps", "drive_id")?),
                    recorded_at: parse_ts(&time, "gps", "time")?,
                    position: Position::new(
                        row_helpers::get(row, 2, "gps", "latitude")?,
                        row_helpers::get(row, 3, "gps", "longitude")?,
                    ),
                });
            }
            Ok(samples)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::DriveRepo;
    use chrono::{TimeDelta, TimeZone};
    use turnstile_core::SessionId;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
    }

    fn setup() -> (TelemetryRepo, TurnId, TurnId) {
        let db = Database::in_memory().unwrap();
        let drives = DriveRepo::new(db.clone());
        let sid = SessionId::from_raw("s");
        let a = drives.start("alex", &sid, t0()).unwrap();
        let b = drives.start("kim", &sid, t0()).unwrap();
        (TelemetryRepo::new(db), a, b)
    }

    #[test]
    fn samples_grouped_by_turn() {
        let (repo, a, b) = setup();
        let here = Position::new(49.0134, 8.4044);
        for i in 1..=3 {
            repo.append(a, here, t0() + TimeDelta::seconds(10 * i)).unwrap();
        }
        repo.append(b, here, t0() + TimeDelta::seconds(5)).unwrap();

        let samples = repo.for_turn(a).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.turn_id == a && s.position == here));
        assert_eq!(samples[0].recorded_at, t0() + TimeDelta::seconds(10));
        assert_eq!(repo.count_for_turn(b).unwrap(), 1);
    }

    #[test]
    fn between_is_inclusive_window() {
        let (repo, a, b) = setup();
        let here = Position::new(1.0, 2.0);
        repo.append(a, here, t0()).unwrap();
        repo.append(a, here, t0() + TimeDelta::seconds(30)).unwrap();
        repo.append(b, here, t0() + TimeDelta::seconds(60)).unwrap();
        repo.append(b, here, t0() + TimeDelta::seconds(90)).unwrap();

        let window = repo
            .between(t0() + TimeDelta::seconds(30), t0() + TimeDelta::seconds(60))
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].turn_id, a);
        assert_eq!(window[1].turn_id, b);
    }

    #[test]
    fn unknown_drive_rejected_by_foreign_key() {
        let (repo, _, _) = setup();
        assert!(repo
            .append(TurnId::from_raw(404), Position::new(0.0, 0.0), t0())
            .is_err());
    }
}
