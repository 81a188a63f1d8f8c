//! SQLite-backed implementations of the engine's collaborator traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use turnstile_core::{
    Credentials, Identity, IdentityStore, Position, SchedulerError, SessionId, TurnId, TurnStore,
};

use crate::database::Database;
use crate::drives::DriveRepo;
use crate::error::StoreError;
use crate::login_sessions::LoginSessionRepo;
use crate::telemetry::TelemetryRepo;
use crate::users::UserRepo;

/// Every trait call runs on tokio's blocking pool, so a busy database
/// never stalls the executor and callers can time the call out.
#[derive(Clone)]
pub struct SqliteStore {
    users: UserRepo,
    logins: LoginSessionRepo,
    drives: DriveRepo,
    telemetry: TelemetryRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            logins: LoginSessionRepo::new(db.clone()),
            drives: DriveRepo::new(db.clone()),
            telemetry: TelemetryRepo::new(db),
        }
    }

    pub fn users(&self) -> &UserRepo {
        &self.users
    }

    pub fn drives(&self) -> &DriveRepo {
        &self.drives
    }

    pub fn telemetry(&self) -> &TelemetryRepo {
        &self.telemetry
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("store task failed: {e}")))?
            .map_err(SchedulerError::from)
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, SchedulerError> {
        let Credentials {
            login_name,
            password,
        } = credentials.clone();
        self.blocking(move |s| s.users.login(&login_name, &password))
            .await?
            .ok_or(SchedulerError::InvalidCredentials)
    }

    async fn identity_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Identity, SchedulerError> {
        let session_id = session_id.clone();
        self.blocking(move |s| s.logins.identity(&session_id)).await
    }

    async fn open_session(
        &self,
        session_id: &SessionId,
        remote_addr: &str,
        identity: &Identity,
    ) -> Result<(), SchedulerError> {
        let session_id = session_id.clone();
        let remote_addr = remote_addr.to_string();
        let user_id = identity.user_id.clone();
        self.blocking(move |s| s.logins.open(&session_id, &user_id, &remote_addr, Utc::now()))
            .await
    }

    async fn close_session(&self, session_id: &SessionId) -> Result<(), SchedulerError> {
        let session_id = session_id.clone();
        self.blocking(move |s| s.logins.close(&session_id, Utc::now()))
            .await
    }
}

#[async_trait]
impl TurnStore for SqliteStore {
    async fn begin(
        &self,
        session_id: &SessionId,
        identity: &Identity,
        started_at: DateTime<Utc>,
    ) -> Result<TurnId, SchedulerError> {
        let session_id = session_id.clone();
        let user_id = identity.user_id.clone();
        self.blocking(move |s| s.drives.start(&user_id, &session_id, started_at))
            .await
    }

    async fn end(&self, turn_id: TurnId, ended_at: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.blocking(move |s| s.drives.stop(turn_id, ended_at)).await
    }

    async fn append_telemetry(
        &self,
        turn_id: TurnId,
        position: Position,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.blocking(move |s| s.telemetry.append(turn_id, position, recorded_at))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use turnstile_core::Right;

    fn store() -> SqliteStore {
        let store = SqliteStore::new(Database::in_memory().unwrap());
        store.users().create("alex", Some("Alex"), "pw", Right::User).unwrap();
        store
    }

    fn creds(login: &str, pw: &str) -> Credentials {
        Credentials {
            login_name: login.into(),
            password: pw.into(),
        }
    }

    #[tokio::test]
    async fn authenticate_maps_mismatch_to_invalid_credentials() {
        let store = store();
        let identity = store.authenticate(&creds("alex", "pw")).await.unwrap();
        assert_eq!(identity.nickname, "Alex");
        assert_eq!(
            store.authenticate(&creds("alex", "nope")).await,
            Err(SchedulerError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn session_identity_lifecycle() {
        let store = store();
        let sid = SessionId::from_raw("s1");
        let identity = store.authenticate(&creds("alex", "pw")).await.unwrap();

        store.open_session(&sid, "127.0.0.1", &identity).await.unwrap();
        assert_eq!(store.identity_for_session(&sid).await.unwrap(), identity);

        store.close_session(&sid).await.unwrap();
        assert!(matches!(
            store.identity_for_session(&sid).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn turn_lifecycle_with_telemetry() {
        let store = store();
        let sid = SessionId::from_raw("s1");
        let identity = Identity::new("alex", "Alex", Right::User);
        let start = Utc::now();

        let turn = store.begin(&sid, &identity, start).await.unwrap();
        store
            .append_telemetry(turn, Position::new(1.0, 2.0), start + TimeDelta::seconds(10))
            .await
            .unwrap();
        store.end(turn, start + TimeDelta::minutes(1)).await.unwrap();

        assert!(!store.drives().get(turn).unwrap().is_open());
        assert_eq!(store.telemetry().count_for_turn(turn).unwrap(), 1);
        assert!(store.end(turn, start).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn locked_database_does_not_block_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turnstile.db");
        let store = SqliteStore::new(Database::open(&path).unwrap());
        store.users().create("alex", None, "pw", Right::User).unwrap();

        let locker = rusqlite::Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let identity = Identity::new("alex", "alex", Right::User);
        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.begin(&SessionId::from_raw("s1"), &identity, Utc::now()),
        )
        .await;
        assert!(attempt.is_err(), "begin should still be waiting on the lock");

        locker.execute_batch("ROLLBACK").unwrap();
        let turn = store
            .begin(&SessionId::from_raw("s2"), &identity, Utc::now())
            .await
            .unwrap();
        assert!(store.drives().get(turn).unwrap().is_open());
    }
}
