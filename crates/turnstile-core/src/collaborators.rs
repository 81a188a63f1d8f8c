//! Contracts the scheduler consumes from the outside world.
//!
//! Persistence, authentication and the vehicle's GPS are owned by other
//! layers. The engine only talks to them through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SchedulerError;
use crate::identity::{Credentials, Identity};
use crate::ids::{SessionId, TurnId};
use crate::position::Position;

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Check credentials. Fails with `InvalidCredentials` on mismatch.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, SchedulerError>;

    /// Identity recorded for a logged-in session, or `NotFound`.
    async fn identity_for_session(&self, session_id: &SessionId)
        -> Result<Identity, SchedulerError>;

    /// Persist a login record for a session.
    async fn open_session(
        &self,
        session_id: &SessionId,
        remote_addr: &str,
        identity: &Identity,
    ) -> Result<(), SchedulerError>;

    /// Stamp the logout time on a session's login record.
    async fn close_session(&self, session_id: &SessionId) -> Result<(), SchedulerError>;
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Open a turn and return the identifier the store assigned to it.
    async fn begin(
        &self,
        session_id: &SessionId,
        identity: &Identity,
        started_at: DateTime<Utc>,
    ) -> Result<TurnId, SchedulerError>;

    async fn end(&self, turn_id: TurnId, ended_at: DateTime<Utc>) -> Result<(), SchedulerError>;

    async fn append_telemetry(
        &self,
        turn_id: TurnId,
        position: Position,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Current fix, or `Unavailable` when the vehicle has none.
    async fn current(&self) -> Result<Position, SchedulerError>;
}
