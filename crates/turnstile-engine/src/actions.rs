//! Inbound session actions.
//!
//! The transport layer decodes each client message into a [`Request`] and
//! hands it to [`ActionDispatcher::dispatch`]. Only the actions listed in
//! [`Action`] exist; anything else fails to decode.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use turnstile_core::{
    Clock, Credentials, DriveConfig, Identity, IdentityStore, SchedulerError, SessionId,
};

use crate::error::EngineError;
use crate::queue::{Enqueued, WaitingQueue};
use crate::registry::SessionRegistry;
use crate::scheduler::{bounded, SchedulerHandle, TurnInfo};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub session_id: SessionId,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    Login(Credentials),
    WatchDriver,
    Enqueue,
    Dequeue,
    Logout,
    Status,
    /// Admin only.
    ForceEnd,
    /// Admin only.
    Refresh { config: DriveConfig },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login(_) => "login",
            Self::WatchDriver => "watchDriver",
            Self::Enqueue => "enqueue",
            Self::Dequeue => "dequeue",
            Self::Logout => "logout",
            Self::Status => "status",
            Self::ForceEnd => "forceEnd",
            Self::Refresh { .. } => "refresh",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome {
    LoggedIn {
        identity: Identity,
    },
    Watching {
        identity: Identity,
    },
    Queued {
        position: usize,
        #[serde(rename = "alreadyQueued")]
        already_queued: bool,
    },
    Dequeued {
        removed: bool,
    },
    LoggedOut,
    Status(StatusReport),
    TurnEnding {
        ended: bool,
    },
    ConfigStaged {
        config: DriveConfig,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// `idle` or `active`.
    pub phase: &'static str,
    pub queue_length: usize,
    /// 1-based position of the asking session, when queued.
    pub position: Option<usize>,
    pub current_turn: Option<TurnInfo>,
    pub sessions: usize,
}

pub struct ActionDispatcher {
    identities: Arc<dyn IdentityStore>,
    queue: Arc<WaitingQueue>,
    registry: Arc<SessionRegistry>,
    scheduler: SchedulerHandle,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        queue: Arc<WaitingQueue>,
        registry: Arc<SessionRegistry>,
        scheduler: SchedulerHandle,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            identities,
            queue,
            registry,
            scheduler,
            clock,
            call_timeout,
        }
    }

    #[instrument(
        skip(self, request),
        fields(session_id = %request.session_id, action = request.action.name())
    )]
    pub async fn dispatch(&self, request: Request) -> Result<Outcome, EngineError> {
        let Request {
            session_id,
            remote_addr,
            action,
        } = request;

        match action {
            Action::Login(credentials) => self.login(session_id, remote_addr, credentials).await,
            Action::WatchDriver => {
                let identity = Identity::guest(self.clock.now());
                self.registry
                    .insert(session_id, remote_addr, identity.clone(), self.clock.now());
                Ok(Outcome::Watching { identity })
            }
            Action::Enqueue => self.enqueue(&session_id, &remote_addr).await,
            Action::Dequeue => Ok(Outcome::Dequeued {
                removed: self.queue.dequeue(&session_id),
            }),
            Action::Logout => self.logout(&session_id).await,
            Action::Status => Ok(Outcome::Status(self.status(&session_id))),
            Action::ForceEnd => {
                self.require_admin(&session_id, &remote_addr).await?;
                Ok(Outcome::TurnEnding {
                    ended: self.scheduler.force_end(),
                })
            }
            Action::Refresh { config } => {
                self.require_admin(&session_id, &remote_addr).await?;
                self.scheduler.refresh(config)?;
                Ok(Outcome::ConfigStaged { config })
            }
        }
    }

    async fn login(
        &self,
        session_id: SessionId,
        remote_addr: String,
        credentials: Credentials,
    ) -> Result<Outcome, EngineError> {
        let identity =
            bounded(self.call_timeout, self.identities.authenticate(&credentials)).await?;
        self.registry.insert(
            session_id.clone(),
            remote_addr.clone(),
            identity.clone(),
            self.clock.now(),
        );
        if let Err(e) = bounded(
            self.call_timeout,
            self.identities
                .open_session(&session_id, &remote_addr, &identity),
        )
        .await
        {
            warn!(error = %e, "failed to persist login record");
        }
        info!(user_id = %identity.user_id, right = %identity.right, "session logged in");
        Ok(Outcome::LoggedIn { identity })
    }

    async fn enqueue(
        &self,
        session_id: &SessionId,
        remote_addr: &str,
    ) -> Result<Outcome, EngineError> {
        let identity = self.resolve(session_id, remote_addr).await?;
        if identity.is_guest() {
            return Err(SchedulerError::PermissionDenied("guests cannot queue".into()).into());
        }
        let outcome = self.queue.enqueue(session_id, self.clock.now())?;
        info!(
            user_id = %identity.user_id,
            position = outcome.position(),
            queue_length = self.queue.len(),
            "queued for a turn"
        );
        Ok(Outcome::Queued {
            position: outcome.position(),
            already_queued: matches!(outcome, Enqueued::AlreadyQueued { .. }),
        })
    }

    async fn logout(&self, session_id: &SessionId) -> Result<Outcome, EngineError> {
        let known = self.registry.entry(session_id);
        self.queue.dequeue(session_id);
        self.registry.delete(session_id);

        let persisted = known.as_ref().is_some_and(|e| !e.identity.is_guest());
        if persisted {
            match bounded(self.call_timeout, self.identities.close_session(session_id)).await {
                Ok(()) | Err(SchedulerError::NotFound(_)) => {}
                Err(e) => warn!(error = %e, "failed to persist logout"),
            }
        }
        Ok(Outcome::LoggedOut)
    }

    fn status(&self, session_id: &SessionId) -> StatusReport {
        let current_turn = self.scheduler.current_turn();
        StatusReport {
            phase: if current_turn.is_some() { "active" } else { "idle" },
            queue_length: self.queue.len(),
            position: self.queue.position(session_id),
            current_turn,
            sessions: self.registry.len(),
        }
    }

    /// Registry first. A session the registry forgot, for example after a
    /// restart, is looked up in the identity store and re-registered.
    async fn resolve(
        &self,
        session_id: &SessionId,
        remote_addr: &str,
    ) -> Result<Identity, EngineError> {
        if let Ok(identity) = self.registry.lookup(session_id) {
            return Ok(identity);
        }
        let identity = bounded(
            self.call_timeout,
            self.identities.identity_for_session(session_id),
        )
        .await?;
        self.registry.insert(
            session_id.clone(),
            remote_addr,
            identity.clone(),
            self.clock.now(),
        );
        Ok(identity)
    }

    async fn require_admin(
        &self,
        session_id: &SessionId,
        remote_addr: &str,
    ) -> Result<Identity, EngineError> {
        let identity = self.resolve(session_id, remote_addr).await?;
        if !identity.is_admin() {
            return Err(SchedulerError::PermissionDenied("admin only".into()).into());
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockIdentityStore, MockTurnStore};
    use crate::scheduler::{DriveScheduler, SchedulerOptions};
    use chrono::{TimeZone, Utc};
    use turnstile_core::{ManualClock, Right};

    struct Harness {
        dispatcher: ActionDispatcher,
        scheduler: DriveScheduler,
        queue: Arc<WaitingQueue>,
        registry: Arc<SessionRegistry>,
        identities: Arc<MockIdentityStore>,
    }

    impl Harness {
        fn new() -> Self {
            let queue = Arc::new(WaitingQueue::with_max_depth(Some(3)));
            let registry = Arc::new(SessionRegistry::new());
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
            ));
            let identities = Arc::new(
                MockIdentityStore::new()
                    .with_user("alex", "pw", Identity::new("alex", "Alex", Right::User))
                    .with_user("kim", "pw", Identity::new("kim", "Kim", Right::User))
                    .with_user("root", "pw", Identity::new("root", "Root", Right::Admin)),
            );
            let scheduler = DriveScheduler::new(
                DriveConfig::new(1, 10),
                SchedulerOptions::default(),
                queue.clone(),
                registry.clone(),
                Arc::new(MockTurnStore::new()),
                clock.clone(),
            );
            let dispatcher = ActionDispatcher::new(
                identities.clone(),
                queue.clone(),
                registry.clone(),
                scheduler.handle(),
                clock,
                Duration::from_secs(5),
            );
            Self {
                dispatcher,
                scheduler,
                queue,
                registry,
                identities,
            }
        }

        async fn send(&self, session: &str, action: Action) -> Result<Outcome, EngineError> {
            self.dispatcher
                .dispatch(Request {
                    session_id: SessionId::from_raw(session),
                    remote_addr: "10.0.0.7".into(),
                    action,
                })
                .await
        }

        async fn login(&self, session: &str, user: &str) {
            self.send(
                session,
                Action::Login(Credentials {
                    login_name: user.into(),
                    password: "pw".into(),
                }),
            )
            .await
            .unwrap();
        }
    }

    fn denied(result: Result<Outcome, EngineError>) -> bool {
        matches!(
            result,
            Err(EngineError::Scheduler(SchedulerError::PermissionDenied(_)))
        )
    }

    #[test]
    fn requests_decode_from_tagged_json() {
        let request: Request = serde_json::from_str(
            r#"{"sessionId":"s1","action":"login","loginName":"alex","password":"pw"}"#,
        )
        .unwrap();
        assert_eq!(request.session_id.as_str(), "s1");
        assert_eq!(request.remote_addr, "");
        assert!(matches!(request.action, Action::Login(ref c) if c.login_name == "alex"));

        let refresh: Request = serde_json::from_str(
            r#"{"sessionId":"s1","action":"refresh","config":{"turnDurationMinutes":2}}"#,
        )
        .unwrap();
        assert!(matches!(
            refresh.action,
            Action::Refresh { config } if config == DriveConfig::new(2, 10)
        ));

        assert!(serde_json::from_str::<Request>(r#"{"sessionId":"s1","action":"jump"}"#).is_err());
    }

    #[tokio::test]
    async fn login_registers_and_persists_session() {
        let h = Harness::new();
        let outcome = h
            .send(
                "s1",
                Action::Login(Credentials {
                    login_name: "alex".into(),
                    password: "pw".into(),
                }),
            )
            .await
            .unwrap();

        let sid = SessionId::from_raw("s1");
        assert!(matches!(outcome, Outcome::LoggedIn { ref identity } if identity.user_id == "alex"));
        assert_eq!(h.registry.lookup(&sid).unwrap().nickname, "Alex");
        assert!(h.identities.has_open_session(&sid));
    }

    #[tokio::test]
    async fn bad_password_leaves_registry_untouched() {
        let h = Harness::new();
        let result = h
            .send(
                "s1",
                Action::Login(Credentials {
                    login_name: "alex".into(),
                    password: "wrong".into(),
                }),
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Scheduler(SchedulerError::InvalidCredentials))
        ));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn guests_watch_but_cannot_queue() {
        let h = Harness::new();
        let outcome = h.send("g1", Action::WatchDriver).await.unwrap();
        assert!(matches!(outcome, Outcome::Watching { ref identity } if identity.is_guest()));

        assert!(denied(h.send("g1", Action::Enqueue).await));
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_cannot_queue() {
        let h = Harness::new();
        let result = h.send("nobody", Action::Enqueue).await;
        assert!(matches!(
            result,
            Err(EngineError::Scheduler(SchedulerError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_and_reports_position() {
        let h = Harness::new();
        h.login("s1", "alex").await;
        h.login("s2", "kim").await;

        assert_eq!(
            h.send("s1", Action::Enqueue).await.unwrap(),
            Outcome::Queued { position: 1, already_queued: false }
        );
        assert_eq!(
            h.send("s2", Action::Enqueue).await.unwrap(),
            Outcome::Queued { position: 2, already_queued: false }
        );
        assert_eq!(
            h.send("s1", Action::Enqueue).await.unwrap(),
            Outcome::Queued { position: 1, already_queued: true }
        );
        assert_eq!(h.queue.len(), 2);
    }

    #[tokio::test]
    async fn queue_capacity_surfaces_as_error() {
        let h = Harness::new();
        for i in 0..3 {
            let sid = format!("s{i}");
            h.login(&sid, "alex").await;
            h.send(&sid, Action::Enqueue).await.unwrap();
        }
        h.login("s9", "kim").await;
        let result = h.send("s9", Action::Enqueue).await;
        assert!(matches!(
            result,
            Err(EngineError::Scheduler(SchedulerError::CapacityExceeded { limit: 3 }))
        ));
    }

    #[tokio::test]
    async fn forgotten_session_is_recovered_from_identity_store() {
        let h = Harness::new();
        h.login("s1", "alex").await;
        h.registry.delete_all();

        h.send("s1", Action::Enqueue).await.unwrap();
        assert_eq!(
            h.registry.lookup(&SessionId::from_raw("s1")).unwrap().user_id,
            "alex"
        );
    }

    #[tokio::test]
    async fn logout_removes_session_everywhere() {
        let h = Harness::new();
        h.login("s1", "alex").await;
        h.send("s1", Action::Enqueue).await.unwrap();

        assert_eq!(h.send("s1", Action::Logout).await.unwrap(), Outcome::LoggedOut);
        let sid = SessionId::from_raw("s1");
        assert!(h.queue.is_empty());
        assert!(h.registry.lookup(&sid).is_err());
        assert!(!h.identities.has_open_session(&sid));

        // second logout is harmless
        assert_eq!(h.send("s1", Action::Logout).await.unwrap(), Outcome::LoggedOut);
    }

    #[tokio::test]
    async fn dequeue_reports_whether_anything_was_removed() {
        let h = Harness::new();
        h.login("s1", "alex").await;
        h.send("s1", Action::Enqueue).await.unwrap();
        assert_eq!(
            h.send("s1", Action::Dequeue).await.unwrap(),
            Outcome::Dequeued { removed: true }
        );
        assert_eq!(
            h.send("s1", Action::Dequeue).await.unwrap(),
            Outcome::Dequeued { removed: false }
        );
    }

    #[tokio::test]
    async fn status_shows_position_and_current_turn() {
        let mut h = Harness::new();
        h.login("s1", "alex").await;
        h.login("s2", "kim").await;
        h.send("s1", Action::Enqueue).await.unwrap();
        h.send("s2", Action::Enqueue).await.unwrap();
        h.scheduler.tick().await;

        let Outcome::Status(report) = h.send("s2", Action::Status).await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(report.phase, "active");
        assert_eq!(report.queue_length, 1);
        assert_eq!(report.position, Some(1));
        assert_eq!(report.sessions, 2);
        assert_eq!(report.current_turn.unwrap().identity.user_id, "alex");
    }

    #[tokio::test]
    async fn admin_actions_require_admin() {
        let mut h = Harness::new();
        h.login("s1", "alex").await;
        h.login("root", "root").await;
        h.send("s1", Action::Enqueue).await.unwrap();
        h.scheduler.tick().await;

        assert!(denied(h.send("s1", Action::ForceEnd).await));
        assert!(denied(
            h.send("s1", Action::Refresh { config: DriveConfig::new(3, 5) }).await
        ));

        assert_eq!(
            h.send("root", Action::ForceEnd).await.unwrap(),
            Outcome::TurnEnding { ended: true }
        );
        assert_eq!(
            h.send("root", Action::Refresh { config: DriveConfig::new(3, 5) })
                .await
                .unwrap(),
            Outcome::ConfigStaged { config: DriveConfig::new(3, 5) }
        );
        assert!(matches!(
            h.send("root", Action::Refresh { config: DriveConfig::new(0, 5) }).await,
            Err(EngineError::Settings(_))
        ));
    }
}
