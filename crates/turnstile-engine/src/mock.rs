//! In-memory collaborators for deterministic tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use turnstile_core::{
    Credentials, Identity, IdentityStore, Position, SchedulerError, SessionId, TurnId, TurnStore,
};

/// A turn as the mock store saw it.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedTurn {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Turn store that keeps everything in memory and can be told to fail.
pub struct MockTurnStore {
    next_id: AtomicI64,
    turns: Mutex<Vec<RecordedTurn>>,
    samples: Mutex<Vec<(TurnId, Position, DateTime<Utc>)>>,
    failing_begins: AtomicUsize,
    failing_appends: AtomicBool,
    failing_ends: AtomicBool,
    panicking_begins: AtomicUsize,
    panicking_ends: AtomicUsize,
    begin_delay: Mutex<Option<Duration>>,
    end_delay: Mutex<Option<Duration>>,
}

impl MockTurnStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            turns: Mutex::new(Vec::new()),
            samples: Mutex::new(Vec::new()),
            failing_begins: AtomicUsize::new(0),
            failing_appends: AtomicBool::new(false),
            failing_ends: AtomicBool::new(false),
            panicking_begins: AtomicUsize::new(0),
            panicking_ends: AtomicUsize::new(0),
            begin_delay: Mutex::new(None),
            end_delay: Mutex::new(None),
        }
    }

    /// The next `n` calls to `begin` fail with `Unavailable`.
    pub fn fail_next_begins(&self, n: usize) {
        self.failing_begins.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to `begin` panic.
    pub fn panic_next_begins(&self, n: usize) {
        self.panicking_begins.store(n, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.failing_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ends(&self, fail: bool) {
        self.failing_ends.store(fail, Ordering::SeqCst);
    }

    /// The next `n` calls to `end` panic.
    pub fn panic_next_ends(&self, n: usize) {
        self.panicking_ends.store(n, Ordering::SeqCst);
    }

    /// Make `begin` sleep before answering.
    pub fn delay_begins(&self, delay: Duration) {
        *self.begin_delay.lock() = Some(delay);
    }

    pub fn delay_ends(&self, delay: Duration) {
        *self.end_delay.lock() = Some(delay);
    }

    pub fn turns(&self) -> Vec<RecordedTurn> {
        self.turns.lock().clone()
    }

    pub fn samples(&self) -> Vec<(TurnId, Position, DateTime<Utc>)> {
        self.samples.lock().clone()
    }

    pub fn samples_for(&self, turn_id: TurnId) -> usize {
        self.samples.lock().iter().filter(|(t, _, _)| *t == turn_id).count()
    }

    /// Turns begun and not yet ended.
    pub fn open_turns(&self) -> usize {
        self.turns.lock().iter().filter(|t| t.ended_at.is_none()).count()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockTurnStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TurnStore for MockTurnStore {
    async fn begin(
        &self,
        session_id: &SessionId,
        identity: &Identity,
        started_at: DateTime<Utc>,
    ) -> Result<TurnId, SchedulerError> {
        let delay = *self.begin_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_one(&self.panicking_begins) {
            panic!("mock begin panicked");
        }
        if Self::take_one(&self.failing_begins) {
            return Err(SchedulerError::Unavailable("mock begin failure".into()));
        }
        let turn_id = TurnId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.turns.lock().push(RecordedTurn {
            turn_id,
            session_id: session_id.clone(),
            user_id: identity.user_id.clone(),
            started_at,
            ended_at: None,
        });
        Ok(turn_id)
    }

    async fn end(&self, turn_id: TurnId, ended_at: DateTime<Utc>) -> Result<(), SchedulerError> {
        let delay = *self.end_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_one(&self.panicking_ends) {
            panic!("mock end panicked");
        }
        if self.failing_ends.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("mock end failure".into()));
        }
        let mut turns = self.turns.lock();
        let turn = turns
            .iter_mut()
            .find(|t| t.turn_id == turn_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("turn {turn_id}")))?;
        turn.ended_at = Some(ended_at);
        Ok(())
    }

    async fn append_telemetry(
        &self,
        turn_id: TurnId,
        position: Position,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if self.failing_appends.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("mock append failure".into()));
        }
        self.samples.lock().push((turn_id, position, recorded_at));
        Ok(())
    }
}

/// Identity store backed by a fixed user table.
pub struct MockIdentityStore {
    users: HashMap<String, (String, Identity)>,
    sessions: Mutex<HashMap<SessionId, Identity>>,
}

impl MockIdentityStore {
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_user(mut self, login_name: &str, password: &str, identity: Identity) -> Self {
        self.users
            .insert(login_name.to_string(), (password.to_string(), identity));
        self
    }

    pub fn has_open_session(&self, session_id: &SessionId) -> bool {
        self.sessions.lock().contains_key(session_id)
    }
}

impl Default for MockIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for MockIdentityStore {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, SchedulerError> {
        match self.users.get(&credentials.login_name) {
            Some((password, identity)) if *password == credentials.password => Ok(identity.clone()),
            _ => Err(SchedulerError::InvalidCredentials),
        }
    }

    async fn identity_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Identity, SchedulerError> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("session {session_id}")))
    }

    async fn open_session(
        &self,
        session_id: &SessionId,
        _remote_addr: &str,
        identity: &Identity,
    ) -> Result<(), SchedulerError> {
        self.sessions
            .lock()
            .insert(session_id.clone(), identity.clone());
        Ok(())
    }

    async fn close_session(&self, session_id: &SessionId) -> Result<(), SchedulerError> {
        self.sessions
            .lock()
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(format!("session {session_id}")))
    }
}
