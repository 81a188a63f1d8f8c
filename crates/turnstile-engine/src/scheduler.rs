//! Turn scheduler.
//!
//! A two-phase state machine driven by [`DriveScheduler::tick`]. Each tick
//! either keeps the current turn running, ends it, or starts the next one
//! from the head of the [`WaitingQueue`], and returns how long the caller
//! should wait before ticking again. At most one turn is active at a time.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use turnstile_core::clock::{remaining, to_delta};
use turnstile_core::{
    Clock, DriveConfig, Identity, SchedulerError, SessionId, SettingsError, TurnId, TurnStore,
};

use crate::error::EngineError;
use crate::queue::{QueueEntry, WaitingQueue};
use crate::registry::SessionRegistry;

/// The most recent turn, open or just ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInfo {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub identity: Identity,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub telemetry_interval: Duration,
}

impl TurnInfo {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Whether a sample taken at `at` belongs to this turn.
    ///
    /// The window is `(started_at, end]`, where `end` is the earlier of the
    /// deadline and the actual end.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        let end = self.ended_at.map_or(self.deadline, |e| e.min(self.deadline));
        at > self.started_at && at <= end
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    Idle,
    Active(TurnInfo),
}

/// Loop tuning that is not part of [`DriveConfig`].
#[derive(Clone, Copy, Debug)]
pub struct SchedulerOptions {
    /// Delay between queue probes while idle or after a failed tick.
    pub probe_interval: Duration,
    /// Upper bound on each turn store call.
    pub call_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Requests other tasks leave for the scheduler.
#[derive(Default)]
struct Control {
    pending_config: Mutex<Option<DriveConfig>>,
    /// Turn an admin asked to end. Ignored unless it is still the active one.
    force_end: Mutex<Option<TurnId>>,
    wake: Notify,
}

/// Cheap, cloneable view of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    control: Arc<Control>,
    turns: watch::Receiver<Option<TurnInfo>>,
}

impl SchedulerHandle {
    /// Stage a new config. It takes effect when the next turn starts.
    pub fn refresh(&self, config: DriveConfig) -> Result<(), SettingsError> {
        config.validate()?;
        *self.control.pending_config.lock() = Some(config);
        info!(
            turn_minutes = config.turn_duration_minutes,
            telemetry_seconds = config.telemetry_interval_seconds,
            "drive config staged for next turn"
        );
        Ok(())
    }

    pub fn pending_config(&self) -> Option<DriveConfig> {
        *self.control.pending_config.lock()
    }

    /// Ask the scheduler to end the current turn now. Returns false when
    /// no turn is running. The request names the turn seen here, so it can
    /// never end a turn that starts afterwards.
    pub fn force_end(&self) -> bool {
        let Some(turn) = self.current_turn() else {
            return false;
        };
        *self.control.force_end.lock() = Some(turn.turn_id);
        self.control.wake.notify_one();
        true
    }

    /// The open turn, if any.
    pub fn current_turn(&self) -> Option<TurnInfo> {
        self.turns.borrow().as_ref().filter(|t| t.is_open()).cloned()
    }

    /// Follow turn starts and ends.
    pub fn subscribe(&self) -> watch::Receiver<Option<TurnInfo>> {
        self.turns.clone()
    }

    /// Resolves when someone wants the scheduler to re-evaluate early.
    pub async fn woken(&self) {
        self.control.wake.notified().await;
    }
}

pub struct DriveScheduler {
    queue: Arc<WaitingQueue>,
    registry: Arc<SessionRegistry>,
    turns: Arc<dyn TurnStore>,
    clock: Arc<dyn Clock>,
    config: DriveConfig,
    options: SchedulerOptions,
    phase: Phase,
    control: Arc<Control>,
    published: watch::Sender<Option<TurnInfo>>,
}

impl DriveScheduler {
    pub fn new(
        config: DriveConfig,
        options: SchedulerOptions,
        queue: Arc<WaitingQueue>,
        registry: Arc<SessionRegistry>,
        turns: Arc<dyn TurnStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            queue,
            registry,
            turns,
            clock,
            config,
            options,
            phase: Phase::Idle,
            control: Arc::new(Control::default()),
            published,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: Arc::clone(&self.control),
            turns: self.published.subscribe(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Config of the current or next turn, not counting a staged refresh.
    pub fn config(&self) -> DriveConfig {
        self.config
    }

    pub fn options(&self) -> SchedulerOptions {
        self.options
    }

    /// Evaluate the state machine once and return the delay until the next
    /// tick. Never fails: errors and panics are logged and retried after
    /// the probe interval.
    pub async fn tick(&mut self) -> Duration {
        match AssertUnwindSafe(self.evaluate()).catch_unwind().await {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                warn!(error = %e, "scheduler tick failed, retrying");
                self.options.probe_interval
            }
            Err(_) => {
                error!("scheduler tick panicked, retrying");
                self.options.probe_interval
            }
        }
    }

    /// End any running turn. Used on shutdown.
    pub async fn stop(&mut self) {
        if let Phase::Active(turn) = self.phase.clone() {
            let ended_at = self.clock.now().min(turn.deadline);
            self.finish(turn, ended_at, "shutdown").await;
        }
    }

    async fn evaluate(&mut self) -> Result<Duration, EngineError> {
        let forced = self.control.force_end.lock().take();

        if let Phase::Active(turn) = self.phase.clone() {
            let now = self.clock.now();
            if forced == Some(turn.turn_id) {
                let ended_at = now.min(turn.deadline);
                self.finish(turn, ended_at, "forced").await;
            } else if now >= turn.deadline {
                let deadline = turn.deadline;
                self.finish(turn, deadline, "expired").await;
            } else {
                return Ok(remaining(now, turn.deadline));
            }
        }

        self.start_next().await
    }

    /// Close `turn` and go idle. Recording the end is best effort.
    async fn finish(&mut self, turn: TurnInfo, ended_at: DateTime<Utc>, reason: &'static str) {
        let attempt = bounded(
            self.options.call_timeout,
            self.turns.end(turn.turn_id, ended_at),
        );
        let ended = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Unavailable("turn store panicked".into())),
        };
        if let Err(e) = ended {
            warn!(turn_id = %turn.turn_id, error = %e, "failed to record turn end");
        }
        info!(
            turn_id = %turn.turn_id,
            session_id = %turn.session_id,
            reason,
            "turn ended"
        );
        self.phase = Phase::Idle;
        self.published.send_replace(Some(TurnInfo {
            ended_at: Some(ended_at),
            ..turn
        }));
    }

    /// Pop queue entries until one can start. Entries whose session is gone
    /// are dropped without waiting for another tick.
    async fn start_next(&mut self) -> Result<Duration, EngineError> {
        loop {
            let Some(entry) = self.queue.pop_front() else {
                return Ok(self.options.probe_interval);
            };
            let identity = match self.registry.lookup(&entry.session_id) {
                Ok(identity) => identity,
                Err(_) => {
                    info!(session_id = %entry.session_id, "queued session is gone, skipping");
                    continue;
                }
            };
            return self.begin(entry, identity).await;
        }
    }

    async fn begin(&mut self, entry: QueueEntry, identity: Identity) -> Result<Duration, EngineError> {
        if let Some(config) = self.control.pending_config.lock().take() {
            info!(
                turn_minutes = config.turn_duration_minutes,
                telemetry_seconds = config.telemetry_interval_seconds,
                "applying refreshed drive config"
            );
            self.config = config;
        }

        let started_at = self.clock.now();
        let attempt = bounded(
            self.options.call_timeout,
            self.turns.begin(&entry.session_id, &identity, started_at),
        );
        let begun = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Unavailable("turn store panicked".into())),
        };

        let turn_id = match begun {
            Ok(turn_id) => turn_id,
            Err(source) => {
                let session_id = entry.session_id.clone();
                self.queue.push_front(entry);
                return Err(EngineError::TurnStart { session_id, source });
            }
        };

        let duration = self.config.turn_duration();
        let turn = TurnInfo {
            turn_id,
            session_id: entry.session_id,
            identity,
            started_at,
            deadline: started_at + to_delta(duration),
            ended_at: None,
            telemetry_interval: self.config.telemetry_interval(),
        };
        info!(
            turn_id = %turn.turn_id,
            session_id = %turn.session_id,
            user_id = %turn.identity.user_id,
            deadline = %turn.deadline,
            "turn started"
        );
        self.published.send_replace(Some(turn.clone()));
        self.phase = Phase::Active(turn);
        Ok(duration)
    }
}

/// Run a collaborator call with an upper bound. A timeout counts as
/// `Unavailable`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, SchedulerError>>,
) -> Result<T, SchedulerError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SchedulerError::Unavailable(format!("call timed out after {limit:?}")))?
}
