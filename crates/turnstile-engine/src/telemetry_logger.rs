//! Periodic GPS capture for the running turn.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use turnstile_core::{Clock, PositionSource, TurnId, TurnStore};

use crate::scheduler::{bounded, TurnInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    Recorded(TurnId),
    /// No turn covers the current instant.
    Idle,
    /// The vehicle had no fix. Not an error.
    NoFix,
    Failed,
}

/// Records the vehicle position against whichever turn is running.
///
/// Keeps the last two turns it has seen so a sample taken exactly at a
/// turn boundary is still attributed to the turn that just ended, even if
/// the scheduler already started the next one.
pub struct TelemetryLogger {
    positions: Arc<dyn PositionSource>,
    store: Arc<dyn TurnStore>,
    clock: Arc<dyn Clock>,
    turns: watch::Receiver<Option<TurnInfo>>,
    current: Option<TurnInfo>,
    previous: Option<TurnInfo>,
    call_timeout: Duration,
}

impl TelemetryLogger {
    pub fn new(
        positions: Arc<dyn PositionSource>,
        store: Arc<dyn TurnStore>,
        clock: Arc<dyn Clock>,
        turns: watch::Receiver<Option<TurnInfo>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            positions,
            store,
            clock,
            turns,
            current: None,
            previous: None,
            call_timeout,
        }
    }

    /// Take one sample. Failures and panics are logged, never propagated.
    pub async fn sample(&mut self) -> SampleOutcome {
        match AssertUnwindSafe(self.try_sample()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("telemetry sample panicked");
                SampleOutcome::Failed
            }
        }
    }

    async fn try_sample(&mut self) -> SampleOutcome {
        self.observe();
        let now = self.clock.now();
        let Some(turn_id) = self.turn_at(now) else {
            return SampleOutcome::Idle;
        };

        let position = match bounded(self.call_timeout, self.positions.current()).await {
            Ok(position) => position,
            Err(e) => {
                debug!(turn_id = %turn_id, error = %e, "no position to record");
                return SampleOutcome::NoFix;
            }
        };

        match bounded(
            self.call_timeout,
            self.store.append_telemetry(turn_id, position, now),
        )
        .await
        {
            Ok(()) => SampleOutcome::Recorded(turn_id),
            Err(e) => {
                warn!(turn_id = %turn_id, error = %e, "failed to record telemetry");
                SampleOutcome::Failed
            }
        }
    }

    /// Telemetry interval of the open turn, if there is one.
    pub fn active_interval(&mut self) -> Option<Duration> {
        self.observe();
        self.current
            .as_ref()
            .filter(|t| t.is_open())
            .map(|t| t.telemetry_interval)
    }

    fn observe(&mut self) {
        let Some(latest) = self.turns.borrow_and_update().clone() else {
            return;
        };
        let same_turn = matches!(&self.current, Some(c) if c.turn_id == latest.turn_id);
        if !same_turn {
            self.previous = self.current.take();
        }
        self.current = Some(latest);
    }

    fn turn_at(&self, at: DateTime<Utc>) -> Option<TurnId> {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .find(|t| t.covers(at))
            .map(|t| t.turn_id)
    }
}
