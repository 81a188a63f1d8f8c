//! Background tasks that drive the scheduler and the telemetry logger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use turnstile_core::settings::SchedulerSettings;
use turnstile_core::{Clock, DriveConfig, IdentityStore, PositionSource, TurnStore};

use crate::actions::ActionDispatcher;
use crate::queue::WaitingQueue;
use crate::registry::SessionRegistry;
use crate::scheduler::{DriveScheduler, SchedulerHandle, SchedulerOptions};
use crate::telemetry_logger::TelemetryLogger;

/// Collaborators the runtime is built from.
pub struct Collaborators {
    pub turns: Arc<dyn TurnStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub positions: Arc<dyn PositionSource>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    pub drive: DriveConfig,
    pub options: SchedulerOptions,
    pub max_queue_depth: Option<usize>,
}

impl RuntimeConfig {
    pub fn new(drive: DriveConfig, scheduler: &SchedulerSettings) -> Self {
        Self {
            drive,
            options: SchedulerOptions {
                probe_interval: Duration::from_millis(scheduler.probe_interval_ms),
                call_timeout: Duration::from_millis(scheduler.collaborator_timeout_ms),
            },
            max_queue_depth: scheduler.max_queue_depth,
        }
    }
}

/// A started scheduler. Dropping it does not stop the tasks; call
/// [`Runtime::shutdown`].
pub struct Runtime {
    queue: Arc<WaitingQueue>,
    registry: Arc<SessionRegistry>,
    scheduler: SchedulerHandle,
    dispatcher: Arc<ActionDispatcher>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Runtime {
    /// Spawn the scheduler and telemetry tasks. The first scheduler tick
    /// runs immediately. Must be called inside a tokio runtime.
    pub fn start(config: RuntimeConfig, deps: Collaborators) -> Self {
        let queue = Arc::new(WaitingQueue::with_max_depth(config.max_queue_depth));
        let registry = Arc::new(SessionRegistry::new());
        let scheduler = DriveScheduler::new(
            config.drive,
            config.options,
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&deps.turns),
            Arc::clone(&deps.clock),
        );
        let handle = scheduler.handle();
        let logger = TelemetryLogger::new(
            deps.positions,
            deps.turns,
            Arc::clone(&deps.clock),
            handle.subscribe(),
            config.options.call_timeout,
        );
        let dispatcher = Arc::new(ActionDispatcher::new(
            deps.identities,
            Arc::clone(&queue),
            Arc::clone(&registry),
            handle.clone(),
            deps.clock,
            config.options.call_timeout,
        ));

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_scheduler(scheduler, handle.clone(), cancel.clone())),
            tokio::spawn(run_logger(
                logger,
                config.drive.telemetry_interval(),
                cancel.clone(),
            )),
        ];
        info!(
            turn_minutes = config.drive.turn_duration_minutes,
            telemetry_seconds = config.drive.telemetry_interval_seconds,
            "scheduler started"
        );

        Self {
            queue,
            registry,
            scheduler: handle,
            dispatcher,
            cancel,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> Arc<ActionDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn queue(&self) -> &WaitingQueue {
        &self.queue
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Stop both tasks, end any running turn and forget all sessions.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let dropped = self.registry.delete_all();
        info!(dropped_sessions = dropped, "scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

async fn run_scheduler(
    mut scheduler: DriveScheduler,
    handle: SchedulerHandle,
    cancel: CancellationToken,
) {
    loop {
        let next = scheduler.tick().await;
        debug!(next_ms = next.as_millis() as u64, "scheduler tick done");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(next) => {}
            _ = handle.woken() => {}
        }
    }
    scheduler.stop().await;
}

async fn run_logger(mut logger: TelemetryLogger, initial: Duration, cancel: CancellationToken) {
    let mut period = initial;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                logger.sample().await;
                // A refreshed config changes the period from the next turn on.
                if let Some(next) = logger.active_interval() {
                    if next != period {
                        debug!(period_s = next.as_secs(), "telemetry interval changed");
                        period = next;
                        ticker = interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
    }
}
