//! Single-car turn scheduling.
//!
//! Sessions queue for the car through [`ActionDispatcher`]. A
//! [`DriveScheduler`] hands the car to the head of the [`WaitingQueue`] for
//! a fixed duration, and a [`TelemetryLogger`] records the car's position
//! against the running turn. [`Runtime`] wires them to tokio tasks.

pub mod actions;
pub mod error;
pub mod mock;
pub mod position;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod telemetry_logger;

pub use actions::{Action, ActionDispatcher, Outcome, Request, StatusReport};
pub use error::EngineError;
pub use position::LatestFix;
pub use queue::{Enqueued, QueueEntry, WaitingQueue};
pub use registry::{SessionEntry, SessionRegistry};
pub use runtime::{Collaborators, Runtime, RuntimeConfig};
pub use scheduler::{DriveScheduler, Phase, SchedulerHandle, SchedulerOptions, TurnInfo};
pub use telemetry_logger::{SampleOutcome, TelemetryLogger};
