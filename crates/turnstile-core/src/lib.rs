pub mod clock;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod position;
pub mod settings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{IdentityStore, PositionSource, TurnStore};
pub use config::DriveConfig;
pub use errors::SchedulerError;
pub use identity::{Credentials, Identity, Right};
pub use ids::{SessionId, TurnId};
pub use position::{Position, TelemetrySample};
pub use settings::{Settings, SettingsError};
