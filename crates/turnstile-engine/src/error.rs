use turnstile_core::{SchedulerError, SessionId, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("could not start turn for {session_id}: {source}")]
    TurnStart {
        session_id: SessionId,
        #[source]
        source: SchedulerError,
    },
}

impl EngineError {
    /// The underlying taxonomy entry, when there is one.
    pub fn scheduler_error(&self) -> Option<&SchedulerError> {
        match self {
            Self::Scheduler(e) | Self::TurnStart { source: e, .. } => Some(e),
            _ => None,
        }
    }
}
