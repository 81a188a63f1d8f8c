/// Error taxonomy shared by the scheduler and its collaborators.
///
/// `Unavailable` is transient: callers log it and carry on from in-memory
/// state. Everything else is a definite answer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("queue capacity of {limit} exceeded")]
    CapacityExceeded { limit: usize },

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::InvalidCredentials => "invalid_credentials",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::PermissionDenied(_) => "permission_denied",
        }
    }
}
