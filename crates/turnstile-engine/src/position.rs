use async_trait::async_trait;
use parking_lot::RwLock;
use turnstile_core::{Position, PositionSource, SchedulerError};

/// Most recent GPS fix reported by the vehicle.
///
/// The vehicle layer calls [`LatestFix::update`]. Until the first fix, or
/// after [`LatestFix::clear`], reads fail with `Unavailable`.
#[derive(Default)]
pub struct LatestFix {
    fix: RwLock<Option<Position>>,
}

impl LatestFix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, position: Position) {
        *self.fix.write() = Some(position);
    }

    pub fn clear(&self) {
        *self.fix.write() = None;
    }
}

#[async_trait]
impl PositionSource for LatestFix {
    async fn current(&self) -> Result<Position, SchedulerError> {
        (*self.fix.read()).ok_or_else(|| SchedulerError::Unavailable("no gps fix".into()))
    }
}
