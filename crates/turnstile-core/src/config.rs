use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::settings::SettingsError;

/// Timing of drive turns and telemetry capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveConfig {
    pub turn_duration_minutes: u32,
    pub telemetry_interval_seconds: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            turn_duration_minutes: 5,
            telemetry_interval_seconds: 10,
        }
    }
}

impl DriveConfig {
    pub fn new(turn_duration_minutes: u32, telemetry_interval_seconds: u32) -> Self {
        Self {
            turn_duration_minutes,
            telemetry_interval_seconds,
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.turn_duration_minutes == 0 {
            return Err(SettingsError::InvalidValue(
                "turnDurationMinutes must be positive".into(),
            ));
        }
        if self.telemetry_interval_seconds == 0 {
            return Err(SettingsError::InvalidValue(
                "telemetryIntervalSeconds must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn turn_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.turn_duration_minutes) * 60)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.telemetry_interval_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_follow_units() {
        let config = DriveConfig::new(2, 15);
        assert_eq!(config.turn_duration(), Duration::from_secs(120));
        assert_eq!(config.telemetry_interval(), Duration::from_secs(15));
    }

    #[test]
    fn zero_values_rejected() {
        assert!(DriveConfig::new(0, 10).validate().is_err());
        assert!(DriveConfig::new(1, 0).validate().is_err());
        assert!(DriveConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: DriveConfig = serde_json::from_str(r#"{"turnDurationMinutes": 3}"#).unwrap();
        assert_eq!(config.turn_duration_minutes, 3);
        assert_eq!(config.telemetry_interval_seconds, 10);
    }
}
