use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::AudioError;
use super::session::{duration_micros, SessionConfig, ShareMode};

/// Engine-wide settings.
///
/// Usually loaded once from the host application's settings file with
/// [`EngineConfiguration::from_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfiguration {
    /// Sharing mode for sessions opened without an explicit config (default: shared).
    pub share_mode: ShareMode,

    /// Requested buffer duration (default: 10ms).
    #[serde(with = "duration_micros")]
    pub buffer_duration: Duration,

    /// Pace pumps by device events rather than polling (default: true).
    pub event_driven: bool,

    /// `wait_ready` timeout as a multiple of the buffer duration (default: 2.0).
    pub wait_timeout_factor: f64,

    /// Capture device friendly names, most preferred first.
    pub preferred_capture_devices: Vec<String>,

    /// Render device friendly names, most preferred first.
    pub preferred_render_devices: Vec<String>,

    /// Skip automatic selection of newly seen USB devices.
    pub disable_usb_auto_selection: bool,
}

impl EngineConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_duration.is_zero() {
            return Err("buffer duration must be positive".into());
        }
        if self.buffer_duration > Duration::from_secs(2) {
            return Err(format!("buffer duration too long: {:?}", self.buffer_duration));
        }
        if !(self.wait_timeout_factor >= 1.0) {
            return Err(format!("wait timeout factor must be >= 1: {}", self.wait_timeout_factor));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, AudioError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AudioError::Initialization(format!("failed to parse engine configuration: {}", e)))?;
        config.validate().map_err(AudioError::Initialization)?;
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            share_mode: self.share_mode,
            buffer_duration: self.buffer_duration,
            event_driven: self.event_driven,
        }
    }

    /// Watchdog bound for one `wait_ready` call on a session with `buffer`.
    pub fn wait_timeout(&self, buffer: Duration) -> Duration {
        Duration::from_nanos((buffer.as_nanos() as f64 * self.wait_timeout_factor).round() as u64)
    }
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            buffer_duration: Duration::from_millis(10),
            event_driven: true,
            wait_timeout_factor: 2.0,
            preferred_capture_devices: Vec::new(),
            preferred_render_devices: Vec::new(),
            disable_usb_auto_selection: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wait_timeout(Duration::from_millis(10)), Duration::from_millis(20));
    }

    #[test]
    fn parses_partial_json() {
        let config = EngineConfiguration::from_json(
            r#"{ "share_mode": "exclusive", "buffer_duration": 3000, "preferred_capture_devices": ["USB Mic"] }"#,
        )
        .unwrap();
        assert_eq!(config.share_mode, ShareMode::Exclusive);
        assert_eq!(config.buffer_duration, Duration::from_millis(3));
        assert!(config.event_driven);
        assert_eq!(config.preferred_capture_devices, vec!["USB Mic".to_string()]);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(EngineConfiguration::from_json(r#"{ "buffer_duration": 0 }"#).is_err());
        assert!(EngineConfiguration::from_json(r#"{ "wait_timeout_factor": 0.5 }"#).is_err());
        assert!(EngineConfiguration::from_json("not json").is_err());
    }
}
