use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Audio session state machine.
///
/// State transitions:
/// ```text
/// created → initialized → started ⇄ stopped
///    ↓           ↓           ↓         ↓
///    └───────────┴─────→ released ←────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Initialized,
    Started,
    Stopped,
    Released,
}

impl SessionState {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// Whether the OS buffer has been allocated and not yet released.
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized | Self::Started | Self::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// Whether the engine owns the endpoint or shares it through the system mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    #[default]
    Shared,
    Exclusive,
}

/// Per-session open parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub share_mode: ShareMode,

    /// Requested buffer duration. The device may round it up.
    #[serde(with = "duration_micros")]
    pub buffer_duration: Duration,

    /// Register a wait primitive and pace the pump by device events.
    pub event_driven: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            buffer_duration: Duration::from_millis(10),
            event_driven: true,
        }
    }
}

/// Default and minimum scheduling periods reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePeriod {
    pub default: Duration,
    pub minimum: Duration,
}

/// Flags describing one pumped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags {
    /// Device marked the packet as silence; the copied bytes are zeroed.
    pub silent: bool,
    /// Frames were lost between this read and the previous one.
    pub discontinuity: bool,
    /// The session appended silence to cover a short render write.
    pub silence_padded: bool,
}

/// Outcome of a capture `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureRead {
    pub frames: usize,
    pub bytes: usize,
    pub flags: BufferFlags,
}

/// Outcome of a render `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderWrite {
    /// Caller frames copied into the device buffer.
    pub frames: usize,
    pub bytes: usize,
    /// Silence frames appended after the caller's data.
    pub padded_frames: usize,
    pub flags: BufferFlags,
}

pub(crate) mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_micros)
    }
}
