//! # audio-session-core
//!
//! Platform-agnostic PCM endpoint engine.
//!
//! Provides format negotiation, endpoint enumeration, property lookup and an
//! event-driven session state machine that pumps raw frames between caller
//! buffers and a device. Platform backends (Windows WASAPI) implement the
//! `AudioBackend` trait; a simulated backend ships for tests and tooling.
//!
//! ## Architecture
//!
//! ```text
//! audio-session-core (this crate)
//! ├── traits/       ← AudioBackend, DeviceHandle, AudioClient, capture/render clients
//! ├── models/       ← AudioError, FormatDescriptor, DeviceDescriptor, EngineConfiguration, etc.
//! ├── endpoint/     ← DeviceEnumerator, DevicePropertyStore
//! ├── session/      ← AudioSession, ReadySignal, SessionRegistry, AudioEngine
//! ├── backend/      ← SimulatedBackend, LoggingBackend
//! └── processing/   ← WAVEFORMATEX encode/decode
//! ```

pub mod backend;
pub mod endpoint;
pub mod models;
pub mod processing;
pub mod session;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use backend::logging::LoggingBackend;
pub use backend::simulated::{SimulatedBackend, SimulatedEndpoint};
pub use endpoint::enumerator::{DeviceEnumerator, EndpointInfo, EndpointSnapshot};
pub use endpoint::properties::DevicePropertyStore;
pub use models::config::EngineConfiguration;
pub use models::device::{DataFlow, DeviceDescriptor, DeviceState, StateFilter, TransportType};
pub use models::error::{AudioError, FormatError};
pub use models::format::{DeviceFormats, FormatDescriptor, FormatTag, SampleRateRange};
pub use models::property::PropertyKey;
pub use models::session::{BufferFlags, CaptureRead, DevicePeriod, RenderWrite, SessionConfig, SessionState, ShareMode};
pub use session::audio_session::{AudioSession, NegotiatedStream, ReleaseReport};
pub use session::engine::AudioEngine;
pub use session::registry::{DrainReport, SessionId, SessionRegistry};
pub use session::signal::{DeviceNotifier, ReadySignal, WaitOutcome};
pub use traits::backend::{
    AudioBackend, AudioClient, CaptureClient, CapturePacket, DeviceHandle, PropertyStore, RenderClient, StreamParams,
};
