use std::time::Duration;

use uuid::Uuid;

use crate::models::device::{DataFlow, DeviceDescriptor, DeviceState, StateFilter};
use crate::models::error::AudioError;
use crate::models::format::{DeviceFormats, FormatDescriptor};
use crate::models::property::PropertyKey;
use crate::models::session::{DevicePeriod, ShareMode};
use crate::session::signal::DeviceNotifier;

/// Interface to a platform audio stack.
///
/// Implemented by:
/// - `WasapiBackend` (Windows, in `audio-session-windows`)
/// - [`SimulatedBackend`](crate::backend::simulated::SimulatedBackend)
/// - [`LoggingBackend`](crate::backend::logging::LoggingBackend), wrapping either
///
/// Every method opens what it needs and releases it before returning, except
/// [`open_device`](Self::open_device), whose handle is owned by the caller.
pub trait AudioBackend: Send + Sync {
    /// Short identifier used in log lines.
    fn name(&self) -> &str;

    /// Snapshot the endpoints for `flow` whose state passes `filter`.
    fn enumerate(&self, flow: DataFlow, filter: StateFilter) -> Result<Vec<DeviceDescriptor>, AudioError>;

    /// Look up one endpoint by id, in any state.
    fn device(&self, id: &str) -> Result<DeviceDescriptor, AudioError>;

    /// The system default endpoint for `flow`.
    fn default_endpoint(&self, flow: DataFlow) -> Result<DeviceDescriptor, AudioError>;

    /// Open a read-only view of the endpoint's properties.
    fn open_property_store(&self, id: &str) -> Result<Box<dyn PropertyStore>, AudioError>;

    /// Open a long-lived handle to the endpoint.
    fn open_device(&self, id: &str) -> Result<Box<dyn DeviceHandle>, AudioError>;
}

/// Read-only key/value metadata for one endpoint.
pub trait PropertyStore {
    /// Fails with `PropertyUnavailable` if the key is absent or not a string.
    fn get_string(&self, key: &PropertyKey) -> Result<String, AudioError>;
}

/// An open endpoint.
pub trait DeviceHandle: Send {
    fn id(&self) -> &str;

    fn flow(&self) -> DataFlow;

    /// Current connection state, read fresh from the platform.
    fn state(&self) -> Result<DeviceState, AudioError>;

    /// Create the stream client used to negotiate and run a session.
    fn activate(&mut self) -> Result<Box<dyn AudioClient>, AudioError>;

    fn release(&mut self) -> Result<(), AudioError>;
}

/// Parameters handed to [`AudioClient::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub share_mode: ShareMode,
    pub format: FormatDescriptor,
    pub buffer_duration: Duration,
    /// Zero in shared mode; equal to `buffer_duration` in exclusive mode.
    pub periodicity: Duration,
    pub event_driven: bool,
    /// Groups the stream with others of the same audio session.
    pub session_guid: Uuid,
}

/// A stream client on an endpoint (one per session).
pub trait AudioClient: Send {
    /// Formats the endpoint can be opened with.
    fn formats(&self) -> Result<DeviceFormats, AudioError>;

    fn device_period(&self) -> Result<DevicePeriod, AudioError>;

    /// Allocate the OS buffer. Fails with `FormatUnsupported`, `DeviceBusy`
    /// or `Initialization`.
    fn initialize(&mut self, params: &StreamParams) -> Result<(), AudioError>;

    /// Size of the allocated buffer in frames.
    fn buffer_frame_count(&self) -> Result<usize, AudioError>;

    /// Frames queued in the buffer and not yet consumed by the other side.
    fn current_padding(&self) -> Result<usize, AudioError>;

    fn stream_latency(&self) -> Result<Duration, AudioError>;

    /// Register the completion path that signals buffer readiness.
    fn set_event_notifier(&mut self, notifier: DeviceNotifier) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    fn capture_client(&mut self) -> Result<Box<dyn CaptureClient>, AudioError>;

    fn render_client(&mut self) -> Result<Box<dyn RenderClient>, AudioError>;

    /// Free the OS buffer.
    fn release(&mut self) -> Result<(), AudioError>;
}

/// What a capture read produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapturePacket {
    pub frames: usize,
    pub silent: bool,
    pub discontinuity: bool,
}

/// Capture sub-client.
pub trait CaptureClient: Send {
    /// Frames ready to read without blocking.
    fn available_frames(&self) -> Result<usize, AudioError>;

    /// Copy up to `dst.len() / block_align` frames of `format` into `dst`.
    ///
    /// Frames that do not fit stay queued for the next read.
    fn read(&mut self, dst: &mut [u8], format: &FormatDescriptor) -> Result<CapturePacket, AudioError>;

    fn release(&mut self) -> Result<(), AudioError>;
}

/// Render sub-client.
pub trait RenderClient: Send {
    /// Queue the frames in `src` followed by `silence_frames` of silence in `format`.
    ///
    /// The caller guarantees the total fits in the free space.
    fn write(&mut self, src: &[u8], silence_frames: usize, format: &FormatDescriptor) -> Result<(), AudioError>;

    fn release(&mut self) -> Result<(), AudioError>;
}
