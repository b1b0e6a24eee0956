//! Call-tracing decorator for any [`AudioBackend`].
//!
//! Every call on the backend and on the handles it hands out is logged at
//! `trace` level with its outcome, under the `audio_session_core::backend`
//! target. Pump-path calls are logged too, so enable it only while debugging.

use std::fmt::Debug;
use std::time::Duration;

use crate::models::device::{DataFlow, DeviceDescriptor, DeviceState, StateFilter};
use crate::models::error::AudioError;
use crate::models::format::{DeviceFormats, FormatDescriptor};
use crate::models::property::PropertyKey;
use crate::models::session::DevicePeriod;
use crate::session::signal::DeviceNotifier;
use crate::traits::backend::{
    AudioBackend, AudioClient, CaptureClient, CapturePacket, DeviceHandle, PropertyStore, RenderClient, StreamParams,
};

const TARGET: &str = "audio_session_core::backend";

/// Pump calls skip building their call description unless tracing is on.
fn trace_enabled() -> bool {
    log::log_enabled!(target: TARGET, log::Level::Trace)
}

fn traced<T: Debug>(scope: &str, call: &str, result: Result<T, AudioError>) -> Result<T, AudioError> {
    match &result {
        Ok(value) => log::trace!(target: TARGET, "{}: {} -> {:?}", scope, call, value),
        Err(e) => log::trace!(target: TARGET, "{}: {} failed: {}", scope, call, e),
    }
    result
}

/// Like [`traced`] for results whose value has no useful `Debug` form.
fn traced_opaque<T>(scope: &str, call: &str, result: Result<T, AudioError>) -> Result<T, AudioError> {
    match &result {
        Ok(_) => log::trace!(target: TARGET, "{}: {} -> ok", scope, call),
        Err(e) => log::trace!(target: TARGET, "{}: {} failed: {}", scope, call, e),
    }
    result
}

/// Wraps a backend and traces every call through it.
pub struct LoggingBackend<B> {
    inner: B,
}

impl<B: AudioBackend> LoggingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: AudioBackend> AudioBackend for LoggingBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enumerate(&self, flow: DataFlow, filter: StateFilter) -> Result<Vec<DeviceDescriptor>, AudioError> {
        traced(
            self.inner.name(),
            &format!("enumerate({:?}, {:?})", flow, filter),
            self.inner.enumerate(flow, filter),
        )
    }

    fn device(&self, id: &str) -> Result<DeviceDescriptor, AudioError> {
        traced(self.inner.name(), &format!("device({})", id), self.inner.device(id))
    }

    fn default_endpoint(&self, flow: DataFlow) -> Result<DeviceDescriptor, AudioError> {
        traced(
            self.inner.name(),
            &format!("default_endpoint({:?})", flow),
            self.inner.default_endpoint(flow),
        )
    }

    fn open_property_store(&self, id: &str) -> Result<Box<dyn PropertyStore>, AudioError> {
        let store = traced_opaque(
            self.inner.name(),
            &format!("open_property_store({})", id),
            self.inner.open_property_store(id),
        )?;
        Ok(Box::new(LoggingPropertyStore {
            scope: id.to_string(),
            inner: store,
        }))
    }

    fn open_device(&self, id: &str) -> Result<Box<dyn DeviceHandle>, AudioError> {
        let device = traced_opaque(
            self.inner.name(),
            &format!("open_device({})", id),
            self.inner.open_device(id),
        )?;
        Ok(Box::new(LoggingDevice { inner: device }))
    }
}

struct LoggingPropertyStore {
    scope: String,
    inner: Box<dyn PropertyStore>,
}

impl PropertyStore for LoggingPropertyStore {
    fn get_string(&self, key: &PropertyKey) -> Result<String, AudioError> {
        traced(&self.scope, &format!("get_string({})", key), self.inner.get_string(key))
    }
}

struct LoggingDevice {
    inner: Box<dyn DeviceHandle>,
}

impl DeviceHandle for LoggingDevice {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn flow(&self) -> DataFlow {
        self.inner.flow()
    }

    fn state(&self) -> Result<DeviceState, AudioError> {
        traced(self.inner.id(), "state", self.inner.state())
    }

    fn activate(&mut self) -> Result<Box<dyn AudioClient>, AudioError> {
        let scope = self.inner.id().to_string();
        let client = traced_opaque(&scope, "activate", self.inner.activate())?;
        Ok(Box::new(LoggingClient { scope, inner: client }))
    }

    fn release(&mut self) -> Result<(), AudioError> {
        let scope = self.inner.id().to_string();
        traced(&scope, "release device", self.inner.release())
    }
}

struct LoggingClient {
    scope: String,
    inner: Box<dyn AudioClient>,
}

impl AudioClient for LoggingClient {
    fn formats(&self) -> Result<DeviceFormats, AudioError> {
        traced(&self.scope, "formats", self.inner.formats())
    }

    fn device_period(&self) -> Result<DevicePeriod, AudioError> {
        traced(&self.scope, "device_period", self.inner.device_period())
    }

    fn initialize(&mut self, params: &StreamParams) -> Result<(), AudioError> {
        traced(&self.scope, &format!("initialize({:?})", params), self.inner.initialize(params))
    }

    fn buffer_frame_count(&self) -> Result<usize, AudioError> {
        traced(&self.scope, "buffer_frame_count", self.inner.buffer_frame_count())
    }

    fn current_padding(&self) -> Result<usize, AudioError> {
        traced(&self.scope, "current_padding", self.inner.current_padding())
    }

    fn stream_latency(&self) -> Result<Duration, AudioError> {
        traced(&self.scope, "stream_latency", self.inner.stream_latency())
    }

    fn set_event_notifier(&mut self, notifier: DeviceNotifier) -> Result<(), AudioError> {
        traced(&self.scope, "set_event_notifier", self.inner.set_event_notifier(notifier))
    }

    fn start(&mut self) -> Result<(), AudioError> {
        traced(&self.scope, "start", self.inner.start())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        traced(&self.scope, "stop", self.inner.stop())
    }

    fn capture_client(&mut self) -> Result<Box<dyn CaptureClient>, AudioError> {
        let capture = traced_opaque(&self.scope, "capture_client", self.inner.capture_client())?;
        Ok(Box::new(LoggingCapture {
            scope: self.scope.clone(),
            inner: capture,
        }))
    }

    fn render_client(&mut self) -> Result<Box<dyn RenderClient>, AudioError> {
        let render = traced_opaque(&self.scope, "render_client", self.inner.render_client())?;
        Ok(Box::new(LoggingRender {
            scope: self.scope.clone(),
            inner: render,
        }))
    }

    fn release(&mut self) -> Result<(), AudioError> {
        traced(&self.scope, "release client", self.inner.release())
    }
}

struct LoggingCapture {
    scope: String,
    inner: Box<dyn CaptureClient>,
}

impl CaptureClient for LoggingCapture {
    fn available_frames(&self) -> Result<usize, AudioError> {
        traced(&self.scope, "available_frames", self.inner.available_frames())
    }

    fn read(&mut self, dst: &mut [u8], format: &FormatDescriptor) -> Result<CapturePacket, AudioError> {
        if !trace_enabled() {
            return self.inner.read(dst, format);
        }
        traced(
            &self.scope,
            &format!("read({} bytes)", dst.len()),
            self.inner.read(dst, format),
        )
    }

    fn release(&mut self) -> Result<(), AudioError> {
        traced(&self.scope, "release capture client", self.inner.release())
    }
}

struct LoggingRender {
    scope: String,
    inner: Box<dyn RenderClient>,
}

impl RenderClient for LoggingRender {
    fn write(&mut self, src: &[u8], silence_frames: usize, format: &FormatDescriptor) -> Result<(), AudioError> {
        if !trace_enabled() {
            return self.inner.write(src, silence_frames, format);
        }
        traced(
            &self.scope,
            &format!("write({} bytes + {} silent frames)", src.len(), silence_frames),
            self.inner.write(src, silence_frames, format),
        )
    }

    fn release(&mut self) -> Result<(), AudioError> {
        traced(&self.scope, "release render client", self.inner.release())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::simulated::{SimulatedBackend, SimulatedEndpoint};
    use crate::endpoint::enumerator::DeviceEnumerator;
    use crate::models::format::FormatDescriptor;
    use crate::models::session::SessionConfig;
    use crate::session::audio_session::AudioSession;

    fn simulated() -> SimulatedBackend {
        let backend = SimulatedBackend::new();
        backend.add_endpoint(SimulatedEndpoint::capture("mic", "Mic (3- USB Mic)").packet_frames(48));
        backend
    }

    #[test]
    fn forwards_enumeration_and_properties() {
        let backend = Arc::new(LoggingBackend::new(simulated()));
        let enumerator = DeviceEnumerator::new(backend.clone());

        let infos = enumerator.describe_endpoints(DataFlow::Capture, StateFilter::Active).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "Mic (USB Mic)");
        assert_eq!(backend.name(), "simulated");
        assert!(matches!(backend.device("nope"), Err(AudioError::DeviceNotFound(_))));
    }

    #[test]
    fn wrapped_session_pumps_and_releases() {
        let backend = LoggingBackend::new(simulated());
        let descriptor = backend.device("mic").unwrap();
        let session = AudioSession::open(&backend, &descriptor).unwrap();
        session
            .initialize(&FormatDescriptor::pcm(48_000, 2, 16).unwrap(), &SessionConfig::default())
            .unwrap();
        session.start().unwrap();

        backend.inner().tick("mic");
        let mut buf = vec![0u8; 48 * 4];
        assert_eq!(session.read(&mut buf).unwrap().frames, 48);

        assert!(session.release().is_clean());
        assert_eq!(backend.inner().open_handle_count(), 0);
    }
}
