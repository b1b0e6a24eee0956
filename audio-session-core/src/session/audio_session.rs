use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::device::{DataFlow, DeviceDescriptor, DeviceState};
use crate::models::error::AudioError;
use crate::models::format::FormatDescriptor;
use crate::models::session::{
    BufferFlags, CaptureRead, DevicePeriod, RenderWrite, SessionConfig, SessionState, ShareMode,
};
use crate::session::signal::{ReadySignal, WaitOutcome};
use crate::traits::backend::{AudioBackend, AudioClient, CaptureClient, DeviceHandle, RenderClient, StreamParams};

/// Poll interval for sessions opened without event notification.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Format and timing fixed by a successful `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedStream {
    pub format: FormatDescriptor,
    pub share_mode: ShareMode,
    pub buffer_duration: Duration,
    pub buffer_frames: usize,
    pub device_period: DevicePeriod,
    /// Frames per device period; short render writes are padded up to this.
    pub period_frames: usize,
    pub event_driven: bool,
}

/// What happened while releasing a session.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// The session was already released; nothing was done.
    pub already_released: bool,
    /// Steps that reported an error. Later steps ran regardless.
    pub failures: Vec<(&'static str, AudioError)>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything the ownership token guards.
struct SessionInner {
    state: SessionState,
    device: Option<Box<dyn DeviceHandle>>,
    client: Option<Box<dyn AudioClient>>,
    capture: Option<Box<dyn CaptureClient>>,
    render: Option<Box<dyn RenderClient>>,
    signal: Option<ReadySignal>,
    notifier_registered: bool,
    stream: Option<NegotiatedStream>,
    device_lost: bool,
}

impl SessionInner {
    fn check_open(&self) -> Result<(), AudioError> {
        if self.state.is_terminal() {
            Err(AudioError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn check_device(&self) -> Result<(), AudioError> {
        if self.device_lost {
            Err(AudioError::DeviceLost("endpoint invalidated".into()))
        } else {
            Ok(())
        }
    }

    fn stream(&self) -> Result<NegotiatedStream, AudioError> {
        self.stream.ok_or(AudioError::InvalidState {
            expected: "initialized",
            actual: self.state,
        })
    }

    /// Record a lost device so later pump calls fail fast.
    fn note<T>(&mut self, result: Result<T, AudioError>) -> Result<T, AudioError> {
        if let Err(AudioError::DeviceLost(_)) = &result {
            self.device_lost = true;
        }
        result
    }
}

/// One capture or render stream on one endpoint.
///
/// A session moves through `Created → Initialized → Started ⇄ Stopped →
/// Released`. It owns exactly one device handle and, once initialized, one
/// stream client and one capture or render sub-client, all released together.
///
/// Pump calls (`wait_ready`, `read`, `write`, and the availability queries) take
/// the session's ownership token without blocking and fail with `SessionBusy`
/// when another thread holds it. Lifecycle calls (`initialize`, `start`, `stop`,
/// `release`) wait for the token, so they never interleave with a copy.
pub struct AudioSession {
    guid: Uuid,
    descriptor: DeviceDescriptor,
    inner: Mutex<SessionInner>,
    state: Mutex<SessionState>,
}

impl AudioSession {
    /// Open a handle on `descriptor`'s endpoint. The session starts in `Created`.
    pub fn open(backend: &dyn AudioBackend, descriptor: &DeviceDescriptor) -> Result<Self, AudioError> {
        let current = backend.device(&descriptor.id)?;
        descriptor.ensure_active(current.state)?;

        let device = backend.open_device(&descriptor.id)?;
        let guid = Uuid::new_v4();
        log::debug!("session {}: opened {:?} endpoint {}", guid, current.flow, current.id);

        Ok(Self {
            guid,
            descriptor: current,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                device: Some(device),
                client: None,
                capture: None,
                render: None,
                signal: None,
                notifier_registered: false,
                stream: None,
                device_lost: false,
            }),
            state: Mutex::new(SessionState::Created),
        })
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn flow(&self) -> DataFlow {
        self.descriptor.flow
    }

    /// Current lifecycle state. Readable while another thread is pumping.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Negotiated stream parameters, once initialized.
    pub fn stream(&self) -> Option<NegotiatedStream> {
        self.inner.lock().stream
    }

    pub fn format(&self) -> Option<FormatDescriptor> {
        self.stream().map(|s| s.format)
    }

    /// Suggested `wait_ready` bound: twice the negotiated buffer duration.
    pub fn recommended_wait_timeout(&self) -> Option<Duration> {
        self.stream().map(|s| s.buffer_duration * 2)
    }

    /// Stream latency reported by the device.
    pub fn latency(&self) -> Result<Duration, AudioError> {
        let inner = self.inner.lock();
        inner.check_open()?;
        inner.stream()?;
        match &inner.client {
            Some(client) => client.stream_latency(),
            None => Err(AudioError::SessionClosed),
        }
    }

    /// Negotiate `requested` against the device and allocate the OS buffer.
    ///
    /// On failure the session stays in `Created` and may be initialized again.
    pub fn initialize(&self, requested: &FormatDescriptor, config: &SessionConfig) -> Result<NegotiatedStream, AudioError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.state != SessionState::Created {
            return Err(AudioError::InvalidState {
                expected: "created",
                actual: inner.state,
            });
        }

        let device = inner.device.as_mut().ok_or(AudioError::SessionClosed)?;
        let state = device.state()?;
        self.descriptor.ensure_active(state)?;

        let mut client = device.activate()?;
        match self.negotiate(client.as_mut(), requested, config) {
            Ok((stream, sub)) => {
                match sub {
                    SubClient::Capture(c) => inner.capture = Some(c),
                    SubClient::Render(r) => inner.render = Some(r),
                }
                inner.client = Some(client);
                inner.signal = config.event_driven.then(ReadySignal::new);
                inner.stream = Some(stream);
                self.transition(&mut inner, SessionState::Initialized);
                log::debug!(
                    "session {}: negotiated {} ({:?}, {} frames, {:?})",
                    self.guid,
                    stream.format,
                    stream.share_mode,
                    stream.buffer_frames,
                    stream.buffer_duration
                );
                Ok(stream)
            }
            Err(e) => {
                if let Err(release_err) = client.release() {
                    log::warn!("session {}: releasing failed client: {}", self.guid, release_err);
                }
                log::debug!("session {}: initialize failed: {}", self.guid, e);
                Err(e)
            }
        }
    }

    fn negotiate(
        &self,
        client: &mut dyn AudioClient,
        requested: &FormatDescriptor,
        config: &SessionConfig,
    ) -> Result<(NegotiatedStream, SubClient), AudioError> {
        let formats = client.formats()?;
        let format = requested.negotiate(&formats, config.share_mode)?;
        let device_period = client.device_period()?;

        let buffer_duration = config.buffer_duration.max(device_period.minimum);
        let periodicity = match config.share_mode {
            ShareMode::Exclusive => buffer_duration,
            ShareMode::Shared => Duration::ZERO,
        };

        client.initialize(&StreamParams {
            share_mode: config.share_mode,
            format,
            buffer_duration,
            periodicity,
            event_driven: config.event_driven,
            session_guid: self.guid,
        })?;

        let buffer_frames = client.buffer_frame_count()?;
        let period = match config.share_mode {
            ShareMode::Exclusive => buffer_duration,
            ShareMode::Shared => device_period.default,
        };
        let period_frames = format.frames_for_duration(period).clamp(1, buffer_frames.max(1));

        let sub = match self.descriptor.flow {
            DataFlow::Capture => SubClient::Capture(client.capture_client()?),
            DataFlow::Render => SubClient::Render(client.render_client()?),
        };

        Ok((
            NegotiatedStream {
                format,
                share_mode: config.share_mode,
                buffer_duration: format_duration(format, buffer_frames).max(buffer_duration),
                buffer_frames,
                device_period,
                period_frames,
                event_driven: config.event_driven,
            },
            sub,
        ))
    }

    /// Start the device clock. Starting a started session is a no-op.
    pub fn start(&self) -> Result<(), AudioError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        match inner.state {
            SessionState::Started => return Ok(()),
            SessionState::Initialized | SessionState::Stopped => {}
            actual => {
                return Err(AudioError::InvalidState {
                    expected: "initialized or stopped",
                    actual,
                })
            }
        }
        inner.check_device()?;

        let state = match inner.device.as_ref() {
            Some(device) => device.state(),
            None => Err(AudioError::SessionClosed),
        };
        let state = inner.note(state)?;
        if state != DeviceState::Active {
            inner.device_lost = true;
        }
        self.descriptor.ensure_active(state)?;

        if !inner.notifier_registered {
            if let Some(notifier) = inner.signal.as_ref().map(ReadySignal::notifier) {
                let registered = match inner.client.as_mut() {
                    Some(client) => client.set_event_notifier(notifier),
                    None => Err(AudioError::SessionClosed),
                };
                inner.note(registered)?;
                inner.notifier_registered = true;
            }
        }

        let started = match inner.client.as_mut() {
            Some(client) => client.start(),
            None => Err(AudioError::SessionClosed),
        };
        inner.note(started)?;
        self.transition(&mut inner, SessionState::Started);
        Ok(())
    }

    /// Stop the device clock. Stopping a stopped session is a no-op.
    pub fn stop(&self) -> Result<(), AudioError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        match inner.state {
            SessionState::Stopped => Ok(()),
            SessionState::Started => {
                if let Some(client) = inner.client.as_mut() {
                    if let Err(e) = client.stop() {
                        log::warn!("session {}: device stop failed: {}", self.guid, e);
                    }
                }
                self.transition(&mut inner, SessionState::Stopped);
                Ok(())
            }
            actual => Err(AudioError::InvalidState {
                expected: "started or stopped",
                actual,
            }),
        }
    }

    /// Release the OS buffer, sub-client, device handle and wait primitive, in
    /// that order. Never fails; a second call does nothing.
    pub fn release(&self) -> ReleaseReport {
        let mut inner = self.inner.lock();
        let mut report = ReleaseReport::default();
        if inner.state.is_terminal() {
            report.already_released = true;
            return report;
        }

        if inner.state.is_started() {
            if let Some(client) = inner.client.as_mut() {
                if let Err(e) = client.stop() {
                    report.failures.push(("stop", e));
                }
            }
        }
        if let Some(mut client) = inner.client.take() {
            if let Err(e) = client.release() {
                report.failures.push(("stream client", e));
            }
        }
        if let Some(mut capture) = inner.capture.take() {
            if let Err(e) = capture.release() {
                report.failures.push(("capture client", e));
            }
        }
        if let Some(mut render) = inner.render.take() {
            if let Err(e) = render.release() {
                report.failures.push(("render client", e));
            }
        }
        if let Some(mut device) = inner.device.take() {
            if let Err(e) = device.release() {
                report.failures.push(("device", e));
            }
        }
        if let Some(signal) = inner.signal.take() {
            signal.close();
        }

        for (step, e) in &report.failures {
            log::warn!("session {}: releasing {} failed: {}", self.guid, step, e);
        }
        self.transition(&mut inner, SessionState::Released);
        report
    }

    // --- Pump ---

    /// Block until frames (capture) or a period of free space (render) is
    /// available, or `timeout` elapses.
    ///
    /// Returns `Signaled` or `TimedOut`; an invalidated device surfaces as
    /// `DeviceLost`.
    pub fn wait_ready(&self, timeout: Duration) -> Result<WaitOutcome, AudioError> {
        let mut inner = self.acquire_pump()?;
        if !inner.state.is_started() {
            return Err(AudioError::InvalidState {
                expected: "started",
                actual: inner.state,
            });
        }
        let stream = inner.stream()?;

        if self.ready(&mut inner, &stream)? {
            return Ok(WaitOutcome::Signaled);
        }

        let Some(signal) = inner.signal.as_ref() else {
            return self.poll_ready(&mut inner, &stream, timeout);
        };
        signal.reset();
        if self.ready(&mut inner, &stream)? {
            return Ok(WaitOutcome::Signaled);
        }

        let outcome = match inner.signal.as_ref() {
            Some(signal) => signal.wait(timeout),
            None => WaitOutcome::Abandoned,
        };
        match outcome {
            WaitOutcome::Abandoned => {
                inner.device_lost = true;
                log::warn!("session {}: wait abandoned, device lost", self.guid);
                Err(AudioError::DeviceLost(self.descriptor.id.clone()))
            }
            other => Ok(other),
        }
    }

    fn poll_ready(
        &self,
        inner: &mut SessionInner,
        stream: &NegotiatedStream,
        timeout: Duration,
    ) -> Result<WaitOutcome, AudioError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
            if self.ready(inner, stream)? {
                return Ok(WaitOutcome::Signaled);
            }
        }
    }

    fn ready(&self, inner: &mut SessionInner, stream: &NegotiatedStream) -> Result<bool, AudioError> {
        match self.descriptor.flow {
            DataFlow::Capture => Ok(Self::available_frames(inner)? > 0),
            DataFlow::Render => Ok(Self::free_frames(inner, stream)? >= stream.period_frames),
        }
    }

    /// Frames ready to read without blocking.
    pub fn available_frame_count(&self) -> Result<usize, AudioError> {
        let mut inner = self.acquire_pump()?;
        if self.descriptor.flow != DataFlow::Capture {
            return Err(AudioError::WrongDirection(self.descriptor.flow));
        }
        inner.stream()?;
        Self::available_frames(&mut inner)
    }

    /// Frames of free space in the render buffer.
    pub fn available_frame_space(&self) -> Result<usize, AudioError> {
        let mut inner = self.acquire_pump()?;
        if self.descriptor.flow != DataFlow::Render {
            return Err(AudioError::WrongDirection(self.descriptor.flow));
        }
        let stream = inner.stream()?;
        Self::free_frames(&mut inner, &stream)
    }

    /// Copy up to the available frames into `buf`.
    ///
    /// `buf.len()` must be a whole number of frames. A reported discontinuity
    /// is informational; the session keeps running.
    pub fn read(&self, buf: &mut [u8]) -> Result<CaptureRead, AudioError> {
        let mut inner = self.acquire_pump()?;
        if self.descriptor.flow != DataFlow::Capture {
            return Err(AudioError::WrongDirection(self.descriptor.flow));
        }
        let stream = inner.stream()?;
        let block_align = stream.format.block_align();
        check_aligned(buf.len(), block_align)?;
        if inner.state == SessionState::Initialized {
            return Err(AudioError::InvalidState {
                expected: "started or stopped",
                actual: inner.state,
            });
        }

        let packet = match inner.capture.as_mut() {
            Some(capture) => capture.read(buf, &stream.format),
            None => Err(AudioError::SessionClosed),
        };
        let packet = inner.note(packet)?;

        let bytes = stream.format.bytes_for(packet.frames);
        if packet.silent {
            buf[..bytes].fill(stream.format.silence_byte());
        }
        if packet.discontinuity {
            log::warn!("session {}: capture discontinuity before {} frames", self.guid, packet.frames);
        }

        Ok(CaptureRead {
            frames: packet.frames,
            bytes,
            flags: BufferFlags {
                silent: packet.silent,
                discontinuity: packet.discontinuity,
                silence_padded: false,
            },
        })
    }

    /// Queue up to the free space's worth of `buf`.
    ///
    /// `buf.len()` must be a whole number of frames. While the stream is
    /// running and the queued frames plus `buf` fall short of one device
    /// period, silence is appended up to the period so the device does not
    /// underrun. Writes before `start` are never padded.
    pub fn write(&self, buf: &[u8]) -> Result<RenderWrite, AudioError> {
        let mut inner = self.acquire_pump()?;
        if self.descriptor.flow != DataFlow::Render {
            return Err(AudioError::WrongDirection(self.descriptor.flow));
        }
        let stream = inner.stream()?;
        let block_align = stream.format.block_align();
        check_aligned(buf.len(), block_align)?;

        let free = Self::free_frames(&mut inner, &stream)?;
        let frames = stream.format.frames_in(buf.len()).min(free);
        let padded_frames = if inner.state == SessionState::Started {
            let queued = stream.buffer_frames - free;
            stream
                .period_frames
                .saturating_sub(queued + frames)
                .min(free - frames)
        } else {
            0
        };
        let bytes = stream.format.bytes_for(frames);

        if frames + padded_frames == 0 {
            return Ok(RenderWrite::default());
        }

        let written = match inner.render.as_mut() {
            Some(render) => render.write(&buf[..bytes], padded_frames, &stream.format),
            None => Err(AudioError::SessionClosed),
        };
        inner.note(written)?;

        if padded_frames > 0 {
            log::trace!("session {}: padded {} frames of silence", self.guid, padded_frames);
        }

        Ok(RenderWrite {
            frames,
            bytes,
            padded_frames,
            flags: BufferFlags {
                silent: false,
                discontinuity: false,
                silence_padded: padded_frames > 0,
            },
        })
    }

    // --- Internal helpers ---

    fn acquire_pump(&self) -> Result<MutexGuard<'_, SessionInner>, AudioError> {
        let inner = self.inner.try_lock().ok_or(AudioError::SessionBusy)?;
        inner.check_open()?;
        inner.check_device()?;
        Ok(inner)
    }

    fn available_frames(inner: &mut SessionInner) -> Result<usize, AudioError> {
        let available = match inner.capture.as_ref() {
            Some(capture) => capture.available_frames(),
            None => Err(AudioError::SessionClosed),
        };
        inner.note(available)
    }

    fn free_frames(inner: &mut SessionInner, stream: &NegotiatedStream) -> Result<usize, AudioError> {
        let padding = match inner.client.as_ref() {
            Some(client) => client.current_padding(),
            None => Err(AudioError::SessionClosed),
        };
        let padding = inner.note(padding)?;
        Ok(stream.buffer_frames.saturating_sub(padding))
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        log::debug!("session {}: {} -> {}", self.guid, inner.state, next);
        inner.state = next;
        *self.state.lock() = next;
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        let report = self.release();
        if !report.already_released {
            log::debug!("session {}: released on drop", self.guid);
        }
    }
}

impl std::fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSession")
            .field("guid", &self.guid)
            .field("device", &self.descriptor.id)
            .field("state", &self.state())
            .finish()
    }
}

enum SubClient {
    Capture(Box<dyn CaptureClient>),
    Render(Box<dyn RenderClient>),
}

fn check_aligned(len: usize, block_align: u16) -> Result<(), AudioError> {
    if len % block_align as usize != 0 {
        return Err(AudioError::MisalignedBuffer { len, block_align });
    }
    Ok(())
}

fn format_duration(format: FormatDescriptor, frames: usize) -> Duration {
    Duration::from_nanos((frames as u64 * 1_000_000_000) / u64::from(format.sample_rate()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::backend::simulated::{frame_index, ClockMode, SimulatedBackend, SimulatedEndpoint};
    use crate::models::format::{DeviceFormats, SampleRateRange};

    fn pcm_48k() -> FormatDescriptor {
        FormatDescriptor::pcm(48_000, 2, 16).unwrap()
    }

    fn shared(buffer_ms: u64) -> SessionConfig {
        SessionConfig {
            share_mode: ShareMode::Shared,
            buffer_duration: Duration::from_millis(buffer_ms),
            event_driven: true,
        }
    }

    fn backend_with(endpoint: SimulatedEndpoint) -> Arc<SimulatedBackend> {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_endpoint(endpoint);
        backend
    }

    fn open(backend: &SimulatedBackend, id: &str) -> AudioSession {
        let descriptor = backend.device(id).unwrap();
        AudioSession::open(backend, &descriptor).unwrap()
    }

    fn started_capture(backend: &SimulatedBackend, id: &str, buffer_ms: u64) -> AudioSession {
        let session = open(backend, id);
        session.initialize(&pcm_48k(), &shared(buffer_ms)).unwrap();
        session.start().unwrap();
        session
    }

    #[test]
    fn lifecycle_transitions() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = open(&backend, "mic");
        assert_eq!(session.state(), SessionState::Created);

        assert!(matches!(session.start(), Err(AudioError::InvalidState { .. })));

        let stream = session.initialize(&pcm_48k(), &shared(10)).unwrap();
        assert_eq!(stream.format, pcm_48k());
        assert_eq!(session.state(), SessionState::Initialized);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Started);
        session.start().unwrap();

        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        session.start().unwrap();
        assert_eq!(session.format(), Some(pcm_48k()));

        assert!(session.release().is_clean());
        assert_eq!(session.state(), SessionState::Released);
        assert!(matches!(session.start(), Err(AudioError::SessionClosed)));
        assert!(matches!(session.wait_ready(Duration::ZERO), Err(AudioError::SessionClosed)));
    }

    #[test]
    fn double_release_is_a_noop_and_leaks_nothing() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = started_capture(&backend, "mic", 10);
        assert!(backend.open_handle_count() > 0);

        let first = session.release();
        let second = session.release();

        assert!(first.is_clean() && !first.already_released);
        assert!(second.already_released && second.is_clean());
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn release_from_created_leaks_nothing() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        assert_eq!(backend.handle_counts().devices, 1);

        session.release();
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn drop_releases_handles() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        {
            let _session = started_capture(&backend, "mic", 10);
        }
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn release_failures_are_reported_not_thrown() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").fail_release(true));
        let session = started_capture(&backend, "mic", 10);

        let report = session.release();
        assert_eq!(report.failures.len(), 2);
        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn exclusive_without_exact_match_stays_created() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = open(&backend, "mic");
        let config = SessionConfig {
            share_mode: ShareMode::Exclusive,
            ..shared(10)
        };

        let want = FormatDescriptor::pcm(96_000, 2, 16).unwrap();
        assert!(matches!(
            session.initialize(&want, &config),
            Err(AudioError::FormatUnsupported(_))
        ));
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(backend.handle_counts().clients, 0);

        // Still usable with a supported format.
        session.initialize(&pcm_48k(), &config).unwrap();
    }

    #[test]
    fn exclusive_session_makes_device_busy() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let exclusive = open(&backend, "spk");
        exclusive
            .initialize(
                &pcm_48k(),
                &SessionConfig {
                    share_mode: ShareMode::Exclusive,
                    ..shared(10)
                },
            )
            .unwrap();

        let other = open(&backend, "spk");
        assert!(matches!(
            other.initialize(&pcm_48k(), &shared(10)),
            Err(AudioError::DeviceBusy(_))
        ));
        assert_eq!(other.state(), SessionState::Created);
    }

    #[test]
    fn shared_mode_falls_back_to_mix_format() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = open(&backend, "mic");
        let want = FormatDescriptor::pcm(96_000, 2, 16).unwrap();

        let stream = session.initialize(&want, &shared(10)).unwrap();
        assert_eq!(stream.format.sample_rate(), 48_000);
        assert_eq!(stream.format.bits_per_sample(), 32);
    }

    #[test]
    fn out_of_range_sample_rate_is_a_format_error() {
        let formats = DeviceFormats {
            sample_rates: SampleRateRange::new(8_000, 48_000),
            ..crate::backend::simulated::default_formats()
        };
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").formats(formats));
        let session = open(&backend, "mic");

        let want = FormatDescriptor::pcm(96_000, 2, 16).unwrap();
        assert!(matches!(session.initialize(&want, &shared(10)), Err(AudioError::Format(_))));
    }

    #[test]
    fn wait_times_out_without_device_activity() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = started_capture(&backend, "mic", 20);

        let start = Instant::now();
        assert_eq!(session.wait_ready(Duration::from_millis(50)).unwrap(), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn polling_session_times_out_and_wakes() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").packet_frames(480));
        let session = open(&backend, "mic");
        let config = SessionConfig {
            event_driven: false,
            ..shared(20)
        };
        session.initialize(&pcm_48k(), &config).unwrap();
        session.start().unwrap();

        assert_eq!(session.wait_ready(Duration::from_millis(10)).unwrap(), WaitOutcome::TimedOut);
        backend.tick("mic");
        assert_eq!(session.wait_ready(Duration::from_millis(10)).unwrap(), WaitOutcome::Signaled);
        assert_eq!(session.available_frame_count().unwrap(), 480);
    }

    #[test]
    fn realtime_capture_delivers_every_frame() {
        let backend = backend_with(
            SimulatedEndpoint::capture("mic", "Mic")
                .packet_frames(960)
                .clock(ClockMode::RealTime(Duration::from_millis(20))),
        );
        let session = started_capture(&backend, "mic", 40);
        let timeout = Duration::from_millis(200);

        let mut buf = vec![0u8; pcm_48k().bytes_for(960)];
        let mut total = 0;
        let mut discontinuities = 0;
        let mut expected_index = 0u64;

        for _ in 0..10 {
            assert_eq!(session.wait_ready(timeout).unwrap(), WaitOutcome::Signaled);
            let read = session.read(&mut buf).unwrap();
            assert_eq!(read.frames, 960);
            assert_eq!(read.bytes, read.frames * 4);
            for frame in buf[..read.bytes].chunks(4) {
                assert_eq!(frame_index(frame), expected_index);
                expected_index += 1;
            }
            total += read.frames;
            discontinuities += usize::from(read.flags.discontinuity);
        }

        assert_eq!(total, 9600);
        assert_eq!(discontinuities, 0);
        session.release();
    }

    #[test]
    fn discontinuity_is_flagged_not_fatal() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").packet_frames(480));
        let session = started_capture(&backend, "mic", 10);

        // Buffer holds 480 frames; the second packet overruns it.
        backend.tick("mic");
        backend.tick("mic");

        let mut buf = vec![0u8; pcm_48k().bytes_for(480)];
        let read = session.read(&mut buf).unwrap();
        assert!(read.flags.discontinuity);
        assert_eq!(session.state(), SessionState::Started);

        backend.tick("mic");
        let read = session.read(&mut buf).unwrap();
        assert_eq!(read.frames, 480);
        assert!(!read.flags.discontinuity);
    }

    #[test]
    fn silent_packets_are_zeroed_and_flagged() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").packet_frames(4).silent(true));
        let session = started_capture(&backend, "mic", 10);
        backend.tick("mic");

        let mut buf = vec![0xAAu8; 16];
        let read = session.read(&mut buf).unwrap();
        assert!(read.flags.silent);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn misaligned_read_copies_nothing() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").packet_frames(4));
        let session = started_capture(&backend, "mic", 10);
        backend.tick("mic");

        let mut buf = vec![0xAAu8; 7];
        assert_eq!(
            session.read(&mut buf),
            Err(AudioError::MisalignedBuffer { len: 7, block_align: 4 })
        );
        assert!(buf.iter().all(|&b| b == 0xAA));
        assert_eq!(session.available_frame_count().unwrap(), 4);
    }

    #[test]
    fn misaligned_write_copies_nothing() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        session.initialize(&pcm_48k(), &shared(20)).unwrap();

        assert!(matches!(session.write(&[1, 2, 3]), Err(AudioError::MisalignedBuffer { .. })));
        assert_eq!(session.available_frame_space().unwrap(), 960);
    }

    #[test]
    fn starving_render_write_is_padded_to_one_period() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        let stream = session.initialize(&pcm_48k(), &shared(20)).unwrap();
        assert_eq!(stream.period_frames, 480);
        session.start().unwrap();

        let data = vec![7u8; pcm_48k().bytes_for(100)];
        let written = session.write(&data).unwrap();
        assert_eq!(written.frames, 100);
        assert_eq!(written.bytes, 400);
        assert_eq!(written.padded_frames, 380);
        assert!(written.flags.silence_padded);
        assert_eq!(session.available_frame_space().unwrap(), 960 - 480);

        backend.tick("spk");
        let rendered = backend.rendered_bytes("spk");
        assert_eq!(rendered.len(), 480 * 4);
        assert!(rendered[..400].iter().all(|&b| b == 7));
        assert!(rendered[400..].iter().all(|&b| b == 0));
        assert_eq!(backend.underruns("spk"), 0);
    }

    #[test]
    fn short_writes_before_start_are_not_padded() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        session.initialize(&pcm_48k(), &shared(20)).unwrap();

        let first = session.write(&vec![1u8; pcm_48k().bytes_for(100)]).unwrap();
        let second = session.write(&vec![2u8; pcm_48k().bytes_for(100)]).unwrap();
        assert_eq!(first.padded_frames, 0);
        assert_eq!(second.padded_frames, 0);
        assert!(!second.flags.silence_padded);
        assert_eq!(session.available_frame_space().unwrap(), 960 - 200);

        session.start().unwrap();
        backend.tick("spk");
        let rendered = backend.rendered_bytes("spk");
        assert_eq!(rendered.len(), 200 * 4);
        assert!(rendered[..400].iter().all(|&b| b == 1));
        assert!(rendered[400..].iter().all(|&b| b == 2));
    }

    #[test]
    fn short_writes_behind_queued_audio_leave_no_gap() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        session.initialize(&pcm_48k(), &shared(20)).unwrap();
        session.start().unwrap();

        assert_eq!(session.write(&vec![1u8; pcm_48k().bytes_for(480)]).unwrap().padded_frames, 0);
        assert_eq!(session.write(&vec![2u8; pcm_48k().bytes_for(100)]).unwrap().padded_frames, 0);
        assert_eq!(session.write(&vec![3u8; pcm_48k().bytes_for(100)]).unwrap().padded_frames, 0);

        backend.tick("spk");
        backend.tick("spk");
        let rendered = backend.rendered_bytes("spk");
        assert_eq!(rendered.len(), 680 * 4);
        assert!(rendered[..1920].iter().all(|&b| b == 1));
        assert!(rendered[1920..2320].iter().all(|&b| b == 2));
        assert!(rendered[2320..].iter().all(|&b| b == 3));
    }

    fn pcm8_mono() -> FormatDescriptor {
        FormatDescriptor::pcm(48_000, 1, 8).unwrap()
    }

    fn pcm8_formats() -> DeviceFormats {
        DeviceFormats {
            supported: vec![pcm8_mono()],
            mix_format: None,
            sample_rates: SampleRateRange::default(),
        }
    }

    #[test]
    fn eight_bit_render_is_padded_with_midpoint_silence() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers").formats(pcm8_formats()));
        let session = open(&backend, "spk");
        session.initialize(&pcm8_mono(), &shared(20)).unwrap();
        session.start().unwrap();

        let written = session.write(&[0x90; 10]).unwrap();
        assert_eq!(written.padded_frames, 470);

        backend.tick("spk");
        let rendered = backend.rendered_bytes("spk");
        assert_eq!(rendered.len(), 480);
        assert!(rendered[..10].iter().all(|&b| b == 0x90));
        assert!(rendered[10..].iter().all(|&b| b == 0x80));
    }

    #[test]
    fn eight_bit_silent_capture_reads_midpoint() {
        let backend = backend_with(
            SimulatedEndpoint::capture("mic", "Mic")
                .formats(pcm8_formats())
                .packet_frames(48)
                .silent(true),
        );
        let session = open(&backend, "mic");
        session.initialize(&pcm8_mono(), &shared(10)).unwrap();
        session.start().unwrap();

        backend.tick("mic");
        let mut buf = [0u8; 48];
        let read = session.read(&mut buf).unwrap();
        assert_eq!(read.frames, 48);
        assert!(read.flags.silent);
        assert!(buf.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn render_write_is_capped_at_free_space() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        session.initialize(&pcm_48k(), &shared(20)).unwrap();

        let data = vec![1u8; pcm_48k().bytes_for(1500)];
        let written = session.write(&data).unwrap();
        assert_eq!(written.frames, 960);
        assert_eq!(written.padded_frames, 0);
        assert_eq!(session.available_frame_space().unwrap(), 0);

        let again = session.write(&data).unwrap();
        assert_eq!(again, RenderWrite::default());
    }

    #[test]
    fn render_wait_wakes_when_a_period_drains() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        session.initialize(&pcm_48k(), &shared(20)).unwrap();
        session.write(&vec![0u8; pcm_48k().bytes_for(960)]).unwrap();
        session.start().unwrap();

        assert_eq!(session.wait_ready(Duration::from_millis(5)).unwrap(), WaitOutcome::TimedOut);
        backend.tick("spk");
        assert_eq!(session.wait_ready(Duration::from_millis(5)).unwrap(), WaitOutcome::Signaled);
        assert_eq!(session.available_frame_space().unwrap(), 480);
    }

    #[test]
    fn direction_is_enforced() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = started_capture(&backend, "mic", 10);
        assert_eq!(session.write(&[0; 4]), Err(AudioError::WrongDirection(DataFlow::Capture)));
        assert!(matches!(session.available_frame_space(), Err(AudioError::WrongDirection(_))));
    }

    #[test]
    fn concurrent_pump_gets_session_busy() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").packet_frames(480));
        let session = Arc::new(started_capture(&backend, "mic", 20));

        let waiting = Arc::new(AtomicBool::new(false));
        let read_frames = Arc::new(AtomicUsize::new(0));

        let pump = {
            let session = Arc::clone(&session);
            let waiting = Arc::clone(&waiting);
            let read_frames = Arc::clone(&read_frames);
            thread::spawn(move || {
                waiting.store(true, Ordering::SeqCst);
                let outcome = loop {
                    match session.wait_ready(Duration::from_secs(5)) {
                        Err(AudioError::SessionBusy) => thread::yield_now(),
                        other => break other.unwrap(),
                    }
                };
                assert_eq!(outcome, WaitOutcome::Signaled);
                let mut buf = vec![0u8; 480 * 4];
                let read = session.read(&mut buf).unwrap();
                read_frames.fetch_add(read.frames, Ordering::SeqCst);
            })
        };

        while !waiting.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        // Poll until the pump thread holds the token.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = vec![0u8; 480 * 4];
        loop {
            match session.read(&mut buf) {
                Err(AudioError::SessionBusy) => break,
                Ok(read) => assert_eq!(read.frames, 0),
                Err(other) => panic!("unexpected error: {}", other),
            }
            assert!(Instant::now() < deadline, "pump thread never took the token");
            thread::sleep(Duration::from_millis(1));
        }

        backend.tick("mic");
        pump.join().unwrap();

        assert_eq!(read_frames.load(Ordering::SeqCst), 480);
        assert_eq!(session.available_frame_count().unwrap(), 0);
    }

    #[test]
    fn stop_waits_for_in_flight_pump() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = Arc::new(started_capture(&backend, "mic", 20));

        let pump = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.wait_ready(Duration::from_millis(100)))
        };
        thread::sleep(Duration::from_millis(20));

        session.stop().unwrap();
        assert_eq!(pump.join().unwrap(), Ok(WaitOutcome::TimedOut));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn device_removed_while_started() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = started_capture(&backend, "mic", 10);

        backend.remove_endpoint("mic");

        assert!(matches!(
            session.wait_ready(Duration::from_millis(50)),
            Err(AudioError::DeviceLost(_))
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(session.read(&mut buf), Err(AudioError::DeviceLost(_))));

        assert!(session.release().is_clean());
        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn device_removed_while_waiting_abandons_the_wait() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic"));
        let session = Arc::new(started_capture(&backend, "mic", 10));

        let pump = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.wait_ready(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        backend.remove_endpoint("mic");

        assert!(matches!(pump.join().unwrap(), Err(AudioError::DeviceLost(_))));
        assert!(session.release().is_clean());
    }

    #[test]
    fn start_after_removal_is_device_lost() {
        let backend = backend_with(SimulatedEndpoint::render("spk", "Speakers"));
        let session = open(&backend, "spk");
        session.initialize(&pcm_48k(), &shared(10)).unwrap();

        backend.remove_endpoint("spk");
        assert!(matches!(session.start(), Err(AudioError::DeviceLost(_))));
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[test]
    fn open_rejects_inactive_device() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").state(DeviceState::Disabled));
        let descriptor = backend.device("mic").unwrap();
        assert!(matches!(
            AudioSession::open(backend.as_ref(), &descriptor),
            Err(AudioError::DeviceLost(_))
        ));
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn timing_follows_negotiated_buffer() {
        let backend = backend_with(SimulatedEndpoint::capture("mic", "Mic").packet_frames(48));
        let session = open(&backend, "mic");
        let stream = session.initialize(&pcm_48k(), &shared(1)).unwrap();

        // Below the 3ms device minimum the request is rounded up.
        assert_eq!(stream.buffer_frames, 144);
        assert_relative_eq!(stream.buffer_duration.as_secs_f64(), 0.003, epsilon = 1e-9);
        assert_eq!(session.recommended_wait_timeout(), Some(Duration::from_millis(6)));
        assert_eq!(session.latency().unwrap(), Duration::from_millis(10));
    }
}
