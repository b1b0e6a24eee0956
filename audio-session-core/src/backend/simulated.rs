//! In-process audio backend.
//!
//! Endpoints are declared up front, each with its own formats, device period
//! and clock. A capture clock appends one packet per tick and a render clock
//! drains one packet per tick; ticks come either from a dedicated thread
//! (`ClockMode::RealTime`) or from [`SimulatedBackend::tick`].
//!
//! Every handle the backend gives out is counted until it is released, so the
//! backend doubles as a leak detector in tests.
//!
//! Captured frames carry their running frame index in little-endian order
//! (see [`frame_index`]) so gaps and duplicates are detectable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::device::{DataFlow, DeviceDescriptor, DeviceState, StateFilter};
use crate::models::error::AudioError;
use crate::models::format::{DeviceFormats, FormatDescriptor, SampleRateRange};
use crate::models::property::{PropertyKey, PKEY_DEVICE_ENUMERATOR_NAME, PKEY_DEVICE_FRIENDLY_NAME};
use crate::models::session::{DevicePeriod, ShareMode};
use crate::session::signal::DeviceNotifier;
use crate::traits::backend::{
    AudioBackend, AudioClient, CaptureClient, CapturePacket, DeviceHandle, PropertyStore, RenderClient, StreamParams,
};

/// How a simulated endpoint's hardware clock advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Only [`SimulatedBackend::tick`] advances the clock.
    Manual,
    /// A dedicated thread ticks at the given interval while the stream runs.
    RealTime(Duration),
}

/// Declaration of one simulated endpoint.
#[derive(Debug, Clone)]
pub struct SimulatedEndpoint {
    id: String,
    name: String,
    flow: DataFlow,
    state: DeviceState,
    enumerator_name: Option<String>,
    formats: DeviceFormats,
    period: DevicePeriod,
    packet_frames: Option<usize>,
    clock: ClockMode,
    silent: bool,
    fail_release: bool,
}

impl SimulatedEndpoint {
    pub fn capture(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id.into(), name.into(), DataFlow::Capture)
    }

    pub fn render(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id.into(), name.into(), DataFlow::Render)
    }

    fn new(id: String, name: String, flow: DataFlow) -> Self {
        Self {
            id,
            name,
            flow,
            state: DeviceState::Active,
            enumerator_name: None,
            formats: default_formats(),
            period: DevicePeriod {
                default: Duration::from_millis(10),
                minimum: Duration::from_millis(3),
            },
            packet_frames: None,
            clock: ClockMode::Manual,
            silent: false,
            fail_release: false,
        }
    }

    pub fn state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn enumerator_name(mut self, name: impl Into<String>) -> Self {
        self.enumerator_name = Some(name.into());
        self
    }

    pub fn formats(mut self, formats: DeviceFormats) -> Self {
        self.formats = formats;
        self
    }

    pub fn period(mut self, period: DevicePeriod) -> Self {
        self.period = period;
        self
    }

    /// Frames produced or consumed per clock tick (default: one device period).
    pub fn packet_frames(mut self, frames: usize) -> Self {
        self.packet_frames = Some(frames);
        self
    }

    pub fn clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Capture packets are flagged silent and zero-filled.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Device and client releases report an error after cleaning up.
    pub fn fail_release(mut self, fail: bool) -> Self {
        self.fail_release = fail;
        self
    }
}

/// 48 kHz stereo at 16/24 bit, 44.1 kHz/16 bit, with a 48 kHz/32 bit mix format.
pub fn default_formats() -> DeviceFormats {
    let pcm = |rate, channels, bits| FormatDescriptor::pcm(rate, channels, bits).ok();
    DeviceFormats {
        supported: [pcm(48_000, 2, 16), pcm(48_000, 2, 24), pcm(44_100, 2, 16)]
            .into_iter()
            .flatten()
            .collect(),
        mix_format: FormatDescriptor::extensible(48_000, 2, 32).ok(),
        sample_rates: SampleRateRange::default(),
    }
}

/// Decode the running frame index written into a captured frame.
pub fn frame_index(frame: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = frame.len().min(8);
    bytes[..n].copy_from_slice(&frame[..n]);
    u64::from_le_bytes(bytes)
}

/// Live handle counts per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleCounts {
    pub devices: usize,
    pub clients: usize,
    pub capture_clients: usize,
    pub render_clients: usize,
    pub property_stores: usize,
}

impl HandleCounts {
    pub fn total(&self) -> usize {
        self.devices + self.clients + self.capture_clients + self.render_clients + self.property_stores
    }
}

#[derive(Debug, Default)]
struct HandleCounters {
    devices: AtomicUsize,
    clients: AtomicUsize,
    capture_clients: AtomicUsize,
    render_clients: AtomicUsize,
    property_stores: AtomicUsize,
    /// Endpoint ids in the order their device handles were released.
    released_devices: Mutex<Vec<String>>,
}

impl HandleCounters {
    fn snapshot(&self) -> HandleCounts {
        HandleCounts {
            devices: self.devices.load(Ordering::SeqCst),
            clients: self.clients.load(Ordering::SeqCst),
            capture_clients: self.capture_clients.load(Ordering::SeqCst),
            render_clients: self.render_clients.load(Ordering::SeqCst),
            property_stores: self.property_stores.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Default)]
struct EndpointRuntime {
    exclusive: bool,
    shared_streams: usize,
    streams: Vec<Weak<Mutex<StreamState>>>,
}

#[derive(Debug)]
struct EndpointShared {
    config: SimulatedEndpoint,
    state: Mutex<DeviceState>,
    runtime: Mutex<EndpointRuntime>,
}

impl EndpointShared {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.config.id.clone(), self.config.flow, *self.state.lock())
    }

    fn live_streams(&self) -> Vec<Arc<Mutex<StreamState>>> {
        let mut runtime = self.runtime.lock();
        runtime.streams.retain(|w| w.strong_count() > 0);
        runtime.streams.iter().filter_map(Weak::upgrade).collect()
    }

    fn invalidate_streams(&self) {
        for stream in self.live_streams() {
            let mut s = stream.lock();
            s.invalidated = true;
            s.running = false;
            if let Some(notifier) = &s.notifier {
                notifier.abandon();
            }
        }
    }
}

#[derive(Debug)]
struct StreamState {
    flow: DataFlow,
    format: FormatDescriptor,
    capacity_frames: usize,
    packet_frames: usize,
    silent: bool,
    queue: VecDeque<u8>,
    pending_discontinuity: bool,
    running: bool,
    invalidated: bool,
    notifier: Option<DeviceNotifier>,
    next_frame: u64,
    rendered: Vec<u8>,
    underruns: u64,
}

impl StreamState {
    fn block_align(&self) -> usize {
        self.format.block_align() as usize
    }

    fn queued_frames(&self) -> usize {
        self.queue.len() / self.block_align()
    }

    fn check_valid(&self) -> Result<(), AudioError> {
        if self.invalidated {
            Err(AudioError::DeviceLost("simulated endpoint removed".into()))
        } else {
            Ok(())
        }
    }

    /// Advance the hardware clock by one packet.
    fn tick(&mut self) {
        if !self.running || self.invalidated {
            return;
        }
        let ba = self.block_align();
        let silence = self.format.silence_byte();

        match self.flow {
            DataFlow::Capture => {
                let free = self.capacity_frames.saturating_sub(self.queued_frames());
                let frames = self.packet_frames.min(free);
                if frames < self.packet_frames {
                    // Overrun: the device drops what does not fit.
                    self.pending_discontinuity = true;
                }
                for i in 0..frames as u64 {
                    let index = (self.next_frame + i).to_le_bytes();
                    for j in 0..ba {
                        self.queue.push_back(if self.silent { silence } else { index[j % 8] });
                    }
                }
                self.next_frame += self.packet_frames as u64;
            }
            DataFlow::Render => {
                let frames = self.packet_frames.min(self.queued_frames());
                if frames < self.packet_frames {
                    self.underruns += 1;
                }
                self.rendered.extend(self.queue.drain(..frames * ba));
            }
        }

        if let Some(notifier) = &self.notifier {
            notifier.signal();
        }
    }
}

/// Background thread standing in for a hardware clock.
struct ClockThread {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ClockThread {
    fn spawn(stream: Arc<Mutex<StreamState>>, interval: Duration) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("simulated-device-clock".into())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while flag.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    if !flag.load(Ordering::SeqCst) {
                        break;
                    }
                    stream.lock().tick();
                    next += interval;
                }
            })
            .map_err(|e| AudioError::Initialization(format!("failed to spawn clock thread: {}", e)))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClockThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Backend serving declared endpoints from memory.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    endpoints: Mutex<Vec<Arc<EndpointShared>>>,
    defaults: Mutex<HashMap<DataFlow, String>>,
    counters: Arc<HandleCounters>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&self, endpoint: SimulatedEndpoint) {
        let state = endpoint.state;
        self.endpoints.lock().push(Arc::new(EndpointShared {
            config: endpoint,
            state: Mutex::new(state),
            runtime: Mutex::new(EndpointRuntime::default()),
        }));
    }

    pub fn set_default(&self, flow: DataFlow, id: impl Into<String>) {
        self.defaults.lock().insert(flow, id.into());
    }

    /// Unplug an endpoint; running streams on it are invalidated.
    pub fn remove_endpoint(&self, id: &str) {
        self.set_state(id, DeviceState::NotPresent);
    }

    pub fn set_state(&self, id: &str, state: DeviceState) {
        if let Some(endpoint) = self.find(id) {
            *endpoint.state.lock() = state;
            if state != DeviceState::Active {
                endpoint.invalidate_streams();
            }
        }
    }

    /// Advance the clock of every running stream on `id` by one packet.
    pub fn tick(&self, id: &str) {
        if let Some(endpoint) = self.find(id) {
            for stream in endpoint.live_streams() {
                stream.lock().tick();
            }
        }
    }

    /// Bytes render streams on `id` have played so far.
    pub fn rendered_bytes(&self, id: &str) -> Vec<u8> {
        self.find(id)
            .map(|e| e.live_streams().iter().flat_map(|s| s.lock().rendered.clone()).collect())
            .unwrap_or_default()
    }

    /// Render clock ticks that found less than a packet queued.
    pub fn underruns(&self, id: &str) -> u64 {
        self.find(id)
            .map(|e| e.live_streams().iter().map(|s| s.lock().underruns).sum())
            .unwrap_or(0)
    }

    pub fn handle_counts(&self) -> HandleCounts {
        self.counters.snapshot()
    }

    pub fn open_handle_count(&self) -> usize {
        self.counters.snapshot().total()
    }

    /// Endpoint ids whose device handles were released, oldest first.
    pub fn released_devices(&self) -> Vec<String> {
        self.counters.released_devices.lock().clone()
    }

    fn find(&self, id: &str) -> Option<Arc<EndpointShared>> {
        self.endpoints.lock().iter().find(|e| e.config.id == id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<EndpointShared>, AudioError> {
        self.find(id).ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
    }
}

impl AudioBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn enumerate(&self, flow: DataFlow, filter: StateFilter) -> Result<Vec<DeviceDescriptor>, AudioError> {
        Ok(self
            .endpoints
            .lock()
            .iter()
            .map(|e| e.descriptor())
            .filter(|d| d.flow == flow && filter.admits(d.state))
            .collect())
    }

    fn device(&self, id: &str) -> Result<DeviceDescriptor, AudioError> {
        self.require(id).map(|e| e.descriptor())
    }

    fn default_endpoint(&self, flow: DataFlow) -> Result<DeviceDescriptor, AudioError> {
        let configured = self.defaults.lock().get(&flow).cloned();
        if let Some(id) = configured {
            let device = self.device(&id)?;
            if device.is_active() {
                return Ok(device);
            }
        }
        self.enumerate(flow, StateFilter::Active)?
            .into_iter()
            .next()
            .ok_or_else(|| AudioError::DeviceNotFound(format!("no default {:?} endpoint", flow)))
    }

    fn open_property_store(&self, id: &str) -> Result<Box<dyn PropertyStore>, AudioError> {
        let endpoint = self.require(id)?;
        let mut properties = HashMap::new();
        properties.insert(PKEY_DEVICE_FRIENDLY_NAME, endpoint.config.name.clone());
        if let Some(name) = &endpoint.config.enumerator_name {
            properties.insert(PKEY_DEVICE_ENUMERATOR_NAME, name.clone());
        }

        self.counters.property_stores.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedPropertyStore {
            properties,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn open_device(&self, id: &str) -> Result<Box<dyn DeviceHandle>, AudioError> {
        let endpoint = self.require(id)?;
        self.counters.devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedDevice {
            endpoint,
            counters: Arc::clone(&self.counters),
            released: false,
        }))
    }
}

fn release_result(config: &SimulatedEndpoint) -> Result<(), AudioError> {
    if config.fail_release {
        Err(AudioError::Initialization(format!("{}: simulated release failure", config.id)))
    } else {
        Ok(())
    }
}

struct SimulatedPropertyStore {
    properties: HashMap<PropertyKey, String>,
    counters: Arc<HandleCounters>,
}

impl PropertyStore for SimulatedPropertyStore {
    fn get_string(&self, key: &PropertyKey) -> Result<String, AudioError> {
        self.properties
            .get(key)
            .cloned()
            .ok_or_else(|| AudioError::PropertyUnavailable(key.to_string()))
    }
}

impl Drop for SimulatedPropertyStore {
    fn drop(&mut self) {
        self.counters.property_stores.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SimulatedDevice {
    endpoint: Arc<EndpointShared>,
    counters: Arc<HandleCounters>,
    released: bool,
}

impl DeviceHandle for SimulatedDevice {
    fn id(&self) -> &str {
        &self.endpoint.config.id
    }

    fn flow(&self) -> DataFlow {
        self.endpoint.config.flow
    }

    fn state(&self) -> Result<DeviceState, AudioError> {
        if self.released {
            return Err(AudioError::SessionClosed);
        }
        Ok(*self.endpoint.state.lock())
    }

    fn activate(&mut self) -> Result<Box<dyn AudioClient>, AudioError> {
        let state = self.state()?;
        self.endpoint.descriptor().ensure_active(state)?;

        self.counters.clients.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedClient {
            endpoint: Arc::clone(&self.endpoint),
            counters: Arc::clone(&self.counters),
            stream: None,
            claimed: None,
            clock: None,
            released: false,
        }))
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.counters.devices.fetch_sub(1, Ordering::SeqCst);
        self.counters.released_devices.lock().push(self.endpoint.config.id.clone());
        release_result(&self.endpoint.config)
    }
}

struct SimulatedClient {
    endpoint: Arc<EndpointShared>,
    counters: Arc<HandleCounters>,
    stream: Option<Arc<Mutex<StreamState>>>,
    claimed: Option<ShareMode>,
    clock: Option<ClockThread>,
    released: bool,
}

impl SimulatedClient {
    fn stream(&self) -> Result<&Arc<Mutex<StreamState>>, AudioError> {
        if self.released {
            return Err(AudioError::SessionClosed);
        }
        self.stream
            .as_ref()
            .ok_or_else(|| AudioError::Initialization("stream not initialized".into()))
    }

    fn format_accepted(&self, mode: ShareMode, format: &FormatDescriptor) -> bool {
        let formats = &self.endpoint.config.formats;
        let listed = formats.supported.iter().any(|f| f.same_layout(format));
        match mode {
            ShareMode::Exclusive => listed,
            ShareMode::Shared => listed || formats.mix_format.is_some_and(|m| m.same_layout(format)),
        }
    }

    fn claim(&mut self, mode: ShareMode) -> Result<(), AudioError> {
        let mut runtime = self.endpoint.runtime.lock();
        let busy = runtime.exclusive || (mode == ShareMode::Exclusive && runtime.shared_streams > 0);
        if busy {
            return Err(AudioError::DeviceBusy(self.endpoint.config.id.clone()));
        }
        match mode {
            ShareMode::Exclusive => runtime.exclusive = true,
            ShareMode::Shared => runtime.shared_streams += 1,
        }
        self.claimed = Some(mode);
        Ok(())
    }

    fn unclaim(&mut self) {
        if let Some(mode) = self.claimed.take() {
            let mut runtime = self.endpoint.runtime.lock();
            match mode {
                ShareMode::Exclusive => runtime.exclusive = false,
                ShareMode::Shared => runtime.shared_streams = runtime.shared_streams.saturating_sub(1),
            }
        }
    }

    fn stop_clock(&mut self) {
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }
    }
}

impl AudioClient for SimulatedClient {
    fn formats(&self) -> Result<DeviceFormats, AudioError> {
        Ok(self.endpoint.config.formats.clone())
    }

    fn device_period(&self) -> Result<DevicePeriod, AudioError> {
        Ok(self.endpoint.config.period)
    }

    fn initialize(&mut self, params: &StreamParams) -> Result<(), AudioError> {
        if self.released {
            return Err(AudioError::SessionClosed);
        }
        if self.stream.is_some() {
            return Err(AudioError::Initialization("stream already initialized".into()));
        }
        let descriptor = self.endpoint.descriptor();
        descriptor.ensure_active(descriptor.state)?;

        if !self.format_accepted(params.share_mode, &params.format) {
            return Err(AudioError::FormatUnsupported(params.format.to_string()));
        }
        self.claim(params.share_mode)?;

        let config = &self.endpoint.config;
        let format = params.format;
        let requested = params.buffer_duration.max(config.period.minimum);
        let packet_frames = config
            .packet_frames
            .unwrap_or_else(|| format.frames_for_duration(config.period.default))
            .max(1);
        let capacity_frames = format.frames_for_duration(requested).max(packet_frames);

        let stream = Arc::new(Mutex::new(StreamState {
            flow: config.flow,
            format,
            capacity_frames,
            packet_frames,
            silent: config.silent,
            queue: VecDeque::with_capacity(format.bytes_for(capacity_frames)),
            pending_discontinuity: false,
            running: false,
            invalidated: false,
            notifier: None,
            next_frame: 0,
            rendered: Vec::new(),
            underruns: 0,
        }));
        self.endpoint.runtime.lock().streams.push(Arc::downgrade(&stream));
        self.stream = Some(stream);
        Ok(())
    }

    fn buffer_frame_count(&self) -> Result<usize, AudioError> {
        Ok(self.stream()?.lock().capacity_frames)
    }

    fn current_padding(&self) -> Result<usize, AudioError> {
        let stream = self.stream()?.lock();
        stream.check_valid()?;
        Ok(stream.queued_frames())
    }

    fn stream_latency(&self) -> Result<Duration, AudioError> {
        self.stream()?;
        Ok(self.endpoint.config.period.default)
    }

    fn set_event_notifier(&mut self, notifier: DeviceNotifier) -> Result<(), AudioError> {
        let mut stream = self.stream()?.lock();
        if stream.invalidated {
            notifier.abandon();
        }
        stream.notifier = Some(notifier);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        let stream = Arc::clone(self.stream()?);
        {
            let mut s = stream.lock();
            s.check_valid()?;
            s.running = true;
        }
        if let ClockMode::RealTime(interval) = self.endpoint.config.clock {
            if self.clock.is_none() {
                self.clock = Some(ClockThread::spawn(stream, interval)?);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.stream()?.lock().running = false;
        self.stop_clock();
        Ok(())
    }

    fn capture_client(&mut self) -> Result<Box<dyn CaptureClient>, AudioError> {
        if self.endpoint.config.flow != DataFlow::Capture {
            return Err(AudioError::Initialization("render endpoint has no capture client".into()));
        }
        let stream = Arc::clone(self.stream()?);
        self.counters.capture_clients.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedCaptureClient {
            stream,
            counters: Arc::clone(&self.counters),
            released: false,
        }))
    }

    fn render_client(&mut self) -> Result<Box<dyn RenderClient>, AudioError> {
        if self.endpoint.config.flow != DataFlow::Render {
            return Err(AudioError::Initialization("capture endpoint has no render client".into()));
        }
        let stream = Arc::clone(self.stream()?);
        self.counters.render_clients.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedRenderClient {
            stream,
            counters: Arc::clone(&self.counters),
            released: false,
        }))
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if self.released {
            return Ok(());
        }
        self.stop_clock();
        if let Some(stream) = self.stream.take() {
            let mut s = stream.lock();
            s.running = false;
            s.notifier = None;
        }
        self.unclaim();
        self.released = true;
        self.counters.clients.fetch_sub(1, Ordering::SeqCst);
        release_result(&self.endpoint.config)
    }
}

impl Drop for SimulatedClient {
    fn drop(&mut self) {
        self.stop_clock();
        self.unclaim();
    }
}

struct SimulatedCaptureClient {
    stream: Arc<Mutex<StreamState>>,
    counters: Arc<HandleCounters>,
    released: bool,
}

impl CaptureClient for SimulatedCaptureClient {
    fn available_frames(&self) -> Result<usize, AudioError> {
        let stream = self.stream.lock();
        stream.check_valid()?;
        Ok(stream.queued_frames())
    }

    fn read(&mut self, dst: &mut [u8], format: &FormatDescriptor) -> Result<CapturePacket, AudioError> {
        let mut stream = self.stream.lock();
        stream.check_valid()?;
        let block_align = format.block_align() as usize;

        let frames = (dst.len() / block_align).min(stream.queued_frames());
        let bytes = frames * block_align;
        for (slot, byte) in dst[..bytes].iter_mut().zip(stream.queue.drain(..bytes)) {
            *slot = byte;
        }

        let discontinuity = frames > 0 && std::mem::take(&mut stream.pending_discontinuity);
        Ok(CapturePacket {
            frames,
            silent: frames > 0 && stream.silent,
            discontinuity,
        })
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if !self.released {
            self.released = true;
            self.counters.capture_clients.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct SimulatedRenderClient {
    stream: Arc<Mutex<StreamState>>,
    counters: Arc<HandleCounters>,
    released: bool,
}

impl RenderClient for SimulatedRenderClient {
    fn write(&mut self, src: &[u8], silence_frames: usize, format: &FormatDescriptor) -> Result<(), AudioError> {
        let mut stream = self.stream.lock();
        stream.check_valid()?;
        let block_align = format.block_align() as usize;

        let frames = src.len() / block_align + silence_frames;
        if stream.queued_frames() + frames > stream.capacity_frames {
            return Err(AudioError::Initialization(format!(
                "render write of {} frames exceeds free space",
                frames
            )));
        }
        stream.queue.extend(src.iter().copied());
        stream.queue.extend(std::iter::repeat(format.silence_byte()).take(silence_frames * block_align));
        Ok(())
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if !self.released {
            self.released = true;
            self.counters.render_clients.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mode: ShareMode) -> StreamParams {
        StreamParams {
            share_mode: mode,
            format: FormatDescriptor::pcm(48_000, 2, 16).unwrap(),
            buffer_duration: Duration::from_millis(20),
            periodicity: Duration::ZERO,
            event_driven: true,
            session_guid: uuid::Uuid::new_v4(),
        }
    }

    #[test]
    fn exclusive_stream_blocks_others() {
        let backend = SimulatedBackend::new();
        backend.add_endpoint(SimulatedEndpoint::capture("mic", "Mic"));

        let mut first = backend.open_device("mic").unwrap().activate().unwrap();
        first.initialize(&params(ShareMode::Exclusive)).unwrap();

        let mut second = backend.open_device("mic").unwrap().activate().unwrap();
        assert!(matches!(
            second.initialize(&params(ShareMode::Shared)),
            Err(AudioError::DeviceBusy(_))
        ));

        first.release().unwrap();
        second.initialize(&params(ShareMode::Shared)).unwrap();
    }

    #[test]
    fn capture_tick_writes_indexed_frames() {
        let backend = SimulatedBackend::new();
        backend.add_endpoint(SimulatedEndpoint::capture("mic", "Mic").packet_frames(4));

        let mut device = backend.open_device("mic").unwrap();
        let mut client = device.activate().unwrap();
        client.initialize(&params(ShareMode::Shared)).unwrap();
        let mut capture = client.capture_client().unwrap();
        client.start().unwrap();

        backend.tick("mic");
        assert_eq!(capture.available_frames().unwrap(), 4);

        let mut buf = [0u8; 16];
        let packet = capture.read(&mut buf, &params(ShareMode::Shared).format).unwrap();
        assert_eq!(packet.frames, 4);
        let indices: Vec<u64> = buf.chunks(4).map(frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        capture.release().unwrap();
        client.release().unwrap();
        device.release().unwrap();
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn capture_overrun_flags_discontinuity() {
        let backend = SimulatedBackend::new();
        // 20ms buffer at 48kHz holds 960 frames; packets of 600 overflow on the second tick.
        backend.add_endpoint(SimulatedEndpoint::capture("mic", "Mic").packet_frames(600));

        let mut client = backend.open_device("mic").unwrap().activate().unwrap();
        client.initialize(&params(ShareMode::Shared)).unwrap();
        let mut capture = client.capture_client().unwrap();
        client.start().unwrap();

        backend.tick("mic");
        backend.tick("mic");

        let mut buf = vec![0u8; 960 * 4];
        let packet = capture.read(&mut buf, &params(ShareMode::Shared).format).unwrap();
        assert_eq!(packet.frames, 960);
        assert!(packet.discontinuity);
    }

    #[test]
    fn removal_invalidates_streams() {
        let backend = SimulatedBackend::new();
        backend.add_endpoint(SimulatedEndpoint::render("spk", "Speakers"));

        let mut client = backend.open_device("spk").unwrap().activate().unwrap();
        client.initialize(&params(ShareMode::Shared)).unwrap();
        client.start().unwrap();

        backend.remove_endpoint("spk");
        assert!(matches!(client.current_padding(), Err(AudioError::DeviceLost(_))));
        assert_eq!(backend.device("spk").unwrap().state, DeviceState::NotPresent);
    }
}
