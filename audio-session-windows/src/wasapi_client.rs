//! `IMMDevice` and `IAudioClient` behind the core device and client traits.
//!
//! Event-driven streams get an auto-reset Win32 event registered with
//! `SetEventHandle`. A relay thread waits on it and forwards each completion to
//! the session's [`DeviceNotifier`]; while the event is quiet the relay probes
//! the client so an invalidated device abandons the session's wait instead of
//! leaving it to time out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use windows::core::GUID;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::{CoTaskMemFree, CLSCTX_ALL};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

use audio_session_core::models::device::{DataFlow, DeviceDescriptor, DeviceState};
use audio_session_core::models::error::AudioError;
use audio_session_core::models::format::{DeviceFormats, FormatDescriptor, FormatTag, SampleRateRange};
use audio_session_core::models::session::{DevicePeriod, ShareMode};
use audio_session_core::processing::wave_format;
use audio_session_core::session::signal::DeviceNotifier;
use audio_session_core::traits::backend::{AudioClient, CaptureClient, DeviceHandle, RenderClient, StreamParams};

use crate::com::{ensure_com, from_hns, map_error, to_hns};
use crate::wasapi_stream::{WasapiCaptureClient, WasapiRenderClient};

/// How long the relay waits on the event before probing the device.
const RELAY_PROBE_INTERVAL_MS: u32 = 100;

/// Sample rates probed when building a device's format list.
const PROBE_RATES: [u32; 9] = [8_000, 16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 192_000];

/// Bit depths probed when building a device's format list.
const PROBE_BITS: [u16; 3] = [16, 24, 32];

fn share_mode(mode: ShareMode) -> AUDCLNT_SHAREMODE {
    match mode {
        ShareMode::Shared => AUDCLNT_SHAREMODE_SHARED,
        ShareMode::Exclusive => AUDCLNT_SHAREMODE_EXCLUSIVE,
    }
}

/// Open endpoint handle.
pub struct WasapiDevice {
    device: Option<IMMDevice>,
    descriptor: DeviceDescriptor,
}

// SAFETY: MMDevice objects are created in the multithreaded apartment and are
// free-threaded there; the handle is only used through `&mut self`.
unsafe impl Send for WasapiDevice {}

impl WasapiDevice {
    pub(crate) fn new(device: IMMDevice, descriptor: DeviceDescriptor) -> Self {
        Self {
            device: Some(device),
            descriptor,
        }
    }

    fn device(&self) -> Result<&IMMDevice, AudioError> {
        self.device.as_ref().ok_or(AudioError::SessionClosed)
    }
}

impl DeviceHandle for WasapiDevice {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn flow(&self) -> DataFlow {
        self.descriptor.flow
    }

    fn state(&self) -> Result<DeviceState, AudioError> {
        ensure_com()?;
        let state = unsafe { self.device()?.GetState() }.map_err(|e| map_error("IMMDevice::GetState", e))?;
        Ok(DeviceState::from_mask_bit(state.0).unwrap_or(DeviceState::NotPresent))
    }

    fn activate(&mut self) -> Result<Box<dyn AudioClient>, AudioError> {
        ensure_com()?;
        let device = self.device()?.clone();
        let client = activate(&device)?;
        Ok(Box::new(WasapiClient {
            device,
            descriptor: self.descriptor.clone(),
            client: Some(client),
            event_driven: false,
            relay: None,
        }))
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.device = None;
        Ok(())
    }
}

fn activate(device: &IMMDevice) -> Result<IAudioClient, AudioError> {
    unsafe { device.Activate::<IAudioClient>(CLSCTX_ALL, None) }.map_err(|e| map_error("IMMDevice::Activate", e))
}

/// Stream client for one session.
pub struct WasapiClient {
    device: IMMDevice,
    descriptor: DeviceDescriptor,
    client: Option<IAudioClient>,
    event_driven: bool,
    relay: Option<EventRelay>,
}

// SAFETY: See `WasapiDevice`. The relay thread holds its own reference to the
// client and only calls `GetCurrentPadding`, which is thread-safe.
unsafe impl Send for WasapiClient {}

impl WasapiClient {
    fn client(&self) -> Result<&IAudioClient, AudioError> {
        self.client.as_ref().ok_or(AudioError::SessionClosed)
    }

    fn mix_format(&self) -> Result<Option<FormatDescriptor>, AudioError> {
        let client = self.client()?;
        unsafe {
            let ptr = client.GetMixFormat().map_err(|e| map_error("GetMixFormat", e))?;
            if ptr.is_null() {
                return Ok(None);
            }
            let rate = (*ptr).nSamplesPerSec;
            let channels = (*ptr).nChannels;
            let len = wave_format::WAVEFORMATEX_SIZE + (*ptr).cbSize as usize;
            let raw = std::slice::from_raw_parts(ptr as *const u8, len);

            let mix = match wave_format::decode(raw) {
                Ok(format) => Some(format),
                // The engine usually mixes in float; the stream is opened as
                // 32-bit integer and converted by the audio engine.
                Err(_) => FormatDescriptor::extensible(rate, channels, 32).ok(),
            };
            CoTaskMemFree(Some(ptr as *const _));
            Ok(mix)
        }
    }

    fn is_supported(&self, mode: ShareMode, format: &FormatDescriptor) -> Result<bool, AudioError> {
        let client = self.client()?;
        let bytes = wave_format::encode(format);
        let pformat = bytes.as_ptr() as *const WAVEFORMATEX;
        unsafe {
            let hr = match mode {
                ShareMode::Exclusive => client.IsFormatSupported(share_mode(mode), pformat, None),
                ShareMode::Shared => {
                    let mut closest: *mut WAVEFORMATEX = std::ptr::null_mut();
                    let hr = client.IsFormatSupported(
                        share_mode(mode),
                        pformat,
                        Some(&mut closest as *mut *mut WAVEFORMATEX),
                    );
                    if !closest.is_null() {
                        CoTaskMemFree(Some(closest as *const _));
                    }
                    hr
                }
            };
            if hr == AUDCLNT_E_DEVICE_INVALIDATED {
                return Err(AudioError::DeviceLost(self.descriptor.id.clone()));
            }
            // S_FALSE means "only a closest match", which is not a match.
            Ok(hr.0 == 0)
        }
    }

    fn initialize_once(
        client: &IAudioClient,
        params: &StreamParams,
        buffer: i64,
        period: i64,
    ) -> windows::core::Result<()> {
        let mut flags = AUDCLNT_STREAMFLAGS_NOPERSIST;
        if params.event_driven {
            flags |= AUDCLNT_STREAMFLAGS_EVENTCALLBACK;
        }
        if params.share_mode == ShareMode::Shared {
            flags |= AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM | AUDCLNT_STREAMFLAGS_SRC_DEFAULT_QUALITY;
        }
        let bytes = wave_format::encode(&params.format);
        let guid = GUID::from_u128(params.session_guid.as_u128());
        unsafe {
            client.Initialize(
                share_mode(params.share_mode),
                flags,
                buffer,
                period,
                bytes.as_ptr() as *const WAVEFORMATEX,
                Some(&guid as *const GUID),
            )
        }
    }

    fn stop_relay(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.stop();
        }
    }
}

impl AudioClient for WasapiClient {
    fn formats(&self) -> Result<DeviceFormats, AudioError> {
        ensure_com()?;
        let mix_format = self.mix_format()?;
        let channels = mix_format.map(|f| f.channels()).unwrap_or(2);

        let mut supported = Vec::new();
        for rate in PROBE_RATES {
            for bits in PROBE_BITS {
                let Ok(candidate) = FormatDescriptor::pcm(rate, channels, bits) else {
                    continue;
                };
                let wire = if bits > 16 || channels > 2 {
                    candidate.with_tag(FormatTag::Extensible)
                } else {
                    candidate
                };
                if self.is_supported(ShareMode::Exclusive, &wire)? || self.is_supported(ShareMode::Shared, &wire)? {
                    supported.push(wire);
                }
            }
        }

        Ok(DeviceFormats {
            supported,
            mix_format,
            sample_rates: SampleRateRange::default(),
        })
    }

    fn device_period(&self) -> Result<DevicePeriod, AudioError> {
        ensure_com()?;
        let mut default = 0i64;
        let mut minimum = 0i64;
        unsafe { self.client()?.GetDevicePeriod(Some(&mut default as *mut i64), Some(&mut minimum as *mut i64)) }
            .map_err(|e| map_error("GetDevicePeriod", e))?;
        Ok(DevicePeriod {
            default: from_hns(default),
            minimum: from_hns(minimum),
        })
    }

    fn initialize(&mut self, params: &StreamParams) -> Result<(), AudioError> {
        ensure_com()?;
        let buffer = to_hns(params.buffer_duration);
        let period = to_hns(params.periodicity);

        let client = self.client()?.clone();
        match Self::initialize_once(&client, params, buffer, period) {
            Ok(()) => {}
            Err(e) if e.code() == AUDCLNT_E_BUFFER_SIZE_NOT_ALIGNED => {
                // Exclusive mode wants a buffer the hardware can align; ask
                // for the size it proposed on a fresh client.
                let frames = unsafe { client.GetBufferSize() }.map_err(|e| map_error("GetBufferSize", e))?;
                let aligned =
                    (10_000_000f64 * f64::from(frames) / f64::from(params.format.sample_rate()) + 0.5) as i64;
                log::debug!("{}: realigning buffer to {} frames", self.descriptor.id, frames);

                let fresh = activate(&self.device)?;
                Self::initialize_once(&fresh, params, aligned, aligned)
                    .map_err(|e| map_error("IAudioClient::Initialize", e))?;
                self.client = Some(fresh);
            }
            Err(e) => return Err(map_error("IAudioClient::Initialize", e)),
        }

        log::debug!("{}: initialized {} ({:?})", self.descriptor.id, params.format, params.share_mode);
        self.event_driven = params.event_driven;
        Ok(())
    }

    fn buffer_frame_count(&self) -> Result<usize, AudioError> {
        let frames = unsafe { self.client()?.GetBufferSize() }.map_err(|e| map_error("GetBufferSize", e))?;
        Ok(frames as usize)
    }

    fn current_padding(&self) -> Result<usize, AudioError> {
        let frames =
            unsafe { self.client()?.GetCurrentPadding() }.map_err(|e| map_error("GetCurrentPadding", e))?;
        Ok(frames as usize)
    }

    fn stream_latency(&self) -> Result<Duration, AudioError> {
        let hns = unsafe { self.client()?.GetStreamLatency() }.map_err(|e| map_error("GetStreamLatency", e))?;
        Ok(from_hns(hns))
    }

    fn set_event_notifier(&mut self, notifier: DeviceNotifier) -> Result<(), AudioError> {
        if !self.event_driven {
            return Err(AudioError::Initialization("stream was not initialized for events".into()));
        }
        self.stop_relay();
        let client = self.client()?.clone();
        self.relay = Some(EventRelay::spawn(client, notifier, &self.descriptor.id)?);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        ensure_com()?;
        unsafe { self.client()?.Start() }.map_err(|e| map_error("IAudioClient::Start", e))
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        ensure_com()?;
        unsafe { self.client()?.Stop() }.map_err(|e| map_error("IAudioClient::Stop", e))
    }

    fn capture_client(&mut self) -> Result<Box<dyn CaptureClient>, AudioError> {
        let client = self.client()?;
        let capture: IAudioCaptureClient =
            unsafe { client.GetService() }.map_err(|e| map_error("GetService(IAudioCaptureClient)", e))?;
        Ok(Box::new(WasapiCaptureClient::new(capture, client.clone())))
    }

    fn render_client(&mut self) -> Result<Box<dyn RenderClient>, AudioError> {
        let client = self.client()?;
        let render: IAudioRenderClient =
            unsafe { client.GetService() }.map_err(|e| map_error("GetService(IAudioRenderClient)", e))?;
        Ok(Box::new(WasapiRenderClient::new(render)))
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.stop_relay();
        if let Some(client) = self.client.take() {
            // Stopping a stopped stream returns S_FALSE.
            unsafe { client.Stop() }.ok();
        }
        Ok(())
    }
}

impl Drop for WasapiClient {
    fn drop(&mut self) {
        self.stop_relay();
    }
}

/// Owned Win32 event handle.
struct OwnedEvent(HANDLE);

// SAFETY: Event handles may be waited on and closed from any thread.
unsafe impl Send for OwnedEvent {}
unsafe impl Sync for OwnedEvent {}

impl Drop for OwnedEvent {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0).ok();
        }
    }
}

struct SendClient(IAudioClient);

// SAFETY: The client lives in the multithreaded apartment.
unsafe impl Send for SendClient {}

/// Thread forwarding device completion events to a [`DeviceNotifier`].
struct EventRelay {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventRelay {
    fn spawn(client: IAudioClient, notifier: DeviceNotifier, device_id: &str) -> Result<Self, AudioError> {
        let event = unsafe { CreateEventW(None, false, false, None) }
            .map_err(|e| AudioError::Initialization(format!("CreateEventW failed: {}", e)))?;
        let event = Arc::new(OwnedEvent(event));
        unsafe { client.SetEventHandle(event.0) }.map_err(|e| map_error("SetEventHandle", e))?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let client = SendClient(client);
        let device_id = device_id.to_string();

        let handle = thread::Builder::new()
            .name("wasapi-event-relay".into())
            .spawn(move || {
                let client = client;
                if let Err(e) = ensure_com() {
                    log::error!("{}: event relay has no COM apartment: {}", device_id, e);
                    notifier.abandon();
                    return;
                }
                while flag.load(Ordering::SeqCst) {
                    let wait = unsafe { WaitForSingleObject(event.0, RELAY_PROBE_INTERVAL_MS) };
                    if wait == WAIT_OBJECT_0 {
                        notifier.signal();
                        continue;
                    }
                    if let Err(e) = unsafe { client.0.GetCurrentPadding() } {
                        if e.code() == AUDCLNT_E_DEVICE_INVALIDATED {
                            log::warn!("{}: device invalidated", device_id);
                            notifier.abandon();
                            break;
                        }
                    }
                }
            })
            .map_err(|e| AudioError::Initialization(format!("failed to spawn event relay: {}", e)))?;

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

impl Drop for EventRelay {
    fn drop(&mut self) {
        self.stop();
    }
}
