//! Capture and render sub-clients.
//!
//! WASAPI hands out capture data a packet at a time and each packet must be
//! released whole, so the capture client stages packets that do not fit in
//! the caller's buffer and serves them on the next read.

use std::collections::VecDeque;

use windows::Win32::Media::Audio::*;

use audio_session_core::models::error::AudioError;
use audio_session_core::models::format::FormatDescriptor;
use audio_session_core::traits::backend::{CaptureClient, CapturePacket, RenderClient};

use crate::com::map_error;

const SILENT: u32 = AUDCLNT_BUFFERFLAGS_SILENT.0 as u32;
const DISCONTINUITY: u32 = AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY.0 as u32;

/// A run of staged frames sharing the same silence flag.
#[derive(Debug, Clone, Copy)]
struct Segment {
    frames: usize,
    silent: bool,
}

pub(crate) struct WasapiCaptureClient {
    capture: Option<IAudioCaptureClient>,
    client: IAudioClient,
    staging: VecDeque<u8>,
    segments: VecDeque<Segment>,
    pending_discontinuity: bool,
}

// SAFETY: Created in the multithreaded apartment; only used through `&mut self`.
unsafe impl Send for WasapiCaptureClient {}

impl WasapiCaptureClient {
    pub(crate) fn new(capture: IAudioCaptureClient, client: IAudioClient) -> Self {
        Self {
            capture: Some(capture),
            client,
            staging: VecDeque::new(),
            segments: VecDeque::new(),
            pending_discontinuity: false,
        }
    }

    fn capture(&self) -> Result<&IAudioCaptureClient, AudioError> {
        self.capture.as_ref().ok_or(AudioError::SessionClosed)
    }

    fn staged_frames(&self) -> usize {
        self.segments.iter().map(|s| s.frames).sum()
    }

    /// Move one device packet into staging. Returns false if none was ready.
    fn pull_packet(&mut self, format: &FormatDescriptor) -> Result<bool, AudioError> {
        let capture = self.capture()?.clone();
        unsafe {
            let next = capture
                .GetNextPacketSize()
                .map_err(|e| map_error("GetNextPacketSize", e))?;
            if next == 0 {
                return Ok(false);
            }

            let mut data: *mut u8 = std::ptr::null_mut();
            let mut frames: u32 = 0;
            let mut flags: u32 = 0;
            capture
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                .map_err(|e| map_error("IAudioCaptureClient::GetBuffer", e))?;

            let bytes = format.bytes_for(frames as usize);
            let silent = flags & SILENT != 0;
            if silent || data.is_null() {
                self.staging.extend(std::iter::repeat(format.silence_byte()).take(bytes));
            } else {
                self.staging.extend(std::slice::from_raw_parts(data, bytes).iter().copied());
            }
            if flags & DISCONTINUITY != 0 {
                self.pending_discontinuity = true;
            }
            self.push_segment(frames as usize, silent);

            capture
                .ReleaseBuffer(frames)
                .map_err(|e| map_error("IAudioCaptureClient::ReleaseBuffer", e))?;
        }
        Ok(true)
    }

    fn push_segment(&mut self, frames: usize, silent: bool) {
        if frames == 0 {
            return;
        }
        match self.segments.back_mut() {
            Some(last) if last.silent == silent => last.frames += frames,
            _ => self.segments.push_back(Segment { frames, silent }),
        }
    }

    /// Drop `frames` from the front of the segment list; true if all were silent.
    fn consume_segments(&mut self, mut frames: usize) -> bool {
        let mut silent = true;
        while frames > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            silent &= front.silent;
            let take = front.frames.min(frames);
            front.frames -= take;
            frames -= take;
            if front.frames == 0 {
                self.segments.pop_front();
            }
        }
        silent
    }
}

impl CaptureClient for WasapiCaptureClient {
    fn available_frames(&self) -> Result<usize, AudioError> {
        self.capture()?;
        // For capture streams the padding is the number of frames ready to read.
        let queued = unsafe { self.client.GetCurrentPadding() }.map_err(|e| map_error("GetCurrentPadding", e))?;
        Ok(self.staged_frames() + queued as usize)
    }

    fn read(&mut self, dst: &mut [u8], format: &FormatDescriptor) -> Result<CapturePacket, AudioError> {
        let wanted = format.frames_in(dst.len());
        while self.staged_frames() < wanted {
            if !self.pull_packet(format)? {
                break;
            }
        }

        let frames = wanted.min(self.staged_frames());
        let bytes = format.bytes_for(frames);
        for (slot, byte) in dst[..bytes].iter_mut().zip(self.staging.drain(..bytes)) {
            *slot = byte;
        }
        let silent = frames > 0 && self.consume_segments(frames);
        let discontinuity = frames > 0 && std::mem::take(&mut self.pending_discontinuity);

        Ok(CapturePacket {
            frames,
            silent,
            discontinuity,
        })
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.capture = None;
        self.staging.clear();
        self.segments.clear();
        Ok(())
    }
}

pub(crate) struct WasapiRenderClient {
    render: Option<IAudioRenderClient>,
}

// SAFETY: Created in the multithreaded apartment; only used through `&mut self`.
unsafe impl Send for WasapiRenderClient {}

impl WasapiRenderClient {
    pub(crate) fn new(render: IAudioRenderClient) -> Self {
        Self { render: Some(render) }
    }
}

impl RenderClient for WasapiRenderClient {
    fn write(&mut self, src: &[u8], silence_frames: usize, format: &FormatDescriptor) -> Result<(), AudioError> {
        let render = self.render.as_ref().ok_or(AudioError::SessionClosed)?;
        let frames = format.frames_in(src.len()) + silence_frames;
        if frames == 0 {
            return Ok(());
        }

        unsafe {
            let data = render
                .GetBuffer(frames as u32)
                .map_err(|e| map_error("IAudioRenderClient::GetBuffer", e))?;

            // An all-silence buffer is flagged instead of written.
            let flags = if src.is_empty() {
                SILENT
            } else {
                let out = std::slice::from_raw_parts_mut(data, format.bytes_for(frames));
                out[..src.len()].copy_from_slice(src);
                out[src.len()..].fill(format.silence_byte());
                0
            };

            render
                .ReleaseBuffer(frames as u32, flags)
                .map_err(|e| map_error("IAudioRenderClient::ReleaseBuffer", e))?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), AudioError> {
        self.render = None;
        Ok(())
    }
}
