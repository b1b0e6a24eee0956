//! # audio-session-windows
//!
//! Windows WASAPI backend for audio-session-core.
//!
//! Provides:
//! - `WasapiBackend` — endpoint enumeration and property lookup via the MMDevice API
//! - `WasapiDevice` / `WasapiClient` — `IMMDevice` and `IAudioClient` behind the core traits
//! - capture and render sub-clients over `IAudioCaptureClient` / `IAudioRenderClient`
//!
//! ## Platform Requirements
//! - Windows 10+ for `AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM` in shared mode
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use audio_session_core::{AudioEngine, EngineConfiguration, FormatDescriptor};
//! use audio_session_windows::WasapiBackend;
//!
//! let engine = AudioEngine::new(Arc::new(WasapiBackend::new()?), EngineConfiguration::default())?;
//! let (_, mic) = engine.open_capture(&FormatDescriptor::pcm(48_000, 2, 16)?)?;
//! mic.start()?;
//! ```

#[cfg(target_os = "windows")]
mod com;
#[cfg(target_os = "windows")]
pub mod wasapi_backend;
#[cfg(target_os = "windows")]
pub mod wasapi_client;
#[cfg(target_os = "windows")]
mod wasapi_stream;

#[cfg(target_os = "windows")]
pub use wasapi_backend::WasapiBackend;
#[cfg(target_os = "windows")]
pub use wasapi_client::{WasapiClient, WasapiDevice};
