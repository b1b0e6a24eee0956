use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::enumerator::{DeviceEnumerator, EndpointInfo};
use crate::models::config::EngineConfiguration;
use crate::models::device::{DataFlow, DeviceDescriptor};
use crate::models::error::AudioError;
use crate::models::format::FormatDescriptor;
use crate::session::audio_session::AudioSession;
use crate::session::registry::{DrainReport, SessionId, SessionRegistry};
use crate::traits::backend::AudioBackend;

/// Entry point tying a backend, its enumerator and a session registry to one
/// [`EngineConfiguration`].
pub struct AudioEngine {
    config: EngineConfiguration,
    enumerator: DeviceEnumerator,
    registry: SessionRegistry,
}

impl AudioEngine {
    pub fn new(backend: Arc<dyn AudioBackend>, config: EngineConfiguration) -> Result<Self, AudioError> {
        config.validate().map_err(AudioError::Initialization)?;
        log::debug!("audio engine on {} backend", backend.name());
        Ok(Self {
            config,
            enumerator: DeviceEnumerator::new(Arc::clone(&backend)),
            registry: SessionRegistry::new(backend),
        })
    }

    pub fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    pub fn enumerator(&self) -> &DeviceEnumerator {
        &self.enumerator
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The endpoint a session for `flow` would use: the preferred-device
    /// choice if there is one, otherwise the system default.
    pub fn pick_endpoint(&self, flow: DataFlow) -> Result<DeviceDescriptor, AudioError> {
        let preferences = match flow {
            DataFlow::Capture => &self.config.preferred_capture_devices,
            DataFlow::Render => &self.config.preferred_render_devices,
        };
        let chosen = self
            .enumerator
            .select_preferred(flow, preferences, self.config.disable_usb_auto_selection)?;

        match chosen {
            Some(EndpointInfo { descriptor, name, .. }) => {
                log::debug!("using preferred {:?} endpoint {}", flow, name);
                Ok(descriptor)
            }
            None => self.enumerator.default_endpoint(flow),
        }
    }

    /// Open and initialize a session on `device` with the engine's settings.
    ///
    /// The session is tracked by the registry; on initialization failure it
    /// is released again before the error is returned.
    pub fn open_session(
        &self,
        device: &DeviceDescriptor,
        format: &FormatDescriptor,
    ) -> Result<(SessionId, Arc<AudioSession>), AudioError> {
        let (id, session) = self.registry.open(device)?;
        if let Err(e) = session.initialize(format, &self.config.session_config()) {
            self.registry.release(id);
            return Err(e);
        }
        Ok((id, session))
    }

    pub fn open_capture(&self, format: &FormatDescriptor) -> Result<(SessionId, Arc<AudioSession>), AudioError> {
        let device = self.pick_endpoint(DataFlow::Capture)?;
        self.open_session(&device, format)
    }

    pub fn open_render(&self, format: &FormatDescriptor) -> Result<(SessionId, Arc<AudioSession>), AudioError> {
        let device = self.pick_endpoint(DataFlow::Render)?;
        self.open_session(&device, format)
    }

    /// `wait_ready` bound for `session`, scaled from its negotiated buffer.
    pub fn wait_timeout(&self, session: &AudioSession) -> Duration {
        let buffer = session
            .stream()
            .map(|s| s.buffer_duration)
            .unwrap_or(self.config.buffer_duration);
        self.config.wait_timeout(buffer)
    }

    pub fn shutdown(&self) -> DrainReport {
        self.registry.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{SimulatedBackend, SimulatedEndpoint};
    use crate::models::session::{SessionState, ShareMode};

    fn backend() -> Arc<SimulatedBackend> {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_endpoint(SimulatedEndpoint::capture("mic-int", "Internal Mic").enumerator_name("HDAUDIO"));
        backend.add_endpoint(SimulatedEndpoint::capture("mic-ext", "Studio Mic").enumerator_name("HDAUDIO"));
        backend.add_endpoint(SimulatedEndpoint::render("spk", "Speakers"));
        backend.set_default(DataFlow::Render, "spk");
        backend
    }

    fn pcm() -> FormatDescriptor {
        FormatDescriptor::pcm(48_000, 2, 16).unwrap()
    }

    #[test]
    fn preferred_device_is_opened() {
        let config = EngineConfiguration {
            preferred_capture_devices: vec!["Studio Mic".into()],
            ..Default::default()
        };
        let engine = AudioEngine::new(backend(), config).unwrap();

        let (_, session) = engine.open_capture(&pcm()).unwrap();
        assert_eq!(session.device().id, "mic-ext");
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[test]
    fn falls_back_to_default_endpoint() {
        let config = EngineConfiguration {
            preferred_render_devices: vec!["Headphones".into()],
            ..Default::default()
        };
        let engine = AudioEngine::new(backend(), config).unwrap();

        let (_, session) = engine.open_render(&pcm()).unwrap();
        assert_eq!(session.device().id, "spk");
        assert_eq!(engine.wait_timeout(&session), Duration::from_millis(20));
    }

    #[test]
    fn failed_initialize_is_not_tracked() {
        let backend = backend();
        let config = EngineConfiguration {
            share_mode: ShareMode::Exclusive,
            ..Default::default()
        };
        let engine = AudioEngine::new(backend.clone(), config).unwrap();

        let odd = FormatDescriptor::pcm(22_050, 1, 8).unwrap();
        assert!(matches!(engine.open_capture(&odd), Err(AudioError::FormatUnsupported(_))));
        assert!(engine.registry().is_empty());
        assert_eq!(backend.open_handle_count(), 0);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = EngineConfiguration {
            wait_timeout_factor: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            AudioEngine::new(backend(), config),
            Err(AudioError::Initialization(_))
        ));
    }

    #[test]
    fn shutdown_releases_open_sessions() {
        let backend = backend();
        let engine = AudioEngine::new(backend.clone(), EngineConfiguration::default()).unwrap();
        let (_, capture) = engine.open_capture(&pcm()).unwrap();
        let (_, render) = engine.open_render(&pcm()).unwrap();
        capture.start().unwrap();
        render.start().unwrap();

        assert_eq!(engine.shutdown().released, 2);
        assert_eq!(backend.open_handle_count(), 0);
    }
}
