pub mod audio_session;
pub mod engine;
pub mod registry;
pub mod signal;
