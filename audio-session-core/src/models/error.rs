use thiserror::Error;

use super::device::DataFlow;
use super::session::SessionState;

/// Reasons a format descriptor cannot be built or used for negotiation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannelCount(u16),

    #[error("sample rate {rate} Hz outside supported range {min}..={max} Hz")]
    SampleRateOutOfRange { rate: u32, min: u32, max: u32 },

    #[error("unknown format tag: {0:#06x}")]
    UnknownFormatTag(u16),

    #[error("malformed wave format: {0}")]
    Malformed(String),
}

/// Errors surfaced by enumeration, property lookup and session operations.
///
/// `TimedOut` is deliberately absent: a wait that elapses is a normal pump
/// outcome reported through [`WaitOutcome`](crate::session::signal::WaitOutcome).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("invalid format: {0}")]
    Format(#[from] FormatError),

    #[error("format not supported by device: {0}")]
    FormatUnsupported(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("property unavailable: {0}")]
    PropertyUnavailable(String),

    #[error("buffer of {len} bytes is not a multiple of block alignment {block_align}")]
    MisalignedBuffer { len: usize, block_align: u16 },

    #[error("session busy: another thread owns the pump")]
    SessionBusy,

    #[error("session closed")]
    SessionClosed,

    #[error("operation requires {expected} state, session is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    #[error("operation not valid on a {0:?} session")]
    WrongDirection(DataFlow),

    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl AudioError {
    /// Whether the error is an environment condition worth re-enumerating for.
    pub fn is_device_condition(&self) -> bool {
        matches!(self, Self::DeviceBusy(_) | Self::DeviceLost(_) | Self::DeviceNotFound(_))
    }
}
