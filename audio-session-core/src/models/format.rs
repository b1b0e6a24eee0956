use serde::Serialize;

use super::error::{AudioError, FormatError};
use super::session::ShareMode;

/// Bit depths a descriptor may carry.
pub const SUPPORTED_BIT_DEPTHS: [u16; 4] = [8, 16, 24, 32];

/// Highest channel count a descriptor may carry.
pub const MAX_CHANNELS: u16 = 8;

/// Size of the extension block that follows an extensible format header.
pub const EXTENSIBLE_EXTRA_SIZE: u16 = 22;

/// `wFormatTag` values understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Pcm,
    Extensible,
}

impl FormatTag {
    pub const PCM_CODE: u16 = 0x0001;
    pub const EXTENSIBLE_CODE: u16 = 0xFFFE;

    pub fn code(self) -> u16 {
        match self {
            Self::Pcm => Self::PCM_CODE,
            Self::Extensible => Self::EXTENSIBLE_CODE,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, FormatError> {
        match code {
            Self::PCM_CODE => Ok(Self::Pcm),
            Self::EXTENSIBLE_CODE => Ok(Self::Extensible),
            other => Err(FormatError::UnknownFormatTag(other)),
        }
    }
}

/// Inclusive range of sample rates a device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleRateRange {
    pub min: u32,
    pub max: u32,
}

impl SampleRateRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, rate: u32) -> bool {
        (self.min..=self.max).contains(&rate)
    }
}

impl Default for SampleRateRange {
    fn default() -> Self {
        Self::new(8_000, 192_000)
    }
}

/// An immutable, internally consistent PCM wire format.
///
/// The only way to obtain one is through a validating constructor, so block
/// alignment and average byte rate always agree with channels, bit depth and
/// sample rate. The `with_*` methods produce a new descriptor with both
/// derived fields recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FormatDescriptor {
    tag: FormatTag,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    block_align: u16,
    avg_bytes_per_sec: u32,
    extra_size: u16,
}

impl FormatDescriptor {
    /// Linear PCM (`WAVE_FORMAT_PCM`).
    pub fn pcm(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Result<Self, FormatError> {
        Self::build(FormatTag::Pcm, sample_rate, channels, bits_per_sample)
    }

    /// Integer PCM carried in a `WAVE_FORMAT_EXTENSIBLE` header.
    pub fn extensible(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Result<Self, FormatError> {
        Self::build(FormatTag::Extensible, sample_rate, channels, bits_per_sample)
    }

    fn build(tag: FormatTag, sample_rate: u32, channels: u16, bits_per_sample: u16) -> Result<Self, FormatError> {
        if !SUPPORTED_BIT_DEPTHS.contains(&bits_per_sample) {
            return Err(FormatError::UnsupportedBitDepth(bits_per_sample));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(FormatError::UnsupportedChannelCount(channels));
        }
        if sample_rate == 0 {
            return Err(FormatError::SampleRateOutOfRange {
                rate: 0,
                min: 1,
                max: u32::MAX,
            });
        }

        let block_align = channels * (bits_per_sample / 8);
        let avg_bytes_per_sec = u32::from(block_align)
            .checked_mul(sample_rate)
            .ok_or_else(|| FormatError::Malformed(format!("byte rate overflows at {} Hz", sample_rate)))?;
        let extra_size = match tag {
            FormatTag::Pcm => 0,
            FormatTag::Extensible => EXTENSIBLE_EXTRA_SIZE,
        };

        Ok(Self {
            tag,
            channels,
            sample_rate,
            bits_per_sample,
            block_align,
            avg_bytes_per_sec,
            extra_size,
        })
    }

    pub fn with_sample_rate(&self, sample_rate: u32) -> Result<Self, FormatError> {
        Self::build(self.tag, sample_rate, self.channels, self.bits_per_sample)
    }

    pub fn with_channels(&self, channels: u16) -> Result<Self, FormatError> {
        Self::build(self.tag, self.sample_rate, channels, self.bits_per_sample)
    }

    pub fn with_bits_per_sample(&self, bits_per_sample: u16) -> Result<Self, FormatError> {
        Self::build(self.tag, self.sample_rate, self.channels, bits_per_sample)
    }

    pub fn with_tag(&self, tag: FormatTag) -> Self {
        // Inputs were validated when `self` was built.
        Self {
            tag,
            extra_size: match tag {
                FormatTag::Pcm => 0,
                FormatTag::Extensible => EXTENSIBLE_EXTRA_SIZE,
            },
            ..*self
        }
    }

    pub fn tag(&self) -> FormatTag {
        self.tag
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn block_align(&self) -> u16 {
        self.block_align
    }

    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.avg_bytes_per_sec
    }

    pub fn extra_size(&self) -> u16 {
        self.extra_size
    }

    /// Bytes per sample of a single channel.
    pub fn bytes_per_sample(&self) -> u16 {
        self.bits_per_sample / 8
    }

    /// Byte value of a silent sample. 8-bit PCM is unsigned and centered on 0x80.
    pub fn silence_byte(&self) -> u8 {
        if self.bits_per_sample == 8 {
            0x80
        } else {
            0
        }
    }

    /// Whether two descriptors describe the same frame layout, ignoring the tag.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.channels == other.channels
            && self.sample_rate == other.sample_rate
            && self.bits_per_sample == other.bits_per_sample
    }

    /// Number of whole frames that fit in `bytes`.
    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.block_align as usize
    }

    /// Byte length of `frames` frames.
    pub fn bytes_for(&self, frames: usize) -> usize {
        frames * self.block_align as usize
    }

    /// Frames the device clock produces over `duration`, rounded down.
    pub fn frames_for_duration(&self, duration: std::time::Duration) -> usize {
        (duration.as_nanos() * self.sample_rate as u128 / 1_000_000_000) as usize
    }

    /// Check the descriptor against a device's advertised sample-rate range.
    pub fn validate(&self, range: &SampleRateRange) -> Result<(), FormatError> {
        if !SUPPORTED_BIT_DEPTHS.contains(&self.bits_per_sample) {
            return Err(FormatError::UnsupportedBitDepth(self.bits_per_sample));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(FormatError::UnsupportedChannelCount(self.channels));
        }
        if !range.contains(self.sample_rate) {
            return Err(FormatError::SampleRateOutOfRange {
                rate: self.sample_rate,
                min: range.min,
                max: range.max,
            });
        }
        Ok(())
    }

    /// Pick the format to open a device with.
    ///
    /// Preference order: exact match, then the same sample rate and channel
    /// count at the nearest supported bit depth, then (shared mode only) the
    /// device mix format. Exclusive mode accepts an exact match or nothing.
    pub fn negotiate(&self, device: &DeviceFormats, mode: ShareMode) -> Result<FormatDescriptor, AudioError> {
        self.validate(&device.sample_rates)?;

        if let Some(exact) = device.supported.iter().find(|f| f.same_layout(self)) {
            return Ok(*exact);
        }

        if mode == ShareMode::Exclusive {
            return Err(AudioError::FormatUnsupported(format!(
                "{} has no exact exclusive-mode match",
                self
            )));
        }

        let nearest = device
            .supported
            .iter()
            .filter(|f| f.sample_rate == self.sample_rate && f.channels == self.channels)
            .min_by_key(|f| {
                let distance = (i32::from(f.bits_per_sample) - i32::from(self.bits_per_sample)).abs();
                // Equal distance prefers the deeper format.
                (distance, std::cmp::Reverse(f.bits_per_sample))
            });
        if let Some(candidate) = nearest {
            return Ok(*candidate);
        }

        device.mix_format.ok_or_else(|| {
            AudioError::FormatUnsupported(format!("{} not supported and device has no mix format", self))
        })
    }
}

impl std::fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz/{}-bit/{}ch ({:?})",
            self.sample_rate, self.bits_per_sample, self.channels, self.tag
        )
    }
}

/// What a device reports it can open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceFormats {
    /// Formats accepted verbatim, in device preference order.
    pub supported: Vec<FormatDescriptor>,
    /// The shared-mode mix format, if the device has a system mixer.
    pub mix_format: Option<FormatDescriptor>,
    pub sample_rates: SampleRateRange,
}
