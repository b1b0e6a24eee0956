//! `WAVEFORMATEX` / `WAVEFORMATEXTENSIBLE` byte layout.
//!
//! This is the exact structure the platform audio API takes and returns, so
//! encoding must be bit-exact. All fields are little-endian.
//!
//! ```text
//! [0-1]    wFormatTag       0x0001 PCM, 0xFFFE extensible
//! [2-3]    nChannels
//! [4-7]    nSamplesPerSec
//! [8-11]   nAvgBytesPerSec  = nSamplesPerSec * nBlockAlign
//! [12-13]  nBlockAlign      = nChannels * wBitsPerSample / 8
//! [14-15]  wBitsPerSample
//! [16-17]  cbSize           0 for PCM, 22 for extensible
//! -- extensible only --
//! [18-19]  wValidBitsPerSample
//! [20-23]  dwChannelMask
//! [24-39]  SubFormat GUID   KSDATAFORMAT_SUBTYPE_PCM
//! ```

use uuid::Uuid;

use crate::models::error::FormatError;
use crate::models::format::{FormatDescriptor, FormatTag, EXTENSIBLE_EXTRA_SIZE};

/// Size of the base `WAVEFORMATEX` header.
pub const WAVEFORMATEX_SIZE: usize = 18;

/// Size of a full `WAVEFORMATEXTENSIBLE`.
pub const WAVEFORMATEXTENSIBLE_SIZE: usize = WAVEFORMATEX_SIZE + EXTENSIBLE_EXTRA_SIZE as usize;

/// Size of the legacy `PCMWAVEFORMAT`, which lacks `cbSize`.
const PCMWAVEFORMAT_SIZE: usize = 16;

/// `KSDATAFORMAT_SUBTYPE_PCM`.
pub const KSDATAFORMAT_SUBTYPE_PCM: Uuid = uuid::uuid!("00000001-0000-0010-8000-00aa00389b71");

/// `KSDATAFORMAT_SUBTYPE_IEEE_FLOAT`, recognised only to report it clearly.
const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: Uuid = uuid::uuid!("00000003-0000-0010-8000-00aa00389b71");

/// Speaker positions for the usual channel layouts; anything else gets the
/// first `channels` positions.
pub fn default_channel_mask(channels: u16) -> u32 {
    match channels {
        1 => 0x4,   // front center
        2 => 0x3,   // front left | front right
        4 => 0x33,  // quad
        6 => 0x3F,  // 5.1
        8 => 0x63F, // 7.1 surround
        n => (1u32 << n) - 1,
    }
}

/// Serialize `format` in the layout its tag calls for.
pub fn encode(format: &FormatDescriptor) -> Vec<u8> {
    let size = match format.tag() {
        FormatTag::Pcm => WAVEFORMATEX_SIZE,
        FormatTag::Extensible => WAVEFORMATEXTENSIBLE_SIZE,
    };
    let mut out = Vec::with_capacity(size);

    out.extend_from_slice(&format.tag().code().to_le_bytes());
    out.extend_from_slice(&format.channels().to_le_bytes());
    out.extend_from_slice(&format.sample_rate().to_le_bytes());
    out.extend_from_slice(&format.avg_bytes_per_sec().to_le_bytes());
    out.extend_from_slice(&format.block_align().to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample().to_le_bytes());
    out.extend_from_slice(&format.extra_size().to_le_bytes());

    if format.tag() == FormatTag::Extensible {
        out.extend_from_slice(&format.bits_per_sample().to_le_bytes());
        out.extend_from_slice(&default_channel_mask(format.channels()).to_le_bytes());
        out.extend_from_slice(&KSDATAFORMAT_SUBTYPE_PCM.to_bytes_le());
    }

    out
}

/// Parse a platform format structure.
///
/// The derived fields are checked against the ones recomputed from channels,
/// bit depth and rate; a structure that disagrees with itself is rejected.
pub fn decode(bytes: &[u8]) -> Result<FormatDescriptor, FormatError> {
    if bytes.len() < PCMWAVEFORMAT_SIZE {
        return Err(FormatError::Malformed(format!("{} bytes is too short", bytes.len())));
    }

    let tag = FormatTag::from_code(read_u16(bytes, 0))?;
    let channels = read_u16(bytes, 2);
    let sample_rate = read_u32(bytes, 4);
    let avg_bytes_per_sec = read_u32(bytes, 8);
    let block_align = read_u16(bytes, 12);
    let bits_per_sample = read_u16(bytes, 14);
    let extra_size = if bytes.len() >= WAVEFORMATEX_SIZE {
        read_u16(bytes, 16)
    } else {
        0
    };

    let format = match tag {
        FormatTag::Pcm => FormatDescriptor::pcm(sample_rate, channels, bits_per_sample)?,
        FormatTag::Extensible => {
            if extra_size < EXTENSIBLE_EXTRA_SIZE || bytes.len() < WAVEFORMATEXTENSIBLE_SIZE {
                return Err(FormatError::Malformed(format!(
                    "extensible format with cbSize {} in {} bytes",
                    extra_size,
                    bytes.len()
                )));
            }
            let valid_bits = read_u16(bytes, 18);
            let sub_format = read_guid(bytes, 24);

            if sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT {
                return Err(FormatError::Malformed("IEEE float samples are not integer PCM".into()));
            }
            if sub_format != KSDATAFORMAT_SUBTYPE_PCM {
                return Err(FormatError::Malformed(format!("unknown sub-format {}", sub_format)));
            }
            if valid_bits != bits_per_sample {
                return Err(FormatError::Malformed(format!(
                    "{} valid bits in a {}-bit container",
                    valid_bits, bits_per_sample
                )));
            }
            FormatDescriptor::extensible(sample_rate, channels, bits_per_sample)?
        }
    };

    if format.block_align() != block_align {
        return Err(FormatError::Malformed(format!(
            "block align {} does not match {} channels of {} bits",
            block_align, channels, bits_per_sample
        )));
    }
    if format.avg_bytes_per_sec() != avg_bytes_per_sec {
        return Err(FormatError::Malformed(format!(
            "average byte rate {} does not match {} Hz",
            avg_bytes_per_sec, sample_rate
        )));
    }

    Ok(format)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_guid(bytes: &[u8], at: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    Uuid::from_bytes_le(raw)
}
