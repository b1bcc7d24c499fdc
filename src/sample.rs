//! Sample specification data type.

use std::fmt;
use std::time::Duration;

use enum_primitive_derive::Primitive;

use crate::error::Error;

/// Maximum number of channels.
pub const CHANNELS_MAX: u8 = 16;

const RATE_MAX: u32 = 48000 * 8;

/// Describes how individual samples are encoded.
#[derive(Debug, Copy, Clone, Primitive, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SampleFormat {
    /// Unsigned 8 bit PCM
    U8 = 0,
    /// 8 bit a-Law
    Alaw = 1,
    /// 8 bit mu-Law
    Ulaw = 2,
    /// Signed 16 bit PCM, little endian
    #[default]
    S16Le = 3,
    /// Signed 16 bit PCM, big endian
    S16Be = 4,
    /// 32 bit IEEE floating point, little endian, range -1.0 to 1.0
    Float32Le = 5,
    /// 32 bit IEEE floating point, big endian, range -1.0 to 1.0
    Float32Be = 6,
}

/// Signed 16 bit PCM in the byte order of this machine.
#[cfg(target_endian = "little")]
pub const SAMPLE_S16NE: SampleFormat = SampleFormat::S16Le;
/// Signed 16 bit PCM in the byte order of this machine.
#[cfg(target_endian = "big")]
pub const SAMPLE_S16NE: SampleFormat = SampleFormat::S16Be;

/// 32 bit IEEE floating point in the byte order of this machine.
#[cfg(target_endian = "little")]
pub const SAMPLE_FLOAT32NE: SampleFormat = SampleFormat::Float32Le;
/// 32 bit IEEE floating point in the byte order of this machine.
#[cfg(target_endian = "big")]
pub const SAMPLE_FLOAT32NE: SampleFormat = SampleFormat::Float32Be;

impl SampleFormat {
    /// The storage size of a single sample in this format.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::Alaw | SampleFormat::Ulaw => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::Float32Le | SampleFormat::Float32Be => 4,
        }
    }

    /// The byte a buffer of this format is filled with to produce silence.
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            SampleFormat::S16Le
            | SampleFormat::S16Be
            | SampleFormat::Float32Le
            | SampleFormat::Float32Be => 0x00,
            SampleFormat::Ulaw => 0xD5,
            SampleFormat::Alaw => 0x55,
        }
    }

    /// A short name for the format, as accepted by [`SampleFormat::parse`].
    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::Alaw => "alaw",
            SampleFormat::Ulaw => "ulaw",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::Float32Le => "float32le",
            SampleFormat::Float32Be => "float32be",
        }
    }

    /// Parses a format name.
    pub fn parse(s: &str) -> Option<SampleFormat> {
        match s {
            "u8" => Some(SampleFormat::U8),
            "alaw" => Some(SampleFormat::Alaw),
            "ulaw" | "mulaw" => Some(SampleFormat::Ulaw),
            "s16le" | "s16" => Some(SampleFormat::S16Le),
            "s16be" => Some(SampleFormat::S16Be),
            "float32le" | "float32" => Some(SampleFormat::Float32Le),
            "float32be" => Some(SampleFormat::Float32Be),
            _ => None,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sample specification that fully describes the format of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    /// Format / encoding of individual samples.
    pub format: SampleFormat,
    /// Number of independent channels. Must be at least 1.
    pub channels: u8,
    /// Number of samples per second (and per channel).
    pub rate: u32,
}

impl SampleSpec {
    /// Creates a new sample specification, validating the channel count and
    /// sample rate.
    pub fn new(format: SampleFormat, channels: u8, rate: u32) -> Result<Self, Error> {
        if channels == 0 || channels > CHANNELS_MAX {
            return Err(Error::Invalid(format!(
                "invalid channel count {} (must be between 1 and {})",
                channels, CHANNELS_MAX
            )));
        }

        if rate == 0 || rate > RATE_MAX {
            return Err(Error::Invalid(format!(
                "invalid sample rate {} (must be between 1 and {})",
                rate, RATE_MAX
            )));
        }

        Ok(Self {
            format,
            channels,
            rate,
        })
    }

    /// Whether the channel count and rate are in range.
    pub fn valid(&self) -> bool {
        self.channels >= 1 && self.channels <= CHANNELS_MAX && self.rate >= 1 && self.rate <= RATE_MAX
    }

    /// The size of one frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// The number of bytes that one second of audio occupies.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// The playback time of `length` bytes in this spec.
    pub fn bytes_to_duration(&self, length: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }

        Duration::from_micros((length as u64 * 1_000_000) / bps as u64)
    }

    /// The number of bytes played in `d`, rounded down to a whole frame.
    pub fn duration_to_bytes(&self, d: Duration) -> usize {
        let bytes = (d.as_micros() as u64 * self.bytes_per_second() as u64 / 1_000_000) as usize;
        (bytes / self.frame_size()) * self.frame_size()
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            channels: 2,
            rate: 44100,
        }
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ch {}Hz {}", self.channels, self.rate, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn validation() {
        assert_matches!(SampleSpec::new(SampleFormat::S16Le, 0, 44100), Err(_));
        assert_matches!(SampleSpec::new(SampleFormat::S16Le, 17, 44100), Err(_));
        assert_matches!(SampleSpec::new(SampleFormat::S16Le, 2, 0), Err(_));
        assert_matches!(SampleSpec::new(SampleFormat::S16Le, 2, 44100), Ok(_));
    }

    #[test]
    fn frame_math() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 2, 44100).unwrap();
        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.bytes_per_second(), 176400);
        assert_eq!(spec.bytes_to_duration(176400), Duration::from_secs(1));
        assert_eq!(spec.duration_to_bytes(Duration::from_secs(1)), 176400);
    }

    #[test]
    fn silence_bytes() {
        assert_eq!(SampleFormat::U8.silence_byte(), 0x80);
        assert_eq!(SampleFormat::S16Le.silence_byte(), 0);
        assert_eq!(SampleFormat::Ulaw.silence_byte(), 0xD5);
        assert_eq!(SampleFormat::Alaw.silence_byte(), 0x55);
    }
}
