//! Defines volume specification data types.

use std::fmt;

use crate::sample::CHANNELS_MAX;

const VOLUME_NORM: u32 = 0x10000;
const VOLUME_MUTED: u32 = 0;
const VOLUME_MAX: u32 = u32::MAX / 2;

/// Volume specification for a single channel.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Volume(u32);

impl Volume {
    /// The normal volume (100%, 0 dB, no attenuation, no amplification).
    pub const NORM: Self = Volume(VOLUME_NORM);

    /// The muted volume (0%, -Inf dB).
    pub const MUTED: Self = Volume(VOLUME_MUTED);

    /// Gets the raw volume value as a `u32`.
    ///
    /// This is not useful for user presentation.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Creates a volume specification from a raw `u32` sent over the wire
    /// (or obtained via `Volume::as_u32`).
    ///
    /// If the raw value is out of the valid range, it will be clamped.
    pub fn from_u32_clamped(raw: u32) -> Self {
        Volume(raw.min(VOLUME_MAX))
    }

    /// Multiplies two volumes, saturating at the maximum.
    ///
    /// Since `NORM` is unity, `a.multiply(NORM) == a`.
    pub fn multiply(self, other: Volume) -> Volume {
        let v = (u64::from(self.0) * u64::from(other.0)) / u64::from(VOLUME_NORM);
        Volume(v.min(u64::from(VOLUME_MAX)) as u32)
    }

    /// Gets the amplification/attenuation in decibel (dB) corresponding to
    /// this volume.
    pub fn to_db(&self) -> f32 {
        self.to_linear().log10() * 20.0
    }

    /// Convert the volume to a linear volume.
    ///
    /// The range of the returned number goes from 0.0 (mute) over 1.0 (0 dB,
    /// 100%) and can go beyond 1.0 to indicate that the signal should be
    /// amplified.
    pub fn to_linear(&self) -> f32 {
        // A cubic scale, like the big desktop sound servers use.
        // Also see: http://www.robotplanet.dk/audio/audio_gui_design/
        let f = self.0 as f32 / VOLUME_NORM as f32;
        f * f * f
    }

    /// Convert from a linear volume.
    ///
    /// Volumes outside the valid range will be clamped.
    pub fn from_linear(linear: f32) -> Self {
        let raw = (linear.cbrt() * VOLUME_NORM as f32) as u32;
        Volume(raw.min(VOLUME_MAX))
    }

    /// The raw ratio this volume scales samples by, without the cubic
    /// user-presentation mapping. Unity at `NORM`.
    pub(crate) fn to_linear_raw(self) -> f32 {
        self.0 as f32 / VOLUME_NORM as f32
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} dB", self.to_db())
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Volume")
            .field(&format!(
                "raw={:.1}, linear={:.1}, {:.1} dB",
                self.0 as f32 / VOLUME_NORM as f32,
                self.to_linear(),
                self.to_db()
            ))
            .finish()
    }
}

/// Per-channel volume setting.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelVolume {
    channels: u8,
    volumes: [Volume; CHANNELS_MAX as usize],
}

impl ChannelVolume {
    /// Create a `ChannelVolume` with N channels, all muted.
    pub fn muted(channels: u8) -> ChannelVolume {
        Self {
            channels: channels.min(CHANNELS_MAX),
            volumes: [Volume::MUTED; CHANNELS_MAX as usize],
        }
    }

    /// Create a `ChannelVolume` with N channels, all at full volume.
    pub fn norm(channels: u8) -> ChannelVolume {
        Self::uniform(channels, Volume::NORM)
    }

    /// Create a `ChannelVolume` with N channels, all set to `v`.
    pub fn uniform(channels: u8, v: Volume) -> ChannelVolume {
        Self {
            channels: channels.min(CHANNELS_MAX),
            volumes: [v; CHANNELS_MAX as usize],
        }
    }

    /// The number of channels covered.
    pub fn num_channels(&self) -> u8 {
        self.channels
    }

    /// The volume of channel `index`, or `NORM` for channels beyond the
    /// covered count.
    pub fn channel(&self, index: usize) -> Volume {
        if index < self.channels as usize {
            self.volumes[index]
        } else {
            Volume::NORM
        }
    }

    /// Sets the volume of channel `index`. Out-of-range channels are
    /// ignored.
    pub fn set_channel(&mut self, index: usize, v: Volume) {
        if index < self.channels as usize {
            self.volumes[index] = v;
        }
    }

    /// The occupied part as a slice.
    pub fn volumes(&self) -> &[Volume] {
        &self.volumes[..self.channels as usize]
    }

    /// Whether every covered channel is set to `v`.
    pub fn channels_equal_to(&self, v: Volume) -> bool {
        self.volumes().iter().all(|x| *x == v)
    }

    /// The average volume across channels.
    pub fn avg(&self) -> Volume {
        if self.channels == 0 {
            return Volume::MUTED;
        }

        let sum: u64 = self.volumes().iter().map(|v| u64::from(v.as_u32())).sum();
        Volume::from_u32_clamped((sum / u64::from(self.channels)) as u32)
    }

    /// Channel-wise saturating multiplication.
    pub fn multiply(&self, other: &ChannelVolume) -> ChannelVolume {
        let channels = self.channels.max(other.channels);
        let mut out = ChannelVolume::norm(channels);
        for i in 0..channels as usize {
            out.volumes[i] = self.channel(i).multiply(other.channel(i));
        }

        out
    }
}

impl fmt::Debug for ChannelVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.volumes().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn multiply_norm_is_identity() {
        let v = Volume::from_u32_clamped(0x8000);
        assert_eq!(v.multiply(Volume::NORM), v);
        assert_eq!(Volume::NORM.multiply(v), v);
        assert_eq!(v.multiply(Volume::MUTED), Volume::MUTED);
    }

    #[test]
    fn multiply_saturates() {
        let loud = Volume::from_u32_clamped(u32::MAX);
        assert_eq!(loud.multiply(loud).as_u32(), u32::MAX / 2);
    }

    #[test]
    fn channel_volume_ops() {
        let mut cv = ChannelVolume::norm(2);
        cv.set_channel(1, Volume::MUTED);
        assert!(!cv.channels_equal_to(Volume::NORM));
        assert_eq!(cv.channel(0), Volume::NORM);
        assert_eq!(cv.channel(1), Volume::MUTED);
        assert_eq!(cv.avg().as_u32(), 0x8000);

        let product = cv.multiply(&ChannelVolume::norm(2));
        assert_eq!(product, cv);
    }
}
