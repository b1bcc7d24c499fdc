//! Mixing, scaling, and silence kernels.

use crate::memblock::Memchunk;
use crate::sample::{SampleFormat, SampleSpec, SAMPLE_FLOAT32NE, SAMPLE_S16NE};
use crate::volume::{ChannelVolume, Volume};

/// One playing stream's contribution to a mix: the data it produced this
/// round and the per-channel volume to apply to it.
pub struct MixInfo {
    /// The stream's pending data.
    pub chunk: Memchunk,
    /// Per-channel volume for this stream.
    pub volume: ChannelVolume,
}

/// Fills `p` with silence for the given spec (0x80 for U8, zero for the
/// linear formats, the law codecs' zero code points otherwise).
pub fn silence_memory(p: &mut [u8], spec: &SampleSpec) {
    p.fill(spec.format.silence_byte());
}

/// Silences the bytes covered by a chunk. The chunk must be writable.
pub fn silence_memchunk(c: &mut Memchunk, spec: &SampleSpec) {
    silence_memory(&mut c.bytes_mut(), spec);
}

fn scale(v: i64, volume: Volume) -> i64 {
    if volume == Volume::NORM {
        v
    } else {
        v * i64::from(volume.as_u32()) / i64::from(Volume::NORM.as_u32())
    }
}

/// Mixes `streams` into `data`, interpreting everything per `spec`.
///
/// Every stream's samples are scaled by its own per-channel volume,
/// accumulated, scaled by the master `volume`, and saturated to the
/// format's range. Mixing stops at the end of `data` or at the end of the
/// shortest stream, whichever comes first; the number of bytes written is
/// returned.
///
/// Only the natively-ordered linear formats can be mixed; asking for
/// anything else is a programming error and panics.
pub fn mix(streams: &[MixInfo], data: &mut [u8], spec: &SampleSpec, volume: &ChannelVolume) -> usize {
    assert!(!streams.is_empty());

    let ss = spec.format.sample_size();
    let length = streams
        .iter()
        .map(|m| m.chunk.length)
        .chain(std::iter::once(data.len()))
        .min()
        .unwrap()
        / ss
        * ss;

    let mut channel = 0usize;
    match spec.format {
        f if f == SAMPLE_S16NE => {
            for d in 0..length / 2 {
                let mut sum: i64 = 0;
                for m in streams {
                    let bytes = m.chunk.bytes();
                    let v = i16::from_ne_bytes([bytes[d * 2], bytes[d * 2 + 1]]);
                    sum += scale(i64::from(v), m.volume.channel(channel));
                }

                sum = scale(sum, volume.channel(channel)).clamp(-0x8000, 0x7FFF);
                data[d * 2..d * 2 + 2].copy_from_slice(&(sum as i16).to_ne_bytes());

                channel += 1;
                if channel >= spec.channels as usize {
                    channel = 0;
                }
            }
        }
        SampleFormat::U8 => {
            for d in 0..length {
                let mut sum: i64 = 0;
                for m in streams {
                    // Offset binary: mix through a signed intermediate.
                    let v = i64::from(m.chunk.bytes()[d]) - 0x80;
                    sum += scale(v, m.volume.channel(channel));
                }

                sum = scale(sum, volume.channel(channel)).clamp(-0x80, 0x7F);
                data[d] = (sum + 0x80) as u8;

                channel += 1;
                if channel >= spec.channels as usize {
                    channel = 0;
                }
            }
        }
        f if f == SAMPLE_FLOAT32NE => {
            for d in 0..length / 4 {
                let mut sum: f32 = 0.0;
                for m in streams {
                    let bytes = m.chunk.bytes();
                    let v = f32::from_ne_bytes([
                        bytes[d * 4],
                        bytes[d * 4 + 1],
                        bytes[d * 4 + 2],
                        bytes[d * 4 + 3],
                    ]);
                    sum += v * m.volume.channel(channel).to_linear_raw();
                }

                sum *= volume.channel(channel).to_linear_raw();
                data[d * 4..d * 4 + 4].copy_from_slice(&sum.to_ne_bytes());

                channel += 1;
                if channel >= spec.channels as usize {
                    channel = 0;
                }
            }
        }
        other => panic!("refusing to mix sample format {other}"),
    }

    length
}

/// Scales the samples in `c` by a per-channel volume, in place, saturating.
///
/// `NORM` across all channels is a no-op; `MUTED` across all channels
/// silences the chunk. The chunk must be writable (see
/// [`Memchunk::make_writable`]) and frame-aligned.
pub fn volume_memchunk(c: &mut Memchunk, spec: &SampleSpec, volume: &ChannelVolume) {
    assert!(c.length % spec.frame_size() == 0);

    if volume.channels_equal_to(Volume::NORM) {
        return;
    }

    if volume.channels_equal_to(Volume::MUTED) {
        silence_memchunk(c, spec);
        return;
    }

    let channels = spec.channels as usize;
    let mut channel = 0usize;

    match spec.format {
        f if f == SAMPLE_S16NE => {
            let mut bytes = c.bytes_mut();
            for b in bytes.chunks_exact_mut(2) {
                let v = i16::from_ne_bytes([b[0], b[1]]);
                let t = scale(i64::from(v), volume.channel(channel)).clamp(-0x8000, 0x7FFF);
                b.copy_from_slice(&(t as i16).to_ne_bytes());

                channel += 1;
                if channel >= channels {
                    channel = 0;
                }
            }
        }
        SampleFormat::U8 => {
            let mut bytes = c.bytes_mut();
            for b in bytes.iter_mut() {
                let t = scale(i64::from(*b) - 0x80, volume.channel(channel)).clamp(-0x80, 0x7F);
                *b = (t + 0x80) as u8;

                channel += 1;
                if channel >= channels {
                    channel = 0;
                }
            }
        }
        f if f == SAMPLE_FLOAT32NE => {
            let mut bytes = c.bytes_mut();
            for b in bytes.chunks_exact_mut(4) {
                let v = f32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
                let t = v * volume.channel(channel).to_linear_raw();
                b.copy_from_slice(&t.to_ne_bytes());

                channel += 1;
                if channel >= channels {
                    channel = 0;
                }
            }
        }
        other => {
            log::warn!("unable to change volume of sample format {other}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memblock::Memblock;
    use pretty_assertions::assert_eq;

    fn s16_chunk(samples: &[i16]) -> Memchunk {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Memchunk::from_block(Memblock::new_dynamic(bytes, None))
    }

    fn s16_of(chunk: &Memchunk) -> Vec<i16> {
        chunk
            .bytes()
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect()
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(SAMPLE_S16NE, 2, 44100).unwrap()
    }

    #[test]
    fn single_stream_at_norm_is_identity() {
        let samples = [100i16, -100, 2000, -32768, 32767, 0];
        let streams = [MixInfo {
            chunk: s16_chunk(&samples),
            volume: ChannelVolume::norm(2),
        }];

        let mut out = vec![0u8; samples.len() * 2];
        let n = mix(&streams, &mut out, &spec(), &ChannelVolume::norm(2));
        assert_eq!(n, out.len());

        let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn two_streams_sum_and_saturate() {
        let a = [1000i16, 30000, -30000];
        let b = [500i16, 10000, -10000];
        let streams = [
            MixInfo {
                chunk: s16_chunk(&a),
                volume: ChannelVolume::norm(1),
            },
            MixInfo {
                chunk: s16_chunk(&b),
                volume: ChannelVolume::norm(1),
            },
        ];

        let mut out = vec![0u8; 6];
        let spec = SampleSpec::new(SAMPLE_S16NE, 1, 44100).unwrap();
        mix(&streams, &mut out, &spec, &ChannelVolume::norm(1));

        let mixed: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(mixed, vec![1500, 32767, -32768]);
    }

    #[test]
    fn mix_stops_at_shortest_stream() {
        let streams = [
            MixInfo {
                chunk: s16_chunk(&[1, 2, 3, 4]),
                volume: ChannelVolume::norm(2),
            },
            MixInfo {
                chunk: s16_chunk(&[1, 2]),
                volume: ChannelVolume::norm(2),
            },
        ];

        let mut out = vec![0u8; 8];
        let n = mix(&streams, &mut out, &spec(), &ChannelVolume::norm(2));
        assert_eq!(n, 4);
    }

    #[test]
    fn per_channel_volume_applies_per_channel() {
        let mut chunk = s16_chunk(&[1000, 1000, -1000, -1000]);
        let mut volume = ChannelVolume::norm(2);
        volume.set_channel(1, Volume::from_u32_clamped(0x8000)); // right at half

        volume_memchunk(&mut chunk, &spec(), &volume);
        assert_eq!(s16_of(&chunk), vec![1000, 500, -1000, -500]);
    }

    #[test]
    fn muted_volume_silences() {
        let mut chunk = s16_chunk(&[1000, -1000]);
        volume_memchunk(&mut chunk, &spec(), &ChannelVolume::muted(2));
        assert_eq!(s16_of(&chunk), vec![0, 0]);
    }

    #[test]
    fn u8_mix_is_offset_binary() {
        let a = Memchunk::from_block(Memblock::new_dynamic(vec![0x80 + 10, 0x80 - 10], None));
        let b = Memchunk::from_block(Memblock::new_dynamic(vec![0x80 + 20, 0x80 - 20], None));
        let streams = [
            MixInfo {
                chunk: a,
                volume: ChannelVolume::norm(1),
            },
            MixInfo {
                chunk: b,
                volume: ChannelVolume::norm(1),
            },
        ];

        let spec = SampleSpec::new(SampleFormat::U8, 1, 8000).unwrap();
        let mut out = vec![0u8; 2];
        mix(&streams, &mut out, &spec, &ChannelVolume::norm(1));
        assert_eq!(out, vec![0x80 + 30, 0x80 - 30]);
    }
}
