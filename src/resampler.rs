//! Sample format, channel map, and rate conversion.
//!
//! A [`Resampler`] converts a PCM stream between two sample specifications
//! through up to four stages, each skipped when its input already matches
//! its output: decode to `f32`, remap channels by position, rational rate
//! conversion, encode to the target format. Rate conversion is done by
//! `rubato` for the interpolating methods; the `trivial` method is a
//! plain frame decimator/replicator.

use std::fmt;

use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as _, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use crate::channel_map::ChannelMap;
use crate::error::Error;
use crate::memblock::{Memblock, MemblockStat, Memchunk};
use crate::sample::SampleSpec;
use crate::sconv;

/// Input frames fed to the rate converter per processing call.
const CHUNK_FRAMES: usize = 1024;

/// How far `set_input_rate` may move the rate away from the configured
/// ratio, as a factor.
const MAX_RATIO_DRIFT: f64 = 16.0;

/// Rate conversion algorithms.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResampleMethod {
    /// Highest-quality windowed-sinc interpolation.
    BestSinc,
    /// Medium-quality windowed-sinc interpolation.
    MediumSinc,
    /// Fastest windowed-sinc interpolation.
    FastestSinc,
    /// Sample-and-hold.
    ZeroOrderHold,
    /// Linear interpolation.
    Linear,
    /// Non-interpolating frame decimator/replicator. Only applicable when
    /// format, channel count, and channel map already match.
    Trivial,
}

impl ResampleMethod {
    /// A stable name for the method, as accepted by
    /// [`ResampleMethod::parse`].
    pub fn as_str(self) -> &'static str {
        match self {
            ResampleMethod::BestSinc => "sinc-best-quality",
            ResampleMethod::MediumSinc => "sinc-medium-quality",
            ResampleMethod::FastestSinc => "sinc-fastest",
            ResampleMethod::ZeroOrderHold => "zero-order-hold",
            ResampleMethod::Linear => "linear",
            ResampleMethod::Trivial => "trivial",
        }
    }

    /// Parses a method name.
    pub fn parse(s: &str) -> Option<ResampleMethod> {
        match s {
            "sinc-best-quality" => Some(ResampleMethod::BestSinc),
            "sinc-medium-quality" => Some(ResampleMethod::MediumSinc),
            "sinc-fastest" => Some(ResampleMethod::FastestSinc),
            "zero-order-hold" => Some(ResampleMethod::ZeroOrderHold),
            "linear" => Some(ResampleMethod::Linear),
            "trivial" => Some(ResampleMethod::Trivial),
            _ => None,
        }
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum RateConverter {
    Sinc(SincFixedIn<f32>),
    Fast(FastFixedIn<f32>),
}

impl RateConverter {
    fn new(method: ResampleMethod, ratio: f64, channels: usize) -> Result<RateConverter, Error> {
        fn make_sinc(sinc_len: usize, oversampling_factor: usize) -> SincInterpolationParameters {
            SincInterpolationParameters {
                sinc_len,
                f_cutoff: 0.95,
                oversampling_factor,
                interpolation: SincInterpolationType::Linear,
                window: WindowFunction::BlackmanHarris2,
            }
        }

        fn construction_error(e: rubato::ResamplerConstructionError) -> Error {
            Error::Invalid(format!("cannot construct resampler: {e}"))
        }

        match method {
            ResampleMethod::BestSinc => {
                SincFixedIn::new(ratio, MAX_RATIO_DRIFT, make_sinc(256, 256), CHUNK_FRAMES, channels)
                    .map(RateConverter::Sinc)
                    .map_err(construction_error)
            }
            ResampleMethod::MediumSinc => {
                SincFixedIn::new(ratio, MAX_RATIO_DRIFT, make_sinc(128, 128), CHUNK_FRAMES, channels)
                    .map(RateConverter::Sinc)
                    .map_err(construction_error)
            }
            ResampleMethod::FastestSinc => {
                SincFixedIn::new(ratio, MAX_RATIO_DRIFT, make_sinc(64, 64), CHUNK_FRAMES, channels)
                    .map(RateConverter::Sinc)
                    .map_err(construction_error)
            }
            ResampleMethod::Linear => FastFixedIn::new(
                ratio,
                MAX_RATIO_DRIFT,
                PolynomialDegree::Linear,
                CHUNK_FRAMES,
                channels,
            )
            .map(RateConverter::Fast)
            .map_err(construction_error),
            ResampleMethod::ZeroOrderHold => FastFixedIn::new(
                ratio,
                MAX_RATIO_DRIFT,
                PolynomialDegree::Nearest,
                CHUNK_FRAMES,
                channels,
            )
            .map(RateConverter::Fast)
            .map_err(construction_error),
            ResampleMethod::Trivial => unreachable!("trivial method has no converter"),
        }
    }

    fn input_frames_next(&self) -> usize {
        match self {
            RateConverter::Sinc(c) => c.input_frames_next(),
            RateConverter::Fast(c) => c.input_frames_next(),
        }
    }

    fn process(&mut self, input: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let result = match self {
            RateConverter::Sinc(c) => c.process(input, None),
            RateConverter::Fast(c) => c.process(input, None),
        };

        // The input was sized by input_frames_next, so the only failures
        // left are internal.
        result.expect("rate converter rejected a correctly sized buffer")
    }

    fn set_ratio(&mut self, ratio: f64) {
        let result = match self {
            RateConverter::Sinc(c) => c.set_resample_ratio(ratio, false),
            RateConverter::Fast(c) => c.set_resample_ratio(ratio, false),
        };

        if let Err(e) = result {
            log::warn!("clock skew too large to adjust for: {e}");
        }
    }
}

struct Pipeline {
    /// `None` while input and output rates agree.
    converter: Option<RateConverter>,
    /// Remapped input-rate frames waiting to fill a converter call, one
    /// buffer per output channel.
    pending: Vec<Vec<f32>>,
}

enum Kind {
    /// All stages skipped: pass chunks through untouched.
    Passthrough,
    Trivial {
        i_counter: u64,
        o_counter: u64,
    },
    Pipeline(Pipeline),
}

/// A stateful converter between two sample specifications.
pub struct Resampler {
    in_spec: SampleSpec,
    out_spec: SampleSpec,
    in_map: ChannelMap,
    out_map: ChannelMap,
    in_fz: usize,
    out_fz: usize,
    method: ResampleMethod,
    stat: Option<MemblockStat>,
    kind: Kind,
}

impl Resampler {
    /// Creates a resampler converting from `(in_spec, in_map)` to
    /// `(out_spec, out_map)` with the given method.
    ///
    /// A `Trivial` request that also needs format or channel conversion
    /// falls back to `ZeroOrderHold`.
    pub fn new(
        in_spec: &SampleSpec,
        in_map: &ChannelMap,
        out_spec: &SampleSpec,
        out_map: &ChannelMap,
        stat: Option<&MemblockStat>,
        method: ResampleMethod,
    ) -> Result<Resampler, Error> {
        if !in_spec.valid() || !out_spec.valid() {
            return Err(Error::Invalid("invalid sample spec".into()));
        }

        let format_matches = in_spec.format == out_spec.format
            && in_spec.channels == out_spec.channels
            && in_map.equal(out_map);

        let mut method = method;
        if method == ResampleMethod::Trivial && !format_matches {
            log::debug!("trivial resampler requested for differing formats, using zero-order-hold");
            method = ResampleMethod::ZeroOrderHold;
        }

        let kind = if method == ResampleMethod::Trivial {
            if in_spec.rate == out_spec.rate {
                Kind::Passthrough
            } else {
                Kind::Trivial {
                    i_counter: 0,
                    o_counter: 0,
                }
            }
        } else if format_matches && in_spec.rate == out_spec.rate {
            Kind::Passthrough
        } else {
            let converter = if in_spec.rate != out_spec.rate {
                let ratio = f64::from(out_spec.rate) / f64::from(in_spec.rate);
                Some(RateConverter::new(method, ratio, out_spec.channels as usize)?)
            } else {
                None
            };

            Kind::Pipeline(Pipeline {
                converter,
                pending: vec![Vec::new(); out_spec.channels as usize],
            })
        };

        Ok(Resampler {
            in_spec: *in_spec,
            out_spec: *out_spec,
            in_map: *in_map,
            out_map: *out_map,
            in_fz: in_spec.frame_size(),
            out_fz: out_spec.frame_size(),
            method,
            stat: stat.cloned(),
            kind,
        })
    }

    /// The configured method (after any fallback).
    pub fn method(&self) -> ResampleMethod {
        self.method
    }

    /// The input spec.
    pub fn input_spec(&self) -> &SampleSpec {
        &self.in_spec
    }

    /// The output spec.
    pub fn output_spec(&self) -> &SampleSpec {
        &self.out_spec
    }

    /// How many input bytes are needed to produce roughly `out_length`
    /// output bytes.
    pub fn request(&self, out_length: usize) -> usize {
        assert!(out_length % self.out_fz == 0);

        ((out_length / self.out_fz) as u64 * u64::from(self.in_spec.rate)
            / u64::from(self.out_spec.rate)) as usize
            * self.in_fz
    }

    /// Changes the input rate, preserving converter state. Used to
    /// compensate clock skew between nominally synchronized devices.
    pub fn set_input_rate(&mut self, rate: u32) {
        assert!(rate > 0);

        if self.in_spec.rate == rate {
            return;
        }

        self.in_spec.rate = rate;

        match &mut self.kind {
            Kind::Passthrough => {
                // The rates no longer agree; grow a pipeline on the fly.
                let mut pipeline = Pipeline {
                    converter: None,
                    pending: vec![Vec::new(); self.out_spec.channels as usize],
                };
                if self.method != ResampleMethod::Trivial {
                    let ratio = f64::from(self.out_spec.rate) / f64::from(rate);
                    match RateConverter::new(self.method, ratio, self.out_spec.channels as usize) {
                        Ok(c) => pipeline.converter = Some(c),
                        Err(e) => log::warn!("cannot enable rate conversion: {e}"),
                    }
                    self.kind = Kind::Pipeline(pipeline);
                } else {
                    self.kind = Kind::Trivial {
                        i_counter: 0,
                        o_counter: 0,
                    };
                }
            }
            Kind::Trivial {
                i_counter,
                o_counter,
            } => {
                *i_counter = 0;
                *o_counter = 0;
            }
            Kind::Pipeline(p) => {
                let ratio = f64::from(self.out_spec.rate) / f64::from(rate);
                match &mut p.converter {
                    Some(c) => c.set_ratio(ratio),
                    None => match RateConverter::new(
                        self.method,
                        ratio,
                        self.out_spec.channels as usize,
                    ) {
                        Ok(c) => p.converter = Some(c),
                        Err(e) => log::warn!("cannot enable rate conversion: {e}"),
                    },
                }
            }
        }
    }

    /// Feeds one chunk through the pipeline. Returns `None` when the rate
    /// converter needs more input before it can produce anything.
    ///
    /// `input.length` must be a whole number of input frames.
    pub fn run(&mut self, input: &Memchunk) -> Option<Memchunk> {
        assert!(input.length > 0 && input.length % self.in_fz == 0);

        match &mut self.kind {
            Kind::Passthrough => Some(input.clone()),
            Kind::Trivial {
                i_counter,
                o_counter,
            } => trivial_run(
                input,
                self.in_fz,
                self.in_spec.rate,
                self.out_spec.rate,
                i_counter,
                o_counter,
                self.stat.as_ref(),
            ),
            Kind::Pipeline(p) => {
                let nframes = input.length / self.in_fz;

                // Stage 1: decode to f32.
                let mut decoded = vec![0.0f32; nframes * self.in_spec.channels as usize];
                sconv::to_float32ne(self.in_spec.format, &input.bytes(), &mut decoded);

                // Stage 2: remap channels by position.
                let remapped = remap_channels(&decoded, &self.in_map, &self.out_map);
                let out_channels = self.out_spec.channels as usize;

                // Stage 3: rational rate conversion.
                let produced: Vec<f32> = match &mut p.converter {
                    None => remapped,
                    Some(converter) => {
                        for (ch, buf) in p.pending.iter_mut().enumerate() {
                            buf.extend(
                                remapped
                                    .iter()
                                    .skip(ch)
                                    .step_by(out_channels)
                                    .copied(),
                            );
                        }

                        let mut out: Vec<Vec<f32>> = vec![Vec::new(); out_channels];
                        while p.pending[0].len() >= converter.input_frames_next() {
                            let take = converter.input_frames_next();
                            let call: Vec<Vec<f32>> = p
                                .pending
                                .iter_mut()
                                .map(|buf| buf.drain(..take).collect())
                                .collect();

                            for (acc, mut produced) in out.iter_mut().zip(converter.process(&call))
                            {
                                acc.append(&mut produced);
                            }
                        }

                        let frames = out[0].len();
                        let mut interleaved = vec![0.0f32; frames * out_channels];
                        for (ch, buf) in out.iter().enumerate() {
                            for (i, v) in buf.iter().enumerate() {
                                interleaved[i * out_channels + ch] = *v;
                            }
                        }

                        interleaved
                    }
                };

                if produced.is_empty() {
                    return None;
                }

                // Stage 4: encode to the target format.
                let mut bytes =
                    vec![0u8; produced.len() * self.out_spec.format.sample_size()];
                sconv::from_float32ne(self.out_spec.format, &produced, &mut bytes);

                Some(Memchunk::from_block(Memblock::new_dynamic(
                    bytes,
                    self.stat.as_ref(),
                )))
            }
        }
    }
}

/// The non-interpolating decimator/replicator.
fn trivial_run(
    input: &Memchunk,
    fz: usize,
    in_rate: u32,
    out_rate: u32,
    i_counter: &mut u64,
    o_counter: &mut u64,
    stat: Option<&MemblockStat>,
) -> Option<Memchunk> {
    let nframes = (input.length / fz) as u64;

    let result = if in_rate == out_rate {
        *o_counter += nframes;
        Some(input.clone())
    } else {
        let capacity = ((((nframes + 1) * u64::from(out_rate)) / u64::from(in_rate)) + 1) as usize * fz;
        let block = Memblock::new(capacity, stat);

        let mut o_index = 0usize;
        {
            let src = input.bytes();
            let mut dst = block.data_mut();

            loop {
                let j = *o_counter * u64::from(in_rate) / u64::from(out_rate);
                let j = j.saturating_sub(*i_counter);
                if j >= nframes {
                    break;
                }

                let j = j as usize;
                dst[o_index * fz..(o_index + 1) * fz].copy_from_slice(&src[j * fz..(j + 1) * fz]);

                o_index += 1;
                *o_counter += 1;
            }
        }

        if o_index == 0 {
            None
        } else {
            Some(Memchunk::new(block, 0, o_index * fz))
        }
    };

    *i_counter += nframes;

    // Keep the counters small.
    while *i_counter >= u64::from(in_rate) && *o_counter >= u64::from(out_rate) {
        *i_counter -= u64::from(in_rate);
        *o_counter -= u64::from(out_rate);
    }

    result
}

/// Remaps interleaved frames from one channel layout to another.
///
/// Mono output averages all input channels; mono input is duplicated to
/// every output channel; otherwise channels are matched by position tag,
/// and output channels with no counterpart stay silent.
fn remap_channels(data: &[f32], in_map: &ChannelMap, out_map: &ChannelMap) -> Vec<f32> {
    let in_ch = in_map.num_channels() as usize;
    let out_ch = out_map.num_channels() as usize;
    assert!(in_ch > 0 && data.len() % in_ch == 0);

    if in_ch == out_ch && in_map.equal(out_map) {
        return data.to_vec();
    }

    let frames = data.len() / in_ch;
    let mut out = vec![0.0f32; frames * out_ch];

    if out_ch == 1 {
        for f in 0..frames {
            let sum: f32 = data[f * in_ch..(f + 1) * in_ch].iter().sum();
            out[f] = sum / in_ch as f32;
        }
        return out;
    }

    if in_ch == 1 {
        for f in 0..frames {
            for c in 0..out_ch {
                out[f * out_ch + c] = data[f];
            }
        }
        return out;
    }

    // Positional matching: each output channel takes the first input
    // channel with the same position, or silence.
    let source: Vec<Option<usize>> = (0..out_ch)
        .map(|c| {
            let want = out_map.position(c)?;
            in_map.positions().iter().position(|p| *p == want)
        })
        .collect();

    for f in 0..frames {
        for (c, src) in source.iter().enumerate() {
            if let Some(s) = src {
                out[f * out_ch + c] = data[f * in_ch + s];
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{SampleFormat, SAMPLE_FLOAT32NE, SAMPLE_S16NE};
    use pretty_assertions::assert_eq;

    fn s16_chunk(samples: &[i16]) -> Memchunk {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        Memchunk::from_block(Memblock::new_dynamic(bytes, None))
    }

    fn spec(format: SampleFormat, channels: u8, rate: u32) -> SampleSpec {
        SampleSpec::new(format, channels, rate).unwrap()
    }

    #[test]
    fn identity_is_byte_perfect() {
        let ss = spec(SAMPLE_S16NE, 2, 44100);
        let map = ChannelMap::init_auto(2);

        for method in [
            ResampleMethod::BestSinc,
            ResampleMethod::FastestSinc,
            ResampleMethod::Linear,
            ResampleMethod::Trivial,
        ] {
            let mut r = Resampler::new(&ss, &map, &ss, &map, None, method).unwrap();
            let input = s16_chunk(&[1, -1, 30000, -30000]);
            let out = r.run(&input).expect("identity produces output");
            assert_eq!(&*out.bytes(), &*input.bytes());
            assert!(std::rc::Rc::ptr_eq(&out.memblock, &input.memblock));
        }
    }

    #[test]
    fn format_conversion_without_rate_change() {
        let in_ss = spec(SAMPLE_S16NE, 1, 8000);
        let out_ss = spec(SAMPLE_FLOAT32NE, 1, 8000);
        let map = ChannelMap::init_auto(1);

        let mut r =
            Resampler::new(&in_ss, &map, &out_ss, &map, None, ResampleMethod::FastestSinc).unwrap();
        let out = r.run(&s16_chunk(&[0, 16384, -16384])).unwrap();

        let floats: Vec<f32> = out
            .bytes()
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats, vec![0.0, 0.5, -0.5]);
    }

    #[test]
    fn upmix_duplicates_mono() {
        let in_ss = spec(SAMPLE_S16NE, 1, 8000);
        let out_ss = spec(SAMPLE_S16NE, 2, 8000);

        let mut r = Resampler::new(
            &in_ss,
            &ChannelMap::init_auto(1),
            &out_ss,
            &ChannelMap::init_auto(2),
            None,
            ResampleMethod::FastestSinc,
        )
        .unwrap();

        let out = r.run(&s16_chunk(&[100, -100])).unwrap();
        let samples: Vec<i16> = out
            .bytes()
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![100, 100, -100, -100]);
    }

    #[test]
    fn downmix_to_mono_averages() {
        let in_ss = spec(SAMPLE_S16NE, 2, 8000);
        let out_ss = spec(SAMPLE_S16NE, 1, 8000);

        let mut r = Resampler::new(
            &in_ss,
            &ChannelMap::init_auto(2),
            &out_ss,
            &ChannelMap::init_auto(1),
            None,
            ResampleMethod::FastestSinc,
        )
        .unwrap();

        let out = r.run(&s16_chunk(&[1000, 3000])).unwrap();
        let samples: Vec<i16> = out
            .bytes()
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![2000]);
    }

    #[test]
    fn trivial_downsampling_conserves_ratio() {
        let in_ss = spec(SAMPLE_S16NE, 1, 48000);
        let out_ss = spec(SAMPLE_S16NE, 1, 24000);
        let map = ChannelMap::init_auto(1);

        let mut r =
            Resampler::new(&in_ss, &map, &out_ss, &map, None, ResampleMethod::Trivial).unwrap();
        assert_eq!(r.method(), ResampleMethod::Trivial);

        let mut produced = 0usize;
        for _ in 0..10 {
            let input = s16_chunk(&[7; 480]);
            if let Some(out) = r.run(&input) {
                produced += out.length / 2;
            }
        }

        // 4800 frames in at 2:1 should give 2400 out, within a frame.
        assert!((produced as i64 - 2400).abs() <= 1, "got {produced}");
    }

    #[test]
    fn sinc_resampling_conserves_ratio() {
        let in_ss = spec(SAMPLE_S16NE, 1, 48000);
        let out_ss = spec(SAMPLE_S16NE, 1, 44100);
        let map = ChannelMap::init_auto(1);

        let mut r = Resampler::new(&in_ss, &map, &out_ss, &map, None, ResampleMethod::FastestSinc)
            .unwrap();

        let mut consumed = 0usize;
        let mut produced = 0usize;
        for _ in 0..20 {
            let input = s16_chunk(&[0; 2048]);
            consumed += 2048;
            if let Some(out) = r.run(&input) {
                produced += out.length / 2;
            }
        }

        let expected = consumed as f64 * 44100.0 / 48000.0;
        // The converter holds back up to a couple of chunks of latency.
        assert!(
            (produced as f64) < expected + CHUNK_FRAMES as f64
                && (produced as f64) > expected - 2.0 * CHUNK_FRAMES as f64,
            "consumed {consumed}, produced {produced}, expected about {expected}"
        );
    }

    #[test]
    fn request_is_roughly_inverse() {
        let in_ss = spec(SAMPLE_S16NE, 2, 48000);
        let out_ss = spec(SAMPLE_S16NE, 2, 44100);
        let map = ChannelMap::init_auto(2);

        let r = Resampler::new(&in_ss, &map, &out_ss, &map, None, ResampleMethod::FastestSinc)
            .unwrap();

        let needed = r.request(4096);
        let frames_out = 4096 / 4;
        let frames_in = needed / 4;
        assert_eq!(frames_in, frames_out * 48000 / 44100);
    }

    #[test]
    fn trivial_requested_for_differing_formats_falls_back() {
        let in_ss = spec(SAMPLE_S16NE, 1, 8000);
        let out_ss = spec(SAMPLE_FLOAT32NE, 1, 4000);
        let map = ChannelMap::init_auto(1);

        let r = Resampler::new(&in_ss, &map, &out_ss, &map, None, ResampleMethod::Trivial).unwrap();
        assert_eq!(r.method(), ResampleMethod::ZeroOrderHold);
    }
}
