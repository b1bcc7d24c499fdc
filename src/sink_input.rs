//! Per-client adapters into a sink.
//!
//! A sink-input sits between a producer (the protocol stream, a sample
//! being played, a network receiver) and the sink mixer. It owns the
//! per-stream resampler and a one-chunk cache of resampled data, and it
//! decides *where* the stream's volume gets applied: normally the sink
//! mixer scales samples by the input's volume, but when the input's
//! channel map differs from the sink's, the mixer would map volumes to
//! the wrong channels, so the adjustment happens here, upstream of the
//! resampler, and the mixer is handed unity instead.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel_map::ChannelMap;
use crate::client::Client;
use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::memblock::Memchunk;
use crate::module::Module;
use crate::resampler::{ResampleMethod, Resampler};
use crate::sample::SampleSpec;
use crate::sample_util;
use crate::sink::{Sink, SinkState, MAX_INPUTS_PER_SINK};
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};
use crate::volume::ChannelVolume;

/// How much resampled data to aim for per conversion round, in bytes.
const CONVERT_BUFFER_LENGTH: usize = 4096;

/// Sink-input lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SinkInputState {
    /// Playing.
    Running,
    /// Paused; peeks return no data.
    Corked,
    /// Detached from its sink.
    Disconnected,
}

/// The producer side of a playback stream.
pub trait SinkInputProducer {
    /// Returns the stream's pending data, or `None` when the stream has
    /// nothing to play right now. The returned chunk stays valid until
    /// the matching [`SinkInputProducer::drop`].
    fn peek(&mut self, input: &Rc<SinkInput>) -> Option<Memchunk>;

    /// Consumes `length` bytes of the chunk returned by the previous
    /// peek.
    fn drop(&mut self, input: &Rc<SinkInput>, chunk: &Memchunk, length: usize);

    /// The server wants the stream gone; expected to end in
    /// [`SinkInput::disconnect`].
    fn kill(&mut self, input: &Rc<SinkInput>) {
        input.disconnect();
    }

    /// Client-side latency, if known.
    fn latency(&mut self, input: &Rc<SinkInput>) -> Option<Duration> {
        let _ = input;
        None
    }

    /// The stream was playing but had no data for a render round.
    fn underrun(&mut self, input: &Rc<SinkInput>) {
        let _ = input;
    }
}

/// A playback client's attachment to a sink.
pub struct SinkInput {
    core: Weak<Core>,
    index: Cell<u32>,
    name: RefCell<String>,
    driver: Option<String>,
    owner: RefCell<Option<Weak<Module>>>,
    client: RefCell<Option<Rc<Client>>>,
    sink: RefCell<Weak<Sink>>,
    sample_spec: Cell<SampleSpec>,
    channel_map: ChannelMap,
    volume: RefCell<ChannelVolume>,
    state: Cell<SinkInputState>,
    /// Whether the previous peek produced data; drives the underrun hook.
    playing: Cell<bool>,
    variable_rate: bool,
    /// Present iff the stream's spec or map differ from the sink's (or a
    /// variable rate was requested).
    resampler: RefCell<Option<Resampler>>,
    /// Resampled data waiting to be consumed by the mixer.
    resampled_chunk: RefCell<Option<Memchunk>>,
    producer: RefCell<Option<Box<dyn SinkInputProducer>>>,
}

impl SinkInput {
    /// Creates an input attached to `sink`, converting from the client's
    /// spec if necessary.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: &Rc<Core>,
        sink: &Rc<Sink>,
        name: &str,
        driver: Option<&str>,
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
        variable_rate: bool,
        resample_method: Option<ResampleMethod>,
    ) -> Result<Rc<SinkInput>, Error> {
        assert!(sink.state() == SinkState::Running);

        if sink.inputs.borrow().len() >= MAX_INPUTS_PER_SINK {
            log::warn!("failed to create sink input: too many inputs per sink");
            return Err(Error::Invalid("too many inputs per sink".into()));
        }

        let map = map
            .copied()
            .unwrap_or_else(|| ChannelMap::init_auto(spec.channels));
        let method = resample_method.unwrap_or_else(|| core.resample_method());

        let resampler = if variable_rate
            || sink.sample_spec() != spec
            || !sink.channel_map().equal(&map)
        {
            Some(Resampler::new(
                spec,
                &map,
                sink.sample_spec(),
                sink.channel_map(),
                Some(core.memblock_stat()),
                method,
            )?)
        } else {
            None
        };

        let input = Rc::new(SinkInput {
            core: core.weak_self.clone(),
            index: Cell::new(INVALID_INDEX),
            name: RefCell::new(name.to_owned()),
            driver: driver.map(str::to_owned),
            owner: Default::default(),
            client: Default::default(),
            sink: RefCell::new(Rc::downgrade(sink)),
            sample_spec: Cell::new(*spec),
            channel_map: map,
            volume: RefCell::new(ChannelVolume::norm(spec.channels)),
            state: Cell::new(SinkInputState::Running),
            playing: Cell::new(false),
            variable_rate,
            resampler: RefCell::new(resampler),
            resampled_chunk: Default::default(),
            producer: Default::default(),
        });

        let index = core.sink_inputs.borrow_mut().put(input.clone());
        input.index.set(index);
        sink.inputs.borrow_mut().push(input.clone());

        log::info!(
            "created sink input {} \"{}\" on {} with sample spec \"{}\"",
            index,
            name,
            sink.index(),
            spec
        );
        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::New,
            index,
        );

        Ok(input)
    }

    /// The input's index.
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    /// The stream name.
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// Renames the stream, posting a change event.
    pub fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_owned();
        if let Some(core) = self.core.upgrade() {
            core.subscription_post(
                SubscriptionFacility::SinkInput,
                SubscriptionOperation::Change,
                self.index.get(),
            );
        }
    }

    /// The driver name given at creation.
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// The client-side sample spec.
    pub fn sample_spec(&self) -> SampleSpec {
        self.sample_spec.get()
    }

    /// The client-side channel map.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SinkInputState {
        self.state.get()
    }

    /// The sink this input plays to, while attached.
    pub fn sink(&self) -> Option<Rc<Sink>> {
        self.sink.borrow().upgrade()
    }

    /// The owning client, if any.
    pub fn client(&self) -> Option<Rc<Client>> {
        self.client.borrow().clone()
    }

    /// Associates the input with a client.
    pub fn set_client(&self, client: Option<&Rc<Client>>) {
        *self.client.borrow_mut() = client.cloned();
    }

    /// The owning module.
    pub fn owner(&self) -> Option<Rc<Module>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Records the owning module.
    pub fn set_owner(&self, module: Option<&Rc<Module>>) {
        *self.owner.borrow_mut() = module.map(Rc::downgrade);
    }

    /// Installs the producer callbacks.
    pub fn set_producer(&self, producer: Box<dyn SinkInputProducer>) {
        *self.producer.borrow_mut() = Some(producer);
    }

    /// The stream's volume.
    pub fn volume(&self) -> ChannelVolume {
        *self.volume.borrow()
    }

    /// Sets the stream's volume, posting a change event when it actually
    /// changes.
    pub fn set_volume(&self, volume: &ChannelVolume) {
        if *self.volume.borrow() == *volume {
            return;
        }

        *self.volume.borrow_mut() = *volume;
        if let Some(core) = self.core.upgrade() {
            core.subscription_post(
                SubscriptionFacility::SinkInput,
                SubscriptionOperation::Change,
                self.index.get(),
            );
        }
    }

    /// The resample method in use, if a resampler is present.
    pub fn resample_method(&self) -> Option<ResampleMethod> {
        self.resampler.borrow().as_ref().map(|r| r.method())
    }

    fn producer_peek(self: &Rc<Self>) -> Option<Memchunk> {
        let cb = self.producer.borrow_mut().take();
        let mut result = None;
        if let Some(mut cb) = cb {
            result = cb.peek(self);
            if self.producer.borrow().is_none() {
                *self.producer.borrow_mut() = Some(cb);
            }
        }
        result
    }

    fn producer_drop(self: &Rc<Self>, chunk: &Memchunk, length: usize) {
        let cb = self.producer.borrow_mut().take();
        if let Some(mut cb) = cb {
            SinkInputProducer::drop(&mut *cb, self, chunk, length);
            if self.producer.borrow().is_none() {
                *self.producer.borrow_mut() = Some(cb);
            }
        }
    }

    /// Returns the input's pending data in the *sink's* format, along
    /// with the per-channel volume the mixer should apply to it.
    ///
    /// Corked or empty streams return `None`; a stream that was playing
    /// additionally gets its underrun hook invoked on the transition.
    pub fn peek(self: &Rc<Self>) -> Option<(Memchunk, ChannelVolume)> {
        let result = self.peek_inner();

        if result.is_none() && self.playing.get() {
            let cb = self.producer.borrow_mut().take();
            if let Some(mut cb) = cb {
                cb.underrun(self);
                if self.producer.borrow().is_none() {
                    *self.producer.borrow_mut() = Some(cb);
                }
            }
        }
        self.playing.set(result.is_some());

        result
    }

    fn peek_inner(self: &Rc<Self>) -> Option<(Memchunk, ChannelVolume)> {
        if self.state.get() != SinkInputState::Running {
            return None;
        }
        self.producer.borrow().as_ref()?;

        if self.resampler.borrow().is_none() {
            // No conversion: hand the producer's data straight to the
            // mixer, which applies our volume itself.
            let chunk = self.producer_peek()?;
            assert!(chunk.length > 0);
            return Some((chunk, *self.volume.borrow()));
        }

        let sink = self.sink()?;
        let adjust_volume_here = !self.channel_map.equal(sink.channel_map());

        while self.resampled_chunk.borrow().is_none() {
            let mut tchunk = self.producer_peek()?;
            assert!(tchunk.length > 0);

            if adjust_volume_here {
                let core = self.core.upgrade();
                tchunk.make_writable(core.as_ref().map(|c| c.memblock_stat()));
                sample_util::volume_memchunk(
                    &mut tchunk,
                    &self.sample_spec.get(),
                    &self.volume.borrow(),
                );
            }

            let consume = {
                let resampler = self.resampler.borrow();
                let resampler = resampler.as_ref().expect("resampler present");
                let out_fz = resampler.output_spec().frame_size();
                let target = (CONVERT_BUFFER_LENGTH / out_fz).max(1) * out_fz;
                let in_fz = resampler.input_spec().frame_size();
                resampler.request(target).max(in_fz).min(tchunk.length)
            };

            self.producer_drop(&tchunk, consume);
            tchunk.length = consume;

            let out = self.resampler.borrow_mut().as_mut().unwrap().run(&tchunk);
            if let Some(out) = out {
                *self.resampled_chunk.borrow_mut() = Some(out);
            }
        }

        let chunk = self
            .resampled_chunk
            .borrow()
            .as_ref()
            .expect("cache filled above")
            .clone();

        // If the volume was already applied upstream, the mixer must not
        // apply it a second time.
        let volume = if adjust_volume_here {
            ChannelVolume::norm(sink.sample_spec().channels)
        } else {
            *self.volume.borrow()
        };

        Some((chunk, volume))
    }

    /// Consumes `length` bytes of the chunk returned by the previous
    /// peek.
    pub fn drop(self: &Rc<Self>, chunk: &Memchunk, length: usize) {
        assert!(length > 0);

        if self.resampler.borrow().is_none() {
            self.producer_drop(chunk, length);
            return;
        }

        let mut cache = self.resampled_chunk.borrow_mut();
        let c = cache.as_mut().expect("drop without a prior peek");
        assert!(c.length >= length);

        c.index += length;
        c.length -= length;

        if c.length == 0 {
            *cache = None;
        }
    }

    /// Pauses or resumes the stream. Resuming notifies the sink so the
    /// module can schedule rendering again.
    pub fn cork(self: &Rc<Self>, corked: bool) {
        if self.state.get() == SinkInputState::Disconnected {
            return;
        }

        let resumed = self.state.get() == SinkInputState::Corked && !corked;

        self.state.set(if corked {
            SinkInputState::Corked
        } else {
            SinkInputState::Running
        });

        if resumed {
            if let Some(sink) = self.sink() {
                sink.notify();
            }
        }
    }

    /// Changes the stream's sample rate. Only legal for inputs created
    /// with `variable_rate`.
    pub fn set_rate(&self, rate: u32) -> Result<(), Error> {
        if !self.variable_rate {
            return Err(Error::Invalid("stream has a fixed rate".into()));
        }

        let mut spec = self.sample_spec.get();
        if spec.rate == rate {
            return Ok(());
        }

        spec.rate = rate;
        self.sample_spec.set(spec);
        self.resampler
            .borrow_mut()
            .as_mut()
            .expect("variable rate inputs always have a resampler")
            .set_input_rate(rate);

        Ok(())
    }

    /// Total playback latency: client side, buffered resampled data, and
    /// device side.
    pub fn latency(self: &Rc<Self>) -> Duration {
        let mut total = Duration::ZERO;

        let cb = self.producer.borrow_mut().take();
        if let Some(mut cb) = cb {
            if let Some(l) = cb.latency(self) {
                total += l;
            }
            if self.producer.borrow().is_none() {
                *self.producer.borrow_mut() = Some(cb);
            }
        }

        if let Some(sink) = self.sink() {
            if let Some(cached) = &*self.resampled_chunk.borrow() {
                total += sink.sample_spec().bytes_to_duration(cached.length);
            }
            total += sink.latency();
        }

        total
    }

    /// Asks the producer to end the stream. The kill hook is expected to
    /// tear the input down, so the producer is consumed, not restored.
    pub fn kill(self: &Rc<Self>) {
        let cb = self.producer.borrow_mut().take();
        match cb {
            Some(mut cb) => cb.kill(self),
            None => self.disconnect(),
        }
    }

    /// Detaches from the sink and the core, releasing the resampler
    /// cache.
    pub fn disconnect(self: &Rc<Self>) {
        if self.state.get() == SinkInputState::Disconnected {
            return;
        }

        let Some(core) = self.core.upgrade() else {
            return;
        };

        core.sink_inputs
            .borrow_mut()
            .remove_by(|i| Rc::ptr_eq(i, self));
        if let Some(sink) = self.sink() {
            sink.inputs.borrow_mut().retain(|i| !Rc::ptr_eq(i, self));
        }
        *self.sink.borrow_mut() = Weak::new();

        core.subscription_post(
            SubscriptionFacility::SinkInput,
            SubscriptionOperation::Remove,
            self.index.get(),
        );

        self.producer.borrow_mut().take();
        self.resampled_chunk.borrow_mut().take();
        self.playing.set(false);
        self.state.set(SinkInputState::Disconnected);
        log::info!("freed sink input {} \"{}\"", self.index.get(), self.name());
    }
}
