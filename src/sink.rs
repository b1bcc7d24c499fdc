//! Playback endpoints: rendering, mixing, and the monitor tap.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel_map::ChannelMap;
use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::memblock::{Memblock, Memchunk};
use crate::module::Module;
use crate::namereg::{NameregKind, NameregValue};
use crate::sample::SampleSpec;
use crate::sample_util::{self, MixInfo};
use crate::sink_input::SinkInput;
use crate::source::Source;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};
use crate::volume::{ChannelVolume, Volume};

/// At most this many playback streams can attach to one sink, and at
/// most this many are mixed per render call.
pub const MAX_INPUTS_PER_SINK: usize = 32;

/// Sink lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SinkState {
    /// The sink is live and can accept inputs.
    Running,
    /// The sink has been torn down.
    Disconnected,
}

/// Which of the split volumes an operation addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MixerMode {
    /// The software volume applied in the mixer.
    Software,
    /// The device mixer, where the module supports one.
    Hardware,
    /// Hardware iff the module registered hardware-volume support,
    /// software otherwise.
    Auto,
}

/// Implementation hooks supplied by the owning module.
pub trait SinkImpl {
    /// Input state changed (data became available, a stream uncorked);
    /// the module decides whether to schedule rendering.
    fn notify(&mut self, sink: &Rc<Sink>) {
        let _ = sink;
    }

    /// The device-side playback latency.
    fn latency(&mut self, sink: &Rc<Sink>) -> Option<Duration> {
        let _ = sink;
        None
    }

    /// Whether the device has a hardware mixer the core may drive.
    fn hw_volume_supported(&self) -> bool {
        false
    }

    /// Writes the hardware volume to the device.
    fn set_hw_volume(&mut self, sink: &Rc<Sink>, volume: &ChannelVolume) {
        let _ = (sink, volume);
    }

    /// Reads the hardware volume back from the device.
    fn get_hw_volume(&mut self, sink: &Rc<Sink>) -> Option<ChannelVolume> {
        let _ = sink;
        None
    }
}

/// A playback endpoint that mixes its attached inputs into one PCM
/// stream, with an implicit monitor source shadowing its output.
pub struct Sink {
    core: Weak<Core>,
    index: Cell<u32>,
    name: RefCell<String>,
    description: RefCell<Option<String>>,
    driver: Option<String>,
    owner: RefCell<Option<Weak<Module>>>,
    sample_spec: SampleSpec,
    channel_map: ChannelMap,
    state: Cell<SinkState>,
    pub(crate) inputs: RefCell<Vec<Rc<SinkInput>>>,
    sw_volume: RefCell<ChannelVolume>,
    hw_volume: RefCell<ChannelVolume>,
    monitor: RefCell<Option<Rc<Source>>>,
    imp: RefCell<Option<Box<dyn SinkImpl>>>,
}

impl Sink {
    /// Creates and registers a sink, along with its monitor source
    /// (named `<sink>_monitor`). With `strict`, a name collision fails;
    /// otherwise a free variant of the name is chosen.
    pub fn new(
        core: &Rc<Core>,
        name: &str,
        driver: Option<&str>,
        strict: bool,
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
    ) -> Result<Rc<Sink>, Error> {
        if !spec.valid() {
            return Err(Error::Invalid("invalid sample spec".into()));
        }

        let channel_map = map
            .copied()
            .unwrap_or_else(|| ChannelMap::init_auto(spec.channels));

        let sink = Rc::new(Sink {
            core: core.weak_self.clone(),
            index: Cell::new(INVALID_INDEX),
            name: RefCell::new(String::new()),
            description: Default::default(),
            driver: driver.map(str::to_owned),
            owner: Default::default(),
            sample_spec: *spec,
            channel_map,
            state: Cell::new(SinkState::Running),
            inputs: Default::default(),
            sw_volume: RefCell::new(ChannelVolume::norm(spec.channels)),
            hw_volume: RefCell::new(ChannelVolume::norm(spec.channels)),
            monitor: Default::default(),
            imp: Default::default(),
        });

        let chosen = core.namereg_register(
            name,
            NameregKind::Sink,
            NameregValue::Sink(Rc::downgrade(&sink)),
            strict,
        )?;
        *sink.name.borrow_mut() = chosen.clone();

        // The monitor source shares the sink's spec and map.
        let monitor = Source::new(
            core,
            &format!("{chosen}_monitor"),
            driver,
            false,
            spec,
            Some(&sink.channel_map),
        )?;
        monitor.set_monitor_of(&sink);
        monitor.set_description(Some(&format!("Monitor source of sink '{chosen}'")));
        *sink.monitor.borrow_mut() = Some(monitor);

        let index = core.sinks.borrow_mut().put(sink.clone());
        sink.index.set(index);

        log::info!(
            "created sink {} \"{}\" with sample spec \"{}\"",
            index,
            chosen,
            spec
        );
        core.subscription_post(
            SubscriptionFacility::Sink,
            SubscriptionOperation::New,
            index,
        );

        Ok(sink)
    }

    /// The sink's index.
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    /// The registered name.
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// The human-readable description, if set.
    pub fn description(&self) -> Option<String> {
        self.description.borrow().clone()
    }

    /// Sets the description.
    pub fn set_description(&self, description: Option<&str>) {
        *self.description.borrow_mut() = description.map(str::to_owned);
    }

    /// The driver name given at creation.
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// The sink's sample spec.
    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    /// The sink's channel map.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SinkState {
        self.state.get()
    }

    /// The implicit monitor source.
    pub fn monitor_source(&self) -> Option<Rc<Source>> {
        self.monitor.borrow().clone()
    }

    /// The owning module.
    pub fn owner(&self) -> Option<Rc<Module>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Records the owning module on the sink and its monitor.
    pub fn set_owner(&self, module: Option<&Rc<Module>>) {
        *self.owner.borrow_mut() = module.map(Rc::downgrade);
        if let Some(monitor) = &*self.monitor.borrow() {
            monitor.set_owner(module);
        }
    }

    /// Installs the module-side implementation hooks.
    pub fn set_impl(&self, imp: Box<dyn SinkImpl>) {
        *self.imp.borrow_mut() = Some(imp);
    }

    /// Tells the module that input state changed (a stream uncorked, data
    /// arrived) so it can schedule rendering.
    pub fn notify(self: &Rc<Self>) {
        let imp = self.imp.borrow_mut().take();
        if let Some(mut imp) = imp {
            imp.notify(self);
            if self.imp.borrow().is_none() {
                *self.imp.borrow_mut() = Some(imp);
            }
        }
    }

    /// The device-side playback latency.
    pub fn latency(self: &Rc<Self>) -> Duration {
        let imp = self.imp.borrow_mut().take();
        let mut result = Duration::ZERO;
        if let Some(mut imp) = imp {
            result = imp.latency(self).unwrap_or(Duration::ZERO);
            if self.imp.borrow().is_none() {
                *self.imp.borrow_mut() = Some(imp);
            }
        }

        result
    }

    /// Sets one of the sink's volumes, posting a change event when the
    /// value actually changes. Hardware writes are forwarded to the
    /// module.
    pub fn set_volume(self: &Rc<Self>, mode: MixerMode, volume: &ChannelVolume) {
        let hw = self.hw_volume_supported() && mode != MixerMode::Software;

        {
            let slot = if hw { &self.hw_volume } else { &self.sw_volume };
            if *slot.borrow() == *volume {
                return;
            }
            *slot.borrow_mut() = *volume;
        }

        if let Some(core) = self.core.upgrade() {
            core.subscription_post(
                SubscriptionFacility::Sink,
                SubscriptionOperation::Change,
                self.index.get(),
            );
        }

        if hw {
            let imp = self.imp.borrow_mut().take();
            if let Some(mut imp) = imp {
                imp.set_hw_volume(self, volume);
                if self.imp.borrow().is_none() {
                    *self.imp.borrow_mut() = Some(imp);
                }
            }
        }
    }

    /// Reads one of the sink's volumes; the hardware volume is refreshed
    /// from the module first.
    pub fn volume(self: &Rc<Self>, mode: MixerMode) -> ChannelVolume {
        if self.hw_volume_supported() && mode != MixerMode::Software {
            let imp = self.imp.borrow_mut().take();
            if let Some(mut imp) = imp {
                if let Some(v) = imp.get_hw_volume(self) {
                    *self.hw_volume.borrow_mut() = v;
                }
                if self.imp.borrow().is_none() {
                    *self.imp.borrow_mut() = Some(imp);
                }
            }

            *self.hw_volume.borrow()
        } else {
            *self.sw_volume.borrow()
        }
    }

    fn hw_volume_supported(&self) -> bool {
        self.imp
            .borrow()
            .as_ref()
            .is_some_and(|i| i.hw_volume_supported())
    }

    /// Peeks every running input, in insertion order, up to the mix cap.
    fn fill_mix_info(&self) -> (Vec<Rc<SinkInput>>, Vec<MixInfo>) {
        let inputs: Vec<Rc<SinkInput>> = self.inputs.borrow().clone();
        let mut peeked = Vec::new();
        let mut infos = Vec::new();

        for input in inputs {
            if infos.len() >= MAX_INPUTS_PER_SINK {
                break;
            }

            if let Some((chunk, volume)) = input.peek() {
                assert!(chunk.length > 0);
                peeked.push(input);
                infos.push(MixInfo { chunk, volume });
            }
        }

        (peeked, infos)
    }

    /// Consumes `length` bytes from every peeked input.
    fn inputs_drop(&self, inputs: Vec<Rc<SinkInput>>, infos: Vec<MixInfo>, length: usize) {
        for (input, info) in inputs.into_iter().zip(infos) {
            input.drop(&info.chunk, length.min(info.chunk.length));
        }
    }

    /// Pulls up to `length` bytes of mixed output. Returns `None` when no
    /// input had data. The result is also posted to the monitor source.
    pub fn render(self: &Rc<Self>, length: usize) -> Option<Memchunk> {
        assert!(length > 0);
        let core = self.core.upgrade()?;

        let (inputs, infos) = self.fill_mix_info();
        if infos.is_empty() {
            return None;
        }

        let result = if infos.len() == 1 {
            let info = &infos[0];
            let mut result = info.chunk.clone();
            if result.length > length {
                result.length = length;
            }

            let compound = self.sw_volume.borrow().multiply(&info.volume);
            if !compound.channels_equal_to(Volume::NORM) {
                result.make_writable(Some(core.memblock_stat()));
                sample_util::volume_memchunk(&mut result, &self.sample_spec, &compound);
            }

            result
        } else {
            let block = Memblock::new(length, Some(core.memblock_stat()));
            let mixed = {
                let mut data = block.data_mut();
                sample_util::mix(&infos, &mut data, &self.sample_spec, &self.sw_volume.borrow())
            };
            assert!(mixed > 0);

            Memchunk::new(block, 0, mixed)
        };

        let consumed = result.length;
        self.inputs_drop(inputs, infos, consumed);

        if let Some(monitor) = &*self.monitor.borrow() {
            monitor.post(&result);
        }

        Some(result)
    }

    /// Renders directly into `target`'s bytes, shortening `target` to the
    /// amount produced. Returns false when no input had data.
    pub fn render_into(self: &Rc<Self>, target: &mut Memchunk) -> bool {
        assert!(target.length > 0);
        let (inputs, infos) = self.fill_mix_info();
        if infos.is_empty() {
            return false;
        }

        let produced = if infos.len() == 1 {
            let info = &infos[0];
            let l = target.length.min(info.chunk.length);

            target.bytes_mut()[..l].copy_from_slice(&info.chunk.bytes()[..l]);
            target.length = l;

            let compound = self.sw_volume.borrow().multiply(&info.volume);
            if !compound.channels_equal_to(Volume::NORM) {
                sample_util::volume_memchunk(target, &self.sample_spec, &compound);
            }

            l
        } else {
            let mixed = {
                let mut data = target.bytes_mut();
                sample_util::mix(&infos, &mut data, &self.sample_spec, &self.sw_volume.borrow())
            };
            target.length = mixed;
            mixed
        };

        assert!(produced > 0);
        self.inputs_drop(inputs, infos, produced);

        if let Some(monitor) = &*self.monitor.borrow() {
            monitor.post(target);
        }

        true
    }

    /// Renders into all of `target`, looping until it is full and padding
    /// any shortfall with silence.
    pub fn render_into_full(self: &Rc<Self>, target: &mut Memchunk) {
        assert!(target.length > 0);

        let total = target.length;
        let mut done = 0usize;

        while done < total {
            let mut part = Memchunk::new(
                target.memblock.share(),
                target.index + done,
                total - done,
            );

            if !self.render_into(&mut part) {
                break;
            }

            done += part.length;
        }

        if done < total {
            let mut rest = Memchunk::new(target.memblock.share(), target.index + done, total - done);
            sample_util::silence_memchunk(&mut rest, &self.sample_spec);
        }
    }

    /// Renders exactly `length` bytes, padding with silence if the inputs
    /// run dry.
    pub fn render_full(self: &Rc<Self>, length: usize) -> Memchunk {
        assert!(length > 0);

        let stat = self.core.upgrade().map(|c| c.memblock_stat().clone());
        let block = Memblock::new(length, stat.as_ref());
        let mut chunk = Memchunk::from_block(block);
        self.render_into_full(&mut chunk);
        chunk
    }

    /// Tears the sink down: kills every attached input, disconnects the
    /// monitor source, unregisters the name, and posts the removal event.
    pub fn disconnect(self: &Rc<Self>) {
        if self.state.get() == SinkState::Disconnected {
            return;
        }

        let Some(core) = self.core.upgrade() else {
            return;
        };

        core.namereg_unregister(NameregKind::Sink, &self.name());

        loop {
            let first = self.inputs.borrow().first().cloned();
            match first {
                Some(i) => {
                    i.kill();
                    assert!(
                        self.inputs
                            .borrow()
                            .first()
                            .is_none_or(|n| !Rc::ptr_eq(n, &i)),
                        "sink input did not disconnect on kill"
                    );
                }
                None => break,
            }
        }

        if let Some(monitor) = self.monitor.borrow_mut().take() {
            monitor.disconnect();
        }

        core.sinks.borrow_mut().remove_by(|s| Rc::ptr_eq(s, self));
        core.subscription_post(
            SubscriptionFacility::Sink,
            SubscriptionOperation::Remove,
            self.index.get(),
        );

        self.imp.borrow_mut().take();
        self.state.set(SinkState::Disconnected);
        log::info!("freed sink {} \"{}\"", self.index.get(), self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use crate::sample::{SampleSpec, SAMPLE_S16NE};
    use crate::sink_input::SinkInputProducer;
    use pretty_assertions::assert_eq;

    fn setup() -> (Rc<Core>, Rc<Sink>) {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        let spec = SampleSpec::new(SAMPLE_S16NE, 1, 8000).unwrap();
        let sink = Sink::new(&core, "out", None, true, &spec, None).unwrap();
        (core, sink)
    }

    struct BufferProducer {
        remaining: Option<Memchunk>,
        killed: Rc<Cell<bool>>,
    }

    impl BufferProducer {
        fn attach(core: &Rc<Core>, sink: &Rc<Sink>, samples: &[i16]) -> (Rc<SinkInput>, Rc<Cell<bool>>) {
            let spec = *sink.sample_spec();
            let input = SinkInput::new(core, sink, "test", None, &spec, None, false, None).unwrap();

            let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
            let killed = Rc::new(Cell::new(false));
            input.set_producer(Box::new(BufferProducer {
                remaining: Some(Memchunk::from_block(Memblock::new_dynamic(
                    bytes,
                    Some(core.memblock_stat()),
                ))),
                killed: killed.clone(),
            }));

            (input, killed)
        }
    }

    impl SinkInputProducer for BufferProducer {
        fn peek(&mut self, _input: &Rc<SinkInput>) -> Option<Memchunk> {
            self.remaining.clone().filter(|c| c.length > 0)
        }

        fn drop(&mut self, _input: &Rc<SinkInput>, _chunk: &Memchunk, length: usize) {
            if let Some(remaining) = &mut self.remaining {
                let length = length.min(remaining.length);
                remaining.index += length;
                remaining.length -= length;
            }
        }

        fn kill(&mut self, input: &Rc<SinkInput>) {
            self.killed.set(true);
            input.disconnect();
        }
    }

    #[test]
    fn single_input_at_norm_renders_byte_identical() {
        let (core, sink) = setup();
        let samples = [100i16, -100, 30000, -30000];
        let (_input, _) = BufferProducer::attach(&core, &sink, &samples);

        let rendered = sink.render(8).expect("data available");
        let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        assert_eq!(&*rendered.bytes(), &expected[..]);
    }

    #[test]
    fn two_inputs_at_half_volume_sum_to_the_average() {
        let (core, sink) = setup();
        let (a, _) = BufferProducer::attach(&core, &sink, &[1000; 8]);
        let (b, _) = BufferProducer::attach(&core, &sink, &[2000; 8]);

        let half = ChannelVolume::uniform(1, Volume::from_u32_clamped(0x8000));
        a.set_volume(&half);
        b.set_volume(&half);

        let rendered = sink.render(16).expect("data available");
        let first = {
            let bytes = rendered.bytes();
            i16::from_ne_bytes([bytes[0], bytes[1]])
        };
        assert_eq!(first, 1500);
    }

    #[test]
    fn sink_volume_scales_the_mix() {
        let (core, sink) = setup();
        let (_a, _) = BufferProducer::attach(&core, &sink, &[1000; 8]);
        let (_b, _) = BufferProducer::attach(&core, &sink, &[2000; 8]);

        sink.set_volume(
            MixerMode::Software,
            &ChannelVolume::uniform(1, Volume::from_u32_clamped(0x8000)),
        );

        let rendered = sink.render(16).expect("data available");
        let first = {
            let bytes = rendered.bytes();
            i16::from_ne_bytes([bytes[0], bytes[1]])
        };
        assert_eq!(first, 1500);
    }

    #[test]
    fn disconnect_kills_every_input_before_returning() {
        let (core, sink) = setup();
        let (_a, killed_a) = BufferProducer::attach(&core, &sink, &[0; 4]);
        let (_b, killed_b) = BufferProducer::attach(&core, &sink, &[0; 4]);

        sink.disconnect();
        assert!(killed_a.get() && killed_b.get());
        assert_eq!(sink.state(), SinkState::Disconnected);
        assert!(core.sink_inputs.borrow().is_empty());
    }

    #[test]
    fn render_full_pads_with_silence() {
        let (core, sink) = setup();
        let (_input, _) = BufferProducer::attach(&core, &sink, &[7; 4]);

        let chunk = sink.render_full(32);
        assert_eq!(chunk.length, 32);

        let bytes = chunk.bytes();
        // 8 bytes of data, then S16 silence.
        assert_eq!(&bytes[..8], [7i16; 4].iter().flat_map(|s| s.to_ne_bytes()).collect::<Vec<u8>>().as_slice());
        assert!(bytes[8..].iter().all(|b| *b == 0));
    }

    struct HwMixer {
        written: Rc<Cell<u32>>,
    }

    impl SinkImpl for HwMixer {
        fn hw_volume_supported(&self) -> bool {
            true
        }

        fn set_hw_volume(&mut self, _sink: &Rc<Sink>, volume: &ChannelVolume) {
            self.written.set(volume.avg().as_u32());
        }
    }

    #[test]
    fn auto_mode_routes_to_hardware_when_supported() {
        let (_core, sink) = setup();
        let written = Rc::new(Cell::new(0));
        sink.set_impl(Box::new(HwMixer {
            written: written.clone(),
        }));

        let half = ChannelVolume::uniform(1, Volume::from_u32_clamped(0x8000));
        sink.set_volume(MixerMode::Auto, &half);
        assert_eq!(written.get(), 0x8000, "the device mixer saw the write");

        // The software volume was left alone.
        assert_eq!(
            sink.volume(MixerMode::Software),
            ChannelVolume::norm(1)
        );
    }
}

