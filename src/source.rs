//! Capture endpoints.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel_map::ChannelMap;
use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::memblock::Memchunk;
use crate::module::Module;
use crate::namereg::{NameregKind, NameregValue};
use crate::sample::SampleSpec;
use crate::sink::Sink;
use crate::source_output::SourceOutput;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};

/// At most this many recording streams can attach to one source.
pub const MAX_OUTPUTS_PER_SOURCE: usize = 32;

/// Source lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// The source is live and can accept outputs.
    Running,
    /// The source has been torn down.
    Disconnected,
}

/// Implementation hooks supplied by the owning module.
pub trait SourceImpl {
    /// The device-side capture latency.
    fn latency(&mut self, source: &Rc<Source>) -> Option<Duration> {
        let _ = source;
        None
    }
}

/// A capture endpoint producing PCM, either from a device module or as
/// the monitor of a sink.
pub struct Source {
    core: Weak<Core>,
    index: Cell<u32>,
    name: RefCell<String>,
    description: RefCell<Option<String>>,
    driver: Option<String>,
    owner: RefCell<Option<Weak<Module>>>,
    sample_spec: SampleSpec,
    channel_map: ChannelMap,
    state: Cell<SourceState>,
    pub(crate) outputs: RefCell<Vec<Rc<SourceOutput>>>,
    monitor_of: RefCell<Weak<Sink>>,
    imp: RefCell<Option<Box<dyn SourceImpl>>>,
}

impl Source {
    /// Creates and registers a source. With `strict`, a name collision
    /// fails; otherwise a free variant of the name is chosen.
    pub fn new(
        core: &Rc<Core>,
        name: &str,
        driver: Option<&str>,
        strict: bool,
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
    ) -> Result<Rc<Source>, Error> {
        if !spec.valid() {
            return Err(Error::Invalid("invalid sample spec".into()));
        }

        let source = Rc::new(Source {
            core: core.weak_self.clone(),
            index: Cell::new(INVALID_INDEX),
            name: RefCell::new(String::new()),
            description: Default::default(),
            driver: driver.map(str::to_owned),
            owner: Default::default(),
            sample_spec: *spec,
            channel_map: map
                .copied()
                .unwrap_or_else(|| ChannelMap::init_auto(spec.channels)),
            state: Cell::new(SourceState::Running),
            outputs: Default::default(),
            monitor_of: RefCell::new(Weak::new()),
            imp: Default::default(),
        });

        let chosen = core.namereg_register(
            name,
            NameregKind::Source,
            NameregValue::Source(Rc::downgrade(&source)),
            strict,
        )?;
        *source.name.borrow_mut() = chosen;

        let index = core.sources.borrow_mut().put(source.clone());
        source.index.set(index);

        log::info!(
            "created source {} \"{}\" with sample spec \"{}\"",
            index,
            source.name(),
            spec
        );
        core.subscription_post(
            SubscriptionFacility::Source,
            SubscriptionOperation::New,
            index,
        );

        Ok(source)
    }

    /// The source's index.
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

    /// The source's sample spec.
    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    /// The source's channel map.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        self.state.get()
    }

    /// The sink this source monitors, if it is a monitor source.
    pub fn monitor_of(&self) -> Option<Rc<Sink>> {
        self.monitor_of.borrow().upgrade()
    }

    /// Whether this is the monitor of some sink.
    pub fn is_monitor(&self) -> bool {
        self.monitor_of.borrow().upgrade().is_some()
    }

    pub(crate) fn set_monitor_of(&self, sink: &Rc<Sink>) {
        *self.monitor_of.borrow_mut() = Rc::downgrade(sink);
    }

    /// The owning module.
    pub fn owner(&self) -> Option<Rc<Module>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Records the owning module.
    pub fn set_owner(&self, module: Option<&Rc<Module>>) {
        *self.owner.borrow_mut() = module.map(Rc::downgrade);
    }

    /// Installs the module-side implementation hooks.
    pub fn set_impl(&self, imp: Box<dyn SourceImpl>) {
        *self.imp.borrow_mut() = Some(imp);
    }

    /// The device-side capture latency.
    pub fn latency(self: &Rc<Self>) -> Duration {
        let mut imp = self.imp.borrow_mut();
        imp.as_mut()
            .and_then(|i| i.latency(self))
            .unwrap_or(Duration::ZERO)
    }

    /// Pushes a captured chunk to every attached output, in insertion
    /// order.
    pub fn post(&self, chunk: &Memchunk) {
        assert!(chunk.length > 0);

        let outputs: Vec<Rc<SourceOutput>> = self.outputs.borrow().clone();
        for output in outputs {
            output.push(chunk);
        }
    }

    /// Tears the source down: kills every attached output, unregisters
    /// the name, and posts the removal event.
    pub fn disconnect(self: &Rc<Self>) {
        if self.state.get() == SourceState::Disconnected {
            return;
        }

        let Some(core) = self.core.upgrade() else {
            return;
        };

        core.namereg_unregister(NameregKind::Source, &self.name());

        loop {
            let first = self.outputs.borrow().first().cloned();
            match first {
                Some(o) => {
                    o.kill();
                    assert!(
                        self.outputs
                            .borrow()
                            .first()
                            .is_none_or(|n| !Rc::ptr_eq(n, &o)),
                        "source output did not disconnect on kill"
                    );
                }
                None => break,
            }
        }

        core.sources
            .borrow_mut()
            .remove_by(|s| Rc::ptr_eq(s, self));
        core.subscription_post(
            SubscriptionFacility::Source,
            SubscriptionOperation::Remove,
            self.index.get(),
        );

        self.imp.borrow_mut().take();
        self.state.set(SourceState::Disconnected);
        log::info!("freed source {} \"{}\"", self.index.get(), self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use crate::memblock::Memblock;
    use crate::sample::{SampleSpec, SAMPLE_S16NE};
    use crate::source_output::{SourceOutput, SourceOutputConsumer};
    use pretty_assertions::assert_eq;

    fn setup() -> (Rc<Core>, Rc<Source>) {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        let spec = SampleSpec::new(SAMPLE_S16NE, 1, 8000).unwrap();
        let source = Source::new(&core, "mic", None, true, &spec, None).unwrap();
        (core, source)
    }

    struct TapConsumer {
        tag: u8,
        order: Rc<RefCell<Vec<u8>>>,
    }

    impl SourceOutputConsumer for TapConsumer {
        fn push(&mut self, _output: &Rc<SourceOutput>, chunk: &Memchunk) {
            assert!(chunk.length > 0);
            self.order.borrow_mut().push(self.tag);
        }
    }

    fn attach(core: &Rc<Core>, source: &Rc<Source>, tag: u8, order: &Rc<RefCell<Vec<u8>>>) -> Rc<SourceOutput> {
        let spec = *source.sample_spec();
        let output =
            SourceOutput::new(core, source, "tap", None, &spec, None, None).unwrap();
        output.set_consumer(Box::new(TapConsumer {
            tag,
            order: order.clone(),
        }));
        output
    }

    #[test]
    fn post_fans_out_in_insertion_order() {
        let (core, source) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));

        let _a = attach(&core, &source, 1, &order);
        let _b = attach(&core, &source, 2, &order);
        let _c = attach(&core, &source, 3, &order);

        let chunk = Memchunk::from_block(Memblock::new_dynamic(vec![0; 16], None));
        source.post(&chunk);
        source.post(&chunk);

        assert_eq!(&*order.borrow(), &[1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn corked_outputs_are_skipped() {
        let (core, source) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));

        let a = attach(&core, &source, 1, &order);
        let _b = attach(&core, &source, 2, &order);

        a.cork(true);
        let chunk = Memchunk::from_block(Memblock::new_dynamic(vec![0; 16], None));
        source.post(&chunk);
        assert_eq!(&*order.borrow(), &[2]);

        a.cork(false);
        source.post(&chunk);
        assert_eq!(&*order.borrow(), &[2, 1, 2]);
    }

    #[test]
    fn disconnect_detaches_outputs() {
        let (core, source) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));
        let _a = attach(&core, &source, 1, &order);

        source.disconnect();
        assert_eq!(source.state(), SourceState::Disconnected);
        assert!(core.source_outputs.borrow().is_empty());
        assert!(core.lookup_source(Some("mic"), false).is_none());
    }
}
