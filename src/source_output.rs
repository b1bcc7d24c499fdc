//! Per-client adapters out of a source.

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
use crate::source::{Source, SourceState, MAX_OUTPUTS_PER_SOURCE};
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};

/// Source-output lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SourceOutputState {
    /// Receiving data.
    Running,
    /// Paused; posted chunks are discarded.
    Corked,
    /// Detached from its source.
    Disconnected,
}

/// The client side of a recording stream, supplied by whoever created
/// the output.
pub trait SourceOutputConsumer {
    /// Receives one chunk of captured (and, if needed, resampled) data.
    fn push(&mut self, output: &Rc<SourceOutput>, chunk: &Memchunk);

    /// The server wants the stream gone; expected to end in
    /// [`SourceOutput::disconnect`].
    fn kill(&mut self, output: &Rc<SourceOutput>) {
        output.disconnect();
    }

    /// Client-side latency, if known.
    fn latency(&mut self, output: &Rc<SourceOutput>) -> Option<Duration> {
        let _ = output;
        None
    }
}

/// A recording client's attachment to a source.
pub struct SourceOutput {
    core: Weak<Core>,
    index: Cell<u32>,
    name: RefCell<String>,
    driver: Option<String>,
    owner: RefCell<Option<Weak<Module>>>,
    client: RefCell<Option<Rc<Client>>>,
    source: RefCell<Weak<Source>>,
    sample_spec: SampleSpec,
    channel_map: ChannelMap,
    state: Cell<SourceOutputState>,
    /// Present iff the client's spec differs from the source's.
    resampler: RefCell<Option<Resampler>>,
    consumer: RefCell<Option<Box<dyn SourceOutputConsumer>>>,
}

impl SourceOutput {
    /// Creates an output attached to `source`, converting to the client's
    /// spec if necessary.
    pub fn new(
        core: &Rc<Core>,
        source: &Rc<Source>,
        name: &str,
        driver: Option<&str>,
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
        resample_method: Option<ResampleMethod>,
    ) -> Result<Rc<SourceOutput>, Error> {
        assert!(source.state() == SourceState::Running);

        if source.outputs.borrow().len() >= MAX_OUTPUTS_PER_SOURCE {
            log::warn!("failed to create source output: too many outputs per source");
            return Err(Error::Invalid("too many outputs per source".into()));
        }

        let map = map
            .copied()
            .unwrap_or_else(|| ChannelMap::init_auto(spec.channels));
        let method = resample_method.unwrap_or_else(|| core.resample_method());

        // The resampler runs source-side data toward the client.
        let resampler = if source.sample_spec() != spec || !source.channel_map().equal(&map) {
            Some(Resampler::new(
                source.sample_spec(),
                source.channel_map(),
                spec,
                &map,
                Some(core.memblock_stat()),
                method,
            )?)
        } else {
            None
        };

        let output = Rc::new(SourceOutput {
            core: core.weak_self.clone(),
            index: Cell::new(INVALID_INDEX),
            name: RefCell::new(name.to_owned()),
            driver: driver.map(str::to_owned),
            owner: Default::default(),
            client: Default::default(),
            source: RefCell::new(Rc::downgrade(source)),
            sample_spec: *spec,
            channel_map: map,
            state: Cell::new(SourceOutputState::Running),
            resampler: RefCell::new(resampler),
            consumer: Default::default(),
        });

        let index = core.source_outputs.borrow_mut().put(output.clone());
        output.index.set(index);
        source.outputs.borrow_mut().push(output.clone());

        log::info!(
            "created source output {} \"{}\" on {} with sample spec \"{}\"",
            index,
            name,
            source.index(),
            spec
        );
        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::New,
            index,
        );

        Ok(output)
    }

    /// The output's index.
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
                SubscriptionFacility::SourceOutput,
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
    pub fn sample_spec(&self) -> &SampleSpec {
        &self.sample_spec
    }

    /// The client-side channel map.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceOutputState {
        self.state.get()
    }

    /// The source this output records from, while attached.
    pub fn source(&self) -> Option<Rc<Source>> {
        self.source.borrow().upgrade()
    }

    /// The owning client, if any.
    pub fn client(&self) -> Option<Rc<Client>> {
        self.client.borrow().clone()
    }

    /// Associates the output with a client.
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

    /// Installs the consumer callbacks.
    pub fn set_consumer(&self, consumer: Box<dyn SourceOutputConsumer>) {
        *self.consumer.borrow_mut() = Some(consumer);
    }

    /// The resample method in use, if a resampler is present.
    pub fn resample_method(&self) -> Option<ResampleMethod> {
        self.resampler.borrow().as_ref().map(|r| r.method())
    }

    /// Delivers one source-side chunk to the client, resampling first if
    /// needed. Discarded while corked.
    pub fn push(self: &Rc<Self>, chunk: &Memchunk) {
        if self.state.get() != SourceOutputState::Running {
            return;
        }

        let resampled = match &mut *self.resampler.borrow_mut() {
            None => None,
            Some(r) => match r.run(chunk) {
                Some(out) => Some(out),
                // The rate converter wants more input first.
                None => return,
            },
        };

        let cb = self.consumer.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb.push(self, resampled.as_ref().unwrap_or(chunk));
            if self.consumer.borrow().is_none() {
                *self.consumer.borrow_mut() = Some(cb);
            }
        }
    }

    /// Pauses or resumes delivery.
    pub fn cork(&self, corked: bool) {
        if self.state.get() == SourceOutputState::Disconnected {
            return;
        }

        self.state.set(if corked {
            SourceOutputState::Corked
        } else {
            SourceOutputState::Running
        });
    }

    /// Total capture latency: device side plus client side.
    pub fn latency(self: &Rc<Self>) -> Duration {
        let mut total = Duration::ZERO;

        if let Some(source) = self.source() {
            total += source.latency();
        }

        let cb = self.consumer.borrow_mut().take();
        if let Some(mut cb) = cb {
            if let Some(l) = cb.latency(self) {
                total += l;
            }
            if self.consumer.borrow().is_none() {
                *self.consumer.borrow_mut() = Some(cb);
            }
        }

        total
    }

    /// Asks the consumer to end the stream. The kill hook is expected to
    /// tear the output down, so the consumer is consumed, not restored.
    pub fn kill(self: &Rc<Self>) {
        let cb = self.consumer.borrow_mut().take();
        match cb {
            Some(mut cb) => cb.kill(self),
            None => self.disconnect(),
        }
    }

    /// Detaches from the source and the core.
    pub fn disconnect(self: &Rc<Self>) {
        if self.state.get() == SourceOutputState::Disconnected {
            return;
        }

        let Some(core) = self.core.upgrade() else {
            return;
        };

        core.source_outputs
            .borrow_mut()
            .remove_by(|o| Rc::ptr_eq(o, self));
        if let Some(source) = self.source() {
            source.outputs.borrow_mut().retain(|o| !Rc::ptr_eq(o, self));
        }
        *self.source.borrow_mut() = Weak::new();

        core.subscription_post(
            SubscriptionFacility::SourceOutput,
            SubscriptionOperation::Remove,
            self.index.get(),
        );

        self.consumer.borrow_mut().take();
        self.state.set(SourceOutputState::Disconnected);
        log::info!("freed source output {} \"{}\"", self.index.get(), self.name());
    }
}
