//! The core instance: owner of every registry, set, and counter in the
//! server.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::autoload::AutoloadEntry;
use crate::client::Client;
use crate::idxset::IdxSet;
use crate::mainloop::{EventLoop, TimeEvent};
use crate::memblock::MemblockStat;
use crate::module::{Module, ModuleFactory};
use crate::namereg::Namereg;
use crate::resampler::ResampleMethod;
use crate::sample::SampleSpec;
use crate::scache::{ScacheEntry, SoundFileLoader};
use crate::sink::Sink;
use crate::sink_input::SinkInput;
use crate::source::Source;
use crate::source_output::SourceOutput;
use crate::subscribe::SubscriptionState;

/// The heart of the server: one instance owns all entities, the name
/// registry, the subscription bus, and the configuration knobs.
///
/// Everything is accessed through `Rc<Core>` from inside event loop
/// callbacks; there is no locking anywhere.
pub struct Core {
    pub(crate) weak_self: Weak<Core>,
    mainloop: Rc<dyn EventLoop>,

    pub(crate) clients: RefCell<IdxSet<Rc<Client>>>,
    pub(crate) sinks: RefCell<IdxSet<Rc<Sink>>>,
    pub(crate) sources: RefCell<IdxSet<Rc<Source>>>,
    pub(crate) sink_inputs: RefCell<IdxSet<Rc<SinkInput>>>,
    pub(crate) source_outputs: RefCell<IdxSet<Rc<SourceOutput>>>,
    pub(crate) modules: RefCell<IdxSet<Rc<Module>>>,
    pub(crate) scache: RefCell<IdxSet<Rc<ScacheEntry>>>,
    pub(crate) autoloads: RefCell<IdxSet<Rc<AutoloadEntry>>>,

    pub(crate) namereg: Namereg,
    pub(crate) subscriptions: SubscriptionState,

    memblock_stat: MemblockStat,

    /// The spec used when a client does not negotiate one.
    pub(crate) default_sample_spec: Cell<SampleSpec>,
    /// The method used for client streams that need rate conversion.
    pub(crate) resample_method: Cell<ResampleMethod>,
    /// Quit the loop this long after the last client disconnects; `None`
    /// disables the idle exit.
    pub(crate) exit_idle_time: Cell<Option<Duration>>,
    /// Unload auto-loaded modules idle for this long.
    pub(crate) module_idle_time: Cell<Duration>,
    /// Evict lazily loaded sample data idle for this long.
    pub(crate) scache_idle_time: Cell<Duration>,
    /// Refuse module loads and unloads (set during shutdown).
    pub(crate) disallow_module_loading: Cell<bool>,

    quit_event: RefCell<Option<Rc<TimeEvent>>>,
    pub(crate) module_auto_unload_event: RefCell<Option<Rc<TimeEvent>>>,
    pub(crate) module_defer_unload_event: RefCell<Option<Rc<crate::mainloop::DeferEvent>>>,
    pub(crate) scache_auto_unload_event: RefCell<Option<Rc<TimeEvent>>>,

    pub(crate) module_factories: RefCell<HashMap<String, Rc<ModuleFactory>>>,
    pub(crate) sound_loader: RefCell<Option<Box<dyn SoundFileLoader>>>,
}

impl Core {
    /// Creates a core driven by the given event loop.
    pub fn new(mainloop: Rc<dyn EventLoop>) -> Rc<Core> {
        Rc::new_cyclic(|weak_self| Core {
            weak_self: weak_self.clone(),
            mainloop,

            clients: Default::default(),
            sinks: Default::default(),
            sources: Default::default(),
            sink_inputs: Default::default(),
            source_outputs: Default::default(),
            modules: Default::default(),
            scache: Default::default(),
            autoloads: Default::default(),

            namereg: Namereg::new(),
            subscriptions: SubscriptionState::new(),

            memblock_stat: MemblockStat::new(),

            default_sample_spec: Cell::new(SampleSpec::default()),
            resample_method: Cell::new(ResampleMethod::FastestSinc),
            exit_idle_time: Cell::new(None),
            module_idle_time: Cell::new(Duration::from_secs(20)),
            scache_idle_time: Cell::new(Duration::from_secs(20)),
            disallow_module_loading: Cell::new(false),

            quit_event: Default::default(),
            module_auto_unload_event: Default::default(),
            module_defer_unload_event: Default::default(),
            scache_auto_unload_event: Default::default(),

            module_factories: Default::default(),
            sound_loader: Default::default(),
        })
    }

    /// The event loop driving this core.
    pub fn mainloop(&self) -> &Rc<dyn EventLoop> {
        &self.mainloop
    }

    /// The memory accounting shared by every block this core allocates.
    pub fn memblock_stat(&self) -> &MemblockStat {
        &self.memblock_stat
    }

    /// The default sample spec for new streams.
    pub fn default_sample_spec(&self) -> SampleSpec {
        self.default_sample_spec.get()
    }

    /// Sets the default sample spec for new streams.
    pub fn set_default_sample_spec(&self, spec: SampleSpec) {
        self.default_sample_spec.set(spec);
    }

    /// The resample method used for client streams.
    pub fn resample_method(&self) -> ResampleMethod {
        self.resample_method.get()
    }

    /// Sets the resample method used for client streams.
    pub fn set_resample_method(&self, method: ResampleMethod) {
        self.resample_method.set(method);
    }

    /// Configures (or disables) the idle exit: with a duration set, the
    /// loop quits after that long with no clients connected.
    pub fn set_exit_idle_time(&self, time: Option<Duration>) {
        self.exit_idle_time.set(time);
        self.check_quit();
    }

    /// Configures how long unused auto-loaded modules stay loaded.
    pub fn set_module_idle_time(&self, time: Duration) {
        self.module_idle_time.set(time);
    }

    /// Configures how long idle lazy sample data stays in memory.
    pub fn set_scache_idle_time(&self, time: Duration) {
        self.scache_idle_time.set(time);
    }

    /// Installs the loader used to read sample files from disk.
    pub fn set_sound_loader(&self, loader: Box<dyn SoundFileLoader>) {
        *self.sound_loader.borrow_mut() = Some(loader);
    }

    /// All sinks, in creation order.
    pub fn list_sinks(&self) -> Vec<Rc<Sink>> {
        self.sinks.borrow().values().cloned().collect()
    }

    /// All sources, in creation order.
    pub fn list_sources(&self) -> Vec<Rc<Source>> {
        self.sources.borrow().values().cloned().collect()
    }

    /// All sink-inputs, in creation order.
    pub fn list_sink_inputs(&self) -> Vec<Rc<SinkInput>> {
        self.sink_inputs.borrow().values().cloned().collect()
    }

    /// All source-outputs, in creation order.
    pub fn list_source_outputs(&self) -> Vec<Rc<SourceOutput>> {
        self.source_outputs.borrow().values().cloned().collect()
    }

    /// All clients, in creation order.
    pub fn list_clients(&self) -> Vec<Rc<Client>> {
        self.clients.borrow().values().cloned().collect()
    }

    /// The sink at `index`.
    pub fn sink_by_index(&self, index: u32) -> Option<Rc<Sink>> {
        self.sinks.borrow().get(index).cloned()
    }

    /// The source at `index`.
    pub fn source_by_index(&self, index: u32) -> Option<Rc<Source>> {
        self.sources.borrow().get(index).cloned()
    }

    /// The sink-input at `index`.
    pub fn sink_input_by_index(&self, index: u32) -> Option<Rc<SinkInput>> {
        self.sink_inputs.borrow().get(index).cloned()
    }

    /// The source-output at `index`.
    pub fn source_output_by_index(&self, index: u32) -> Option<Rc<SourceOutput>> {
        self.source_outputs.borrow().get(index).cloned()
    }

    /// The client at `index`.
    pub fn client_by_index(&self, index: u32) -> Option<Rc<Client>> {
        self.clients.borrow().get(index).cloned()
    }

    /// Arms or cancels the idle-exit timer depending on whether any
    /// clients are connected. Called on every client arrival and
    /// departure.
    pub(crate) fn check_quit(&self) {
        let has_clients = !self.clients.borrow().is_empty();
        let pending = self.quit_event.borrow().is_some();

        if !pending && !has_clients {
            if let Some(idle) = self.exit_idle_time.get() {
                log::info!("last client gone, exiting in {}s", idle.as_secs());
                let mainloop = self.mainloop.clone();
                let e = self.mainloop.time_new(
                    Instant::now() + idle,
                    Box::new(move |_, _| {
                        mainloop.quit(0);
                    }),
                );
                *self.quit_event.borrow_mut() = Some(e);
            }
        } else if pending && has_clients {
            if let Some(e) = self.quit_event.borrow_mut().take() {
                e.free();
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Some(e) = self.quit_event.borrow_mut().take() {
            e.free();
        }
        if let Some(e) = self.module_auto_unload_event.borrow_mut().take() {
            e.free();
        }
        if let Some(e) = self.module_defer_unload_event.borrow_mut().take() {
            e.free();
        }
        if let Some(e) = self.scache_auto_unload_event.borrow_mut().take() {
            e.free();
        }
    }
}
