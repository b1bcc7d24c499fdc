//! Module lifecycle: loading, use counts, and the idle/requested unload
//! sweeps.
//!
//! Modules are the units that own hardware, protocol listeners, and other
//! externally-driven entities. Instead of dynamic objects, modules here
//! are factories registered on the core by name; loading one runs its
//! factory, which builds the module's entities and returns the
//! [`ModuleImpl`] that will tear them down again.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};

/// How often the core scans for idle auto-loaded modules.
pub(crate) const UNLOAD_POLL_TIME: Duration = Duration::from_secs(2);

/// Descriptive metadata a module factory registers alongside itself.
#[derive(Debug, Clone, Default)]
pub struct ModuleMeta {
    /// Who wrote the module.
    pub author: Option<String>,
    /// One-line description.
    pub description: Option<String>,
    /// Argument syntax help.
    pub usage: Option<String>,
    /// Module version string.
    pub version: Option<String>,
}

/// The loaded half of a module: knows how to undo everything `init` did.
pub trait ModuleImpl {
    /// Disconnects every entity the module owns. Runs exactly once, when
    /// the module is unloaded.
    fn teardown(&mut self, core: &Rc<Core>, module: &Rc<Module>);
}

/// Builds a module instance. Registers the module's entities before
/// returning, per the module contract.
pub type ModuleInit = Box<dyn Fn(&Rc<Core>, &Rc<Module>) -> Result<Box<dyn ModuleImpl>, Error>>;

pub(crate) struct ModuleFactory {
    pub(crate) meta: Rc<ModuleMeta>,
    pub(crate) init: ModuleInit,
}

/// A loaded module.
pub struct Module {
    core: Weak<Core>,
    index: Cell<u32>,
    name: String,
    argument: Option<String>,
    meta: Rc<ModuleMeta>,
    /// How many entities currently depend on the module; `None` means the
    /// module does not track use.
    used: Cell<Option<u32>>,
    auto_unload: Cell<bool>,
    unload_requested: Cell<bool>,
    last_used: Cell<Option<Instant>>,
    imp: RefCell<Option<Box<dyn ModuleImpl>>>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("index", &self.index.get())
            .field("name", &self.name)
            .field("argument", &self.argument)
            .finish()
    }
}

impl Module {
    /// The module's index.
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    /// The factory name the module was loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The argument string the module was loaded with.
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    /// The registered metadata.
    pub fn meta(&self) -> &ModuleMeta {
        &self.meta
    }

    /// The use count, if the module tracks one.
    pub fn used(&self) -> Option<u32> {
        self.used.get()
    }

    /// Whether the module is unloaded automatically when idle.
    pub fn auto_unload(&self) -> bool {
        self.auto_unload.get()
    }

    /// Marks the module for automatic idle unloading.
    pub fn set_auto_unload(&self, auto_unload: bool) {
        self.auto_unload.set(auto_unload);
    }

    /// Updates the use count, posting a change event and starting the
    /// idle clock when it drops to zero.
    pub fn set_used(&self, used: Option<u32>) {
        if self.used.get() == used {
            return;
        }

        if used == Some(0) {
            self.last_used.set(Some(Instant::now()));
        }
        self.used.set(used);

        if let Some(core) = self.core.upgrade() {
            core.subscription_post(
                SubscriptionFacility::Module,
                SubscriptionOperation::Change,
                self.index.get(),
            );
        }
    }

    /// Requests asynchronous unloading: the module is torn down by a
    /// deferred sweep on a later loop turn, never inside this call. Safe
    /// to call from the module's own callbacks.
    pub fn unload_request(&self) {
        self.unload_requested.set(true);

        let Some(core) = self.core.upgrade() else {
            return;
        };

        let mut defer = core.module_defer_unload_event.borrow_mut();
        match &*defer {
            Some(e) => e.enable(true),
            None => {
                let weak = core.weak_self.clone();
                let e = core.mainloop().defer_new(Box::new(move |e| {
                    e.enable(false);
                    if let Some(core) = weak.upgrade() {
                        core.module_unload_requested();
                    }
                }));
                *defer = Some(e);
            }
        }
    }
}

impl Core {
    /// Registers a module factory under `name`.
    pub fn register_module_factory(&self, name: &str, meta: ModuleMeta, init: ModuleInit) {
        self.module_factories.borrow_mut().insert(
            name.to_owned(),
            Rc::new(ModuleFactory {
                meta: Rc::new(meta),
                init,
            }),
        );
    }

    /// Loads the module registered under `name`, running its factory.
    pub fn load_module(
        self: &Rc<Self>,
        name: &str,
        argument: Option<&str>,
    ) -> Result<Rc<Module>, Error> {
        if self.disallow_module_loading.get() {
            return Err(Error::AccessDenied);
        }

        // Clone the factory handle out so init can load further modules.
        let factory = self.module_factories.borrow().get(name).cloned();
        let factory = factory.ok_or_else(|| {
            log::warn!("failed to open module \"{name}\": no such factory");
            Error::ModInitFailed(format!("no such module: {name}"))
        })?;

        let module = Rc::new(Module {
            core: self.weak_self.clone(),
            index: Cell::new(INVALID_INDEX),
            name: name.to_owned(),
            argument: argument.map(str::to_owned),
            meta: factory.meta.clone(),
            used: Cell::new(None),
            auto_unload: Cell::new(false),
            unload_requested: Cell::new(false),
            last_used: Cell::new(None),
            imp: Default::default(),
        });

        let imp = (factory.init)(self, &module).map_err(|e| {
            log::warn!(
                "failed to load module \"{name}\" (argument: \"{}\"): initialization failed: {e}",
                argument.unwrap_or("")
            );
            Error::ModInitFailed(e.to_string())
        })?;
        *module.imp.borrow_mut() = Some(imp);

        let index = self.modules.borrow_mut().put(module.clone());
        module.index.set(index);

        self.ensure_module_unload_timer();

        log::info!(
            "loaded \"{}\" (index: #{}; argument: \"{}\")",
            name,
            index,
            argument.unwrap_or("")
        );
        self.subscription_post(
            SubscriptionFacility::Module,
            SubscriptionOperation::New,
            index,
        );

        Ok(module)
    }

    /// Unloads a module, tearing down everything it owns.
    pub fn unload_module(self: &Rc<Self>, module: &Rc<Module>) {
        let removed = self
            .modules
            .borrow_mut()
            .remove_by(|m| Rc::ptr_eq(m, module));
        if removed.is_none() {
            return;
        }

        self.module_free(module);
    }

    /// Unloads a module by index.
    pub fn unload_module_by_index(self: &Rc<Self>, index: u32) -> Result<(), Error> {
        let removed = self.modules.borrow_mut().remove(index);
        match removed {
            Some(m) => {
                self.module_free(&m);
                Ok(())
            }
            None => Err(Error::NoEntity(format!("module #{index}"))),
        }
    }

    /// Unloads every module. Part of orderly shutdown.
    pub fn unload_all_modules(self: &Rc<Self>) {
        loop {
            let next = self.modules.borrow().first().cloned();
            match next {
                Some(m) => self.unload_module(&m),
                None => break,
            }
        }

        if let Some(e) = self.module_auto_unload_event.borrow_mut().take() {
            e.free();
        }
        if let Some(e) = self.module_defer_unload_event.borrow_mut().take() {
            e.free();
        }
    }

    /// The module at `index`.
    pub fn module_by_index(&self, index: u32) -> Option<Rc<Module>> {
        self.modules.borrow().get(index).cloned()
    }

    fn module_free(self: &Rc<Self>, module: &Rc<Module>) {
        log::info!("unloading \"{}\" (index: #{})", module.name, module.index());

        let imp = module.imp.borrow_mut().take();
        if let Some(mut imp) = imp {
            imp.teardown(self, module);
        }

        log::info!("unloaded \"{}\" (index: #{})", module.name, module.index());
        self.subscription_post(
            SubscriptionFacility::Module,
            SubscriptionOperation::Remove,
            module.index(),
        );
    }

    /// Frees modules that requested their own unload.
    fn module_unload_requested(self: &Rc<Self>) {
        loop {
            let next = self
                .modules
                .borrow()
                .values()
                .find(|m| m.unload_requested.get())
                .cloned();
            match next {
                Some(m) => self.unload_module(&m),
                None => break,
            }
        }
    }

    /// Frees auto-unload modules that have been unused for longer than
    /// the configured idle time. Runs periodically; callable directly to
    /// force a sweep.
    pub fn module_unload_unused(self: &Rc<Self>) {
        let now = Instant::now();
        let idle_time = self.module_idle_time.get();

        loop {
            let next = self
                .modules
                .borrow()
                .values()
                .find(|m| {
                    m.used.get() == Some(0)
                        && m.auto_unload.get()
                        && m.last_used
                            .get()
                            .is_some_and(|t| t + idle_time <= now)
                })
                .cloned();
            match next {
                Some(m) => self.unload_module(&m),
                None => break,
            }
        }
    }

    fn ensure_module_unload_timer(self: &Rc<Self>) {
        let mut slot = self.module_auto_unload_event.borrow_mut();
        if slot.is_some() {
            return;
        }

        let weak = self.weak_self.clone();
        let e = self.mainloop().time_new(
            Instant::now() + UNLOAD_POLL_TIME,
            Box::new(move |e, _| {
                if let Some(core) = weak.upgrade() {
                    core.module_unload_unused();
                    e.restart(Instant::now() + UNLOAD_POLL_TIME);
                }
            }),
        );
        *slot = Some(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    struct Noop;
    impl ModuleImpl for Noop {
        fn teardown(&mut self, _core: &Rc<Core>, _module: &Rc<Module>) {}
    }

    fn register_noop(core: &Rc<Core>, torn_down: Rc<Cell<u32>>) {
        core.register_module_factory(
            "noop",
            ModuleMeta {
                description: Some("does nothing".into()),
                ..Default::default()
            },
            Box::new(move |_, _| {
                struct Counted(Rc<Cell<u32>>);
                impl ModuleImpl for Counted {
                    fn teardown(&mut self, _: &Rc<Core>, _: &Rc<Module>) {
                        self.0.set(self.0.get() + 1);
                    }
                }
                Ok(Box::new(Counted(torn_down.clone())))
            }),
        );
    }

    #[test]
    fn load_and_unload() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        let torn_down = Rc::new(Cell::new(0));
        register_noop(&core, torn_down.clone());

        let m = core.load_module("noop", Some("a=b")).unwrap();
        assert_eq!(m.name(), "noop");
        assert_eq!(m.argument(), Some("a=b"));
        assert_eq!(core.modules.borrow().len(), 1);

        core.unload_module(&m);
        assert_eq!(core.modules.borrow().len(), 0);
        assert_eq!(torn_down.get(), 1);

        // A second unload of the same handle does nothing.
        core.unload_module(&m);
        assert_eq!(torn_down.get(), 1);
    }

    #[test]
    fn unknown_module_fails_to_load() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        assert_matches!(
            core.load_module("missing", None),
            Err(Error::ModInitFailed(_))
        );
    }

    #[test]
    fn failing_factory_reports_init_failure() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        core.register_module_factory(
            "broken",
            Default::default(),
            Box::new(|_, _| Err(Error::Invalid("bad argument".into()))),
        );

        assert_matches!(
            core.load_module("broken", None),
            Err(Error::ModInitFailed(_))
        );
        assert_eq!(core.modules.borrow().len(), 0);
    }

    #[test]
    fn unload_request_sweeps_on_a_later_turn() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml.clone()));
        let torn_down = Rc::new(Cell::new(0));
        register_noop(&core, torn_down.clone());

        let m = core.load_module("noop", None).unwrap();
        m.unload_request();
        assert_eq!(torn_down.get(), 0, "not torn down inline");

        ml.iterate(false).unwrap();
        assert_eq!(torn_down.get(), 1);
        assert_eq!(core.modules.borrow().len(), 0);
    }

    #[test]
    fn idle_modules_are_swept() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));
        let torn_down = Rc::new(Cell::new(0));
        register_noop(&core, torn_down.clone());

        core.set_module_idle_time(Duration::ZERO);
        let m = core.load_module("noop", None).unwrap();
        m.set_auto_unload(true);
        m.set_used(Some(0));

        core.module_unload_unused();
        assert_eq!(torn_down.get(), 1);
    }
}
