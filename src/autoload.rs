//! Name-triggered lazy module loading.
//!
//! An autoload entry says "when someone asks for a sink or source with
//! this name and it does not exist, load that module with these
//! arguments". The loaded module is marked for automatic idle unloading,
//! so rarely-used devices come and go on demand.

use std::cell::Cell;
use std::rc::Rc;

use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::namereg::NameregKind;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};

/// One autoload rule.
pub struct AutoloadEntry {
    index: Cell<u32>,
    name: String,
    kind: NameregKind,
    module: String,
    argument: Option<String>,
    /// Guards against a lookup performed *by* the loading module
    /// re-triggering the same load.
    in_action: Cell<bool>,
}

impl AutoloadEntry {
    /// The entry's index.
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    /// The entity name that triggers the load.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the rule is for a sink or a source name.
    pub fn kind(&self) -> NameregKind {
        self.kind
    }

    /// The module to load.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The argument string for the module.
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }
}

impl Core {
    /// Adds an autoload rule. Only sink and source names can trigger
    /// loads.
    pub fn autoload_add(
        &self,
        name: &str,
        kind: NameregKind,
        module: &str,
        argument: Option<&str>,
    ) -> Result<u32, Error> {
        if !matches!(kind, NameregKind::Sink | NameregKind::Source) {
            return Err(Error::Invalid("autoload entries cover sinks and sources".into()));
        }

        if self.autoload_get(name, kind).is_some() {
            return Err(Error::Exist(name.to_owned()));
        }

        let entry = Rc::new(AutoloadEntry {
            index: Cell::new(INVALID_INDEX),
            name: name.to_owned(),
            kind,
            module: module.to_owned(),
            argument: argument.map(str::to_owned),
            in_action: Cell::new(false),
        });

        let index = self.autoloads.borrow_mut().put(entry.clone());
        entry.index.set(index);

        self.subscription_post(
            SubscriptionFacility::Autoload,
            SubscriptionOperation::New,
            index,
        );

        Ok(index)
    }

    /// Removes the rule for `(name, kind)`.
    pub fn autoload_remove(&self, name: &str, kind: NameregKind) -> Result<(), Error> {
        let removed = self
            .autoloads
            .borrow_mut()
            .remove_by(|e| e.name == name && e.kind == kind);

        match removed {
            Some(e) => {
                self.subscription_post(
                    SubscriptionFacility::Autoload,
                    SubscriptionOperation::Remove,
                    e.index.get(),
                );
                Ok(())
            }
            None => Err(Error::NoEntity(name.to_owned())),
        }
    }

    /// The rule for `(name, kind)`, if any.
    pub fn autoload_get(&self, name: &str, kind: NameregKind) -> Option<Rc<AutoloadEntry>> {
        self.autoloads
            .borrow()
            .values()
            .find(|e| e.name == name && e.kind == kind)
            .cloned()
    }

    /// All rules, in insertion order.
    pub fn autoload_list(&self) -> Vec<Rc<AutoloadEntry>> {
        self.autoloads.borrow().values().cloned().collect()
    }

    /// Consults the table for a failed lookup of `(name, kind)` and loads
    /// the named module. Reentrant requests for the same name while the
    /// load is in flight do nothing.
    pub(crate) fn autoload_request(self: &Rc<Self>, name: &str, kind: NameregKind) {
        let Some(entry) = self.autoload_get(name, kind) else {
            return;
        };

        if entry.in_action.replace(true) {
            return;
        }

        log::debug!(
            "autoloading module \"{}\" for {:?} \"{}\"",
            entry.module,
            kind,
            name
        );
        match self.load_module(&entry.module, entry.argument()) {
            Ok(m) => m.set_auto_unload(true),
            Err(e) => log::warn!("autoload of \"{}\" failed: {e}", entry.module),
        }

        entry.in_action.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn core() -> Rc<Core> {
        let ml = Mainloop::new().unwrap();
        Core::new(Rc::new(ml))
    }

    #[test]
    fn add_get_remove() {
        let core = core();

        let idx = core
            .autoload_add("dev", NameregKind::Sink, "null-sink", Some("sink_name=dev"))
            .unwrap();

        let entry = core.autoload_get("dev", NameregKind::Sink).unwrap();
        assert_eq!(entry.index(), idx);
        assert_eq!(entry.module(), "null-sink");

        // Same name, other kind, is a different slot.
        assert!(core.autoload_get("dev", NameregKind::Source).is_none());

        assert_matches!(
            core.autoload_add("dev", NameregKind::Sink, "other", None),
            Err(Error::Exist(_))
        );

        core.autoload_remove("dev", NameregKind::Sink).unwrap();
        assert!(core.autoload_get("dev", NameregKind::Sink).is_none());
        assert_matches!(
            core.autoload_remove("dev", NameregKind::Sink),
            Err(Error::NoEntity(_))
        );
    }

    #[test]
    fn reentrant_request_does_not_double_load() {
        let core = core();
        let loads = Rc::new(Cell::new(0u32));

        let loads2 = loads.clone();
        let weak = Rc::downgrade(&core);
        core.register_module_factory(
            "reentrant",
            Default::default(),
            Box::new(move |_, _| {
                loads2.set(loads2.get() + 1);
                // A lookup from inside init must not recurse into the
                // same autoload.
                if let Some(core) = weak.upgrade() {
                    core.autoload_request("loop", NameregKind::Sink);
                }

                struct Noop;
                impl crate::module::ModuleImpl for Noop {
                    fn teardown(&mut self, _: &Rc<Core>, _: &Rc<crate::module::Module>) {}
                }
                Ok(Box::new(Noop))
            }),
        );

        core.autoload_add("loop", NameregKind::Sink, "reentrant", None)
            .unwrap();
        core.autoload_request("loop", NameregKind::Sink);
        assert_eq!(loads.get(), 1);
    }
}
