//! The registry mapping `(kind, name)` pairs to entities, and the default
//! sink/source selection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::core::Core;
use crate::error::Error;
use crate::idxset::INVALID_INDEX;
use crate::scache::ScacheEntry;
use crate::sink::Sink;
use crate::source::Source;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};

/// The namespaces of the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NameregKind {
    Sink,
    Source,
    Sample,
}

/// A weak handle to a registered entity. The registry never keeps
/// anything alive; a dead handle is treated as a miss.
pub(crate) enum NameregValue {
    Sink(Weak<Sink>),
    Source(Weak<Source>),
    Sample(Weak<ScacheEntry>),
}

/// Registry state owned by the core.
pub(crate) struct Namereg {
    entries: RefCell<HashMap<(NameregKind, String), NameregValue>>,
    default_sink: RefCell<Option<String>>,
    default_source: RefCell<Option<String>>,
}

impl Namereg {
    pub(crate) fn new() -> Namereg {
        Namereg {
            entries: Default::default(),
            default_sink: Default::default(),
            default_source: Default::default(),
        }
    }
}

impl Core {
    /// Registers `value` under `name` in the given namespace.
    ///
    /// On a collision, fails when `strict`; otherwise the first free of
    /// `name1` through `name99` is used. Returns the name actually
    /// chosen, which the caller must keep for unregistration.
    pub(crate) fn namereg_register(
        &self,
        name: &str,
        kind: NameregKind,
        value: NameregValue,
        strict: bool,
    ) -> Result<String, Error> {
        if name.is_empty() {
            return Err(Error::Invalid("empty name".into()));
        }

        let mut entries = self.namereg.entries.borrow_mut();

        let chosen = if !entries.contains_key(&(kind, name.to_owned())) {
            name.to_owned()
        } else if strict {
            return Err(Error::Exist(name.to_owned()));
        } else {
            let mut chosen = None;
            for i in 1..=99u32 {
                let candidate = format!("{name}{i}");
                if !entries.contains_key(&(kind, candidate.clone())) {
                    chosen = Some(candidate);
                    break;
                }
            }

            chosen.ok_or_else(|| Error::Exist(name.to_owned()))?
        };

        entries.insert((kind, chosen.clone()), value);
        Ok(chosen)
    }

    /// Removes a registration.
    pub(crate) fn namereg_unregister(&self, kind: NameregKind, name: &str) {
        let removed = self
            .namereg
            .entries
            .borrow_mut()
            .remove(&(kind, name.to_owned()));
        if removed.is_none() {
            log::warn!("unregistering unknown name \"{name}\"");
        }
    }

    fn namereg_get(&self, kind: NameregKind, name: &str) -> Option<NameregValue> {
        let entries = self.namereg.entries.borrow();
        let value = entries.get(&(kind, name.to_owned()))?;

        // Clone the weak handle out so the borrow ends before upgrade.
        Some(match value {
            NameregValue::Sink(w) => NameregValue::Sink(w.clone()),
            NameregValue::Source(w) => NameregValue::Source(w.clone()),
            NameregValue::Sample(w) => NameregValue::Sample(w.clone()),
        })
    }

    /// Resolves a sink by name or decimal index, `None` meaning the
    /// default sink. With `autoload` set, a miss consults the autoload
    /// table, loads the module it names, and retries once.
    pub fn lookup_sink(self: &Rc<Self>, name: Option<&str>, autoload: bool) -> Option<Rc<Sink>> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => self.default_sink_name()?,
        };

        if let Some(NameregValue::Sink(w)) = self.namereg_get(NameregKind::Sink, &name) {
            if let Some(sink) = w.upgrade() {
                return Some(sink);
            }
        }

        if let Ok(index) = name.parse::<u32>() {
            if index != INVALID_INDEX {
                return self.sinks.borrow().get(index).cloned();
            }
        }

        if autoload {
            self.autoload_request(&name, NameregKind::Sink);
            if let Some(NameregValue::Sink(w)) = self.namereg_get(NameregKind::Sink, &name) {
                return w.upgrade();
            }
        }

        None
    }

    /// Resolves a source by name or decimal index, `None` meaning the
    /// default source.
    pub fn lookup_source(self: &Rc<Self>, name: Option<&str>, autoload: bool) -> Option<Rc<Source>> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => self.default_source_name()?,
        };

        if let Some(NameregValue::Source(w)) = self.namereg_get(NameregKind::Source, &name) {
            if let Some(source) = w.upgrade() {
                return Some(source);
            }
        }

        if let Ok(index) = name.parse::<u32>() {
            if index != INVALID_INDEX {
                return self.sources.borrow().get(index).cloned();
            }
        }

        if autoload {
            self.autoload_request(&name, NameregKind::Source);
            if let Some(NameregValue::Source(w)) = self.namereg_get(NameregKind::Source, &name) {
                return w.upgrade();
            }
        }

        None
    }

    /// Resolves a sample-cache entry by name or decimal index.
    pub fn lookup_sample(&self, name: &str) -> Option<Rc<ScacheEntry>> {
        if let Some(NameregValue::Sample(w)) = self.namereg_get(NameregKind::Sample, name) {
            if let Some(entry) = w.upgrade() {
                return Some(entry);
            }
        }

        if let Ok(index) = name.parse::<u32>() {
            if index != INVALID_INDEX {
                return self.scache.borrow().get(index).cloned();
            }
        }

        None
    }

    /// Sets (or clears) the default sink name. Posts a server change
    /// event when the value actually changes.
    pub fn set_default_sink_name(&self, name: Option<&str>) {
        let mut current = self.namereg.default_sink.borrow_mut();
        if current.as_deref() == name {
            return;
        }

        *current = name.map(str::to_owned);
        drop(current);

        self.subscription_post(
            SubscriptionFacility::Server,
            SubscriptionOperation::Change,
            INVALID_INDEX,
        );
    }

    /// Sets (or clears) the default source name.
    pub fn set_default_source_name(&self, name: Option<&str>) {
        let mut current = self.namereg.default_source.borrow_mut();
        if current.as_deref() == name {
            return;
        }

        *current = name.map(str::to_owned);
        drop(current);

        self.subscription_post(
            SubscriptionFacility::Server,
            SubscriptionOperation::Change,
            INVALID_INDEX,
        );
    }

    /// The configured default sink name, falling back to the first sink
    /// registered (which then becomes the configured default).
    pub fn default_sink_name(&self) -> Option<String> {
        if let Some(name) = self.namereg.default_sink.borrow().clone() {
            return Some(name);
        }

        let first = self.sinks.borrow().first().map(|s| s.name());
        if let Some(name) = first {
            self.set_default_sink_name(Some(&name));
        }

        self.namereg.default_sink.borrow().clone()
    }

    /// The configured default source name, falling back to the first
    /// non-monitor source, then to the first source of any kind.
    pub fn default_source_name(&self) -> Option<String> {
        if let Some(name) = self.namereg.default_source.borrow().clone() {
            return Some(name);
        }

        let preferred = {
            let sources = self.sources.borrow();
            let result = sources
                .values()
                .find(|s| !s.is_monitor())
                .or_else(|| sources.first())
                .map(|s| s.name());
            result
        };
        if let Some(name) = preferred {
            self.set_default_source_name(Some(&name));
        }

        self.namereg.default_source.borrow().clone()
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
    fn strict_collision_fails_and_loose_collision_renames() {
        let core = core();

        let sink: Weak<Sink> = Weak::new();
        let n1 = core
            .namereg_register("output", NameregKind::Sink, NameregValue::Sink(sink.clone()), true)
            .unwrap();
        assert_eq!(n1, "output");

        assert_matches!(
            core.namereg_register("output", NameregKind::Sink, NameregValue::Sink(sink.clone()), true),
            Err(Error::Exist(_))
        );

        let n2 = core
            .namereg_register("output", NameregKind::Sink, NameregValue::Sink(sink.clone()), false)
            .unwrap();
        assert_eq!(n2, "output1");

        let n3 = core
            .namereg_register("output", NameregKind::Sink, NameregValue::Sink(sink), false)
            .unwrap();
        assert_eq!(n3, "output2");
    }

    #[test]
    fn kinds_are_separate_namespaces() {
        let core = core();

        core.namereg_register("x", NameregKind::Sink, NameregValue::Sink(Weak::new()), true)
            .unwrap();
        // Registering the same name as a source must not collide.
        let n = core
            .namereg_register("x", NameregKind::Source, NameregValue::Source(Weak::new()), true)
            .unwrap();
        assert_eq!(n, "x");

        // And a sink lookup of a name registered only as a source misses.
        core.namereg_unregister(NameregKind::Sink, "x");
        assert!(core.lookup_sink(Some("x"), false).is_none());
    }

    #[test]
    fn unregister_frees_the_name() {
        let core = core();

        core.namereg_register("y", NameregKind::Sample, NameregValue::Sample(Weak::new()), true)
            .unwrap();
        core.namereg_unregister(NameregKind::Sample, "y");
        let n = core
            .namereg_register("y", NameregKind::Sample, NameregValue::Sample(Weak::new()), true)
            .unwrap();
        assert_eq!(n, "y");
    }
}
