//! Connected clients.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::Core;
use crate::idxset::INVALID_INDEX;
use crate::module::Module;
use crate::subscribe::{SubscriptionFacility, SubscriptionOperation};

/// Hook invoked when the server wants a client gone; supplied by the
/// protocol module that owns the connection, and expected to end with
/// [`Client::disconnect`].
pub type ClientKillCallback = Box<dyn FnMut(&Rc<Client>)>;

/// One connected client, whatever protocol it arrived over.
pub struct Client {
    core: Weak<Core>,
    index: Cell<u32>,
    name: RefCell<String>,
    /// Which protocol stack the client came in through.
    protocol_name: Option<String>,
    owner: RefCell<Option<Weak<Module>>>,
    kill: RefCell<Option<ClientKillCallback>>,
}

impl Client {
    /// Registers a new client with the core.
    pub fn new(core: &Rc<Core>, name: &str, protocol_name: Option<&str>) -> Rc<Client> {
        let client = Rc::new(Client {
            core: core.weak_self.clone(),
            index: Cell::new(INVALID_INDEX),
            name: RefCell::new(name.to_owned()),
            protocol_name: protocol_name.map(str::to_owned),
            owner: Default::default(),
            kill: Default::default(),
        });

        let index = core.clients.borrow_mut().put(client.clone());
        client.index.set(index);

        log::info!("created client {} \"{}\"", index, name);
        core.subscription_post(
            SubscriptionFacility::Client,
            SubscriptionOperation::New,
            index,
        );
        core.check_quit();

        client
    }

    /// The client's index.
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    /// The client's display name.
    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// The protocol the client connected through, if recorded.
    pub fn protocol_name(&self) -> Option<&str> {
        self.protocol_name.as_deref()
    }

    /// Renames the client, posting a change event.
    pub fn set_name(&self, name: &str) {
        *self.name.borrow_mut() = name.to_owned();

        if let Some(core) = self.core.upgrade() {
            core.subscription_post(
                SubscriptionFacility::Client,
                SubscriptionOperation::Change,
                self.index.get(),
            );
        }
    }

    /// The module that owns the client's connection.
    pub fn owner(&self) -> Option<Rc<Module>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Records the owning module.
    pub fn set_owner(&self, module: Option<&Rc<Module>>) {
        *self.owner.borrow_mut() = module.map(Rc::downgrade);
    }

    /// Installs the kill hook.
    pub fn set_kill(&self, callback: ClientKillCallback) {
        *self.kill.borrow_mut() = Some(callback);
    }

    /// Asks the owning protocol to drop the client. The kill hook is
    /// expected to end with a disconnect, so it is consumed, not
    /// restored.
    pub fn kill(self: &Rc<Self>) {
        let cb = self.kill.borrow_mut().take();
        match cb {
            Some(mut cb) => cb(self),
            None => log::warn!("client {} has no kill hook", self.index.get()),
        }
    }

    /// Removes the client from the core. Called by the protocol when the
    /// connection goes away (or from the kill hook).
    pub fn disconnect(self: &Rc<Self>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        let removed = core
            .clients
            .borrow_mut()
            .remove_by(|c| Rc::ptr_eq(c, self));
        if removed.is_none() {
            return;
        }

        log::info!("freed client {} \"{}\"", self.index.get(), self.name());
        core.subscription_post(
            SubscriptionFacility::Client,
            SubscriptionOperation::Remove,
            self.index.get(),
        );

        self.kill.borrow_mut().take();
        core.check_quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use pretty_assertions::assert_eq;

    #[test]
    fn lifecycle_posts_events() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml.clone()));

        let events = Rc::new(RefCell::new(Vec::new()));
        let events2 = events.clone();
        let _sub = core.subscribe(
            crate::subscribe::SubscriptionMask::CLIENT,
            Box::new(move |_, ev| events2.borrow_mut().push(ev.operation)),
        );

        let client = Client::new(&core, "test", Some("native"));
        assert_eq!(core.clients.borrow().len(), 1);

        client.disconnect();
        assert_eq!(core.clients.borrow().len(), 0);

        ml.iterate(false).unwrap();
        assert_eq!(
            &*events.borrow(),
            &[SubscriptionOperation::New, SubscriptionOperation::Remove]
        );
    }

    #[test]
    fn kill_invokes_the_hook() {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml));

        let client = Client::new(&core, "doomed", None);
        let killed = Rc::new(Cell::new(false));

        let killed2 = killed.clone();
        client.set_kill(Box::new(move |c| {
            killed2.set(true);
            c.disconnect();
        }));

        client.kill();
        assert!(killed.get());
        assert_eq!(core.clients.borrow().len(), 0);
    }
}
