//! The publish/subscribe bus that informs clients of state changes.
//!
//! Every mutation in the server (entity created, removed, volume changed)
//! posts an event here. Delivery is *never* inline: events queue up and a
//! deferred event drains them on a later loop turn, so a post from deep
//! inside a render path cannot reenter the entity being described.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;

use crate::core::Core;
use crate::mainloop::DeferEvent;

bitflags! {
    /// Selects which entity kinds a subscriber wants events for.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct SubscriptionMask: u32 {
        const SINK = 0x0001;
        const SOURCE = 0x0002;
        const SINK_INPUT = 0x0004;
        const SOURCE_OUTPUT = 0x0008;
        const MODULE = 0x0010;
        const CLIENT = 0x0020;
        const SAMPLE_CACHE = 0x0040;
        const SERVER = 0x0080;
        const AUTOLOAD = 0x0100;
    }
}

/// The entity kind an event describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionFacility {
    Sink,
    Source,
    SinkInput,
    SourceOutput,
    Module,
    Client,
    SampleCache,
    Server,
    Autoload,
}

impl SubscriptionFacility {
    /// The mask bit selecting this facility.
    pub fn mask(self) -> SubscriptionMask {
        match self {
            SubscriptionFacility::Sink => SubscriptionMask::SINK,
            SubscriptionFacility::Source => SubscriptionMask::SOURCE,
            SubscriptionFacility::SinkInput => SubscriptionMask::SINK_INPUT,
            SubscriptionFacility::SourceOutput => SubscriptionMask::SOURCE_OUTPUT,
            SubscriptionFacility::Module => SubscriptionMask::MODULE,
            SubscriptionFacility::Client => SubscriptionMask::CLIENT,
            SubscriptionFacility::SampleCache => SubscriptionMask::SAMPLE_CACHE,
            SubscriptionFacility::Server => SubscriptionMask::SERVER,
            SubscriptionFacility::Autoload => SubscriptionMask::AUTOLOAD,
        }
    }
}

/// What happened to the entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionOperation {
    /// The entity appeared.
    New,
    /// The entity changed.
    Change,
    /// The entity went away.
    Remove,
}

/// One change notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    /// The kind of entity described.
    pub facility: SubscriptionFacility,
    /// What happened to it.
    pub operation: SubscriptionOperation,
    /// The entity's index ([`crate::idxset::INVALID_INDEX`] for
    /// server-wide events).
    pub index: u32,
}

/// Callback invoked for each delivered event.
pub type SubscriptionCallback = Box<dyn FnMut(&Rc<Core>, SubscriptionEvent)>;

/// One registered subscriber.
pub struct Subscription {
    mask: SubscriptionMask,
    dead: Cell<bool>,
    callback: RefCell<Option<SubscriptionCallback>>,
}

impl Subscription {
    /// Cancels the subscription. No further events are delivered after
    /// this returns, including later events of a drain in progress.
    pub fn free(&self) {
        self.dead.set(true);
        self.callback.borrow_mut().take();
    }
}

/// The core-owned half of the bus.
pub(crate) struct SubscriptionState {
    subscribers: RefCell<Vec<Rc<Subscription>>>,
    queue: RefCell<VecDeque<SubscriptionEvent>>,
    defer: RefCell<Option<Rc<DeferEvent>>>,
}

impl SubscriptionState {
    pub(crate) fn new() -> Self {
        SubscriptionState {
            subscribers: Default::default(),
            queue: Default::default(),
            defer: Default::default(),
        }
    }
}

impl Core {
    /// Registers a subscriber for all events matching `mask`.
    pub fn subscribe(&self, mask: SubscriptionMask, callback: SubscriptionCallback) -> Rc<Subscription> {
        let s = Rc::new(Subscription {
            mask,
            dead: Cell::new(false),
            callback: RefCell::new(Some(callback)),
        });

        self.subscriptions.subscribers.borrow_mut().push(s.clone());
        s
    }

    /// Queues a change notification for deferred delivery.
    ///
    /// Safe to call from anywhere, including render paths: subscribers run
    /// on a later loop turn, never from inside this call.
    pub fn subscription_post(
        &self,
        facility: SubscriptionFacility,
        operation: SubscriptionOperation,
        index: u32,
    ) {
        let event = SubscriptionEvent {
            facility,
            operation,
            index,
        };
        log::trace!("subscription event: {event:?}");

        self.subscriptions.queue.borrow_mut().push_back(event);

        let mut defer = self.subscriptions.defer.borrow_mut();
        match &*defer {
            Some(e) => e.enable(true),
            None => {
                let core = self.weak_self.clone();
                let e = self.mainloop().defer_new(Box::new(move |e| {
                    let Some(core) = core.upgrade() else {
                        e.free();
                        return;
                    };
                    core.subscription_drain(e);
                }));
                *defer = Some(e);
            }
        }
    }

    /// Delivers everything queued so far. Events posted while draining
    /// stay queued for the next turn.
    fn subscription_drain(self: &Rc<Self>, defer: &Rc<DeferEvent>) {
        let events: Vec<SubscriptionEvent> =
            self.subscriptions.queue.borrow_mut().drain(..).collect();

        for event in events {
            let subscribers: Vec<Rc<Subscription>> =
                self.subscriptions.subscribers.borrow().clone();

            for s in subscribers {
                if s.dead.get() || !s.mask.contains(event.facility.mask()) {
                    continue;
                }

                let cb = s.callback.borrow_mut().take();
                if let Some(mut cb) = cb {
                    cb(self, event);
                    if !s.dead.get() && s.callback.borrow().is_none() {
                        *s.callback.borrow_mut() = Some(cb);
                    }
                }
            }
        }

        // Drop subscribers freed during delivery.
        self.subscriptions
            .subscribers
            .borrow_mut()
            .retain(|s| !s.dead.get());

        if self.subscriptions.queue.borrow().is_empty() {
            defer.enable(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idxset::INVALID_INDEX;
    use crate::mainloop::Mainloop;
    use pretty_assertions::assert_eq;

    fn setup() -> (Mainloop, Rc<Core>) {
        let ml = Mainloop::new().unwrap();
        let core = Core::new(Rc::new(ml.clone()));
        (ml, core)
    }

    #[test]
    fn post_then_drain_delivers_exactly_once() {
        let (ml, core) = setup();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen2 = seen.clone();
        let _sub = core.subscribe(
            SubscriptionMask::SINK,
            Box::new(move |_, ev| seen2.borrow_mut().push(ev)),
        );

        core.subscription_post(
            SubscriptionFacility::Sink,
            SubscriptionOperation::New,
            3,
        );
        assert!(seen.borrow().is_empty(), "delivery is never inline");

        ml.iterate(false).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].index, 3);

        ml.iterate(false).unwrap();
        assert_eq!(seen.borrow().len(), 1, "no duplicate delivery");
    }

    #[test]
    fn mask_filters_events() {
        let (ml, core) = setup();
        let count = Rc::new(Cell::new(0));

        let count2 = count.clone();
        let _sub = core.subscribe(
            SubscriptionMask::SOURCE,
            Box::new(move |_, _| count2.set(count2.get() + 1)),
        );

        core.subscription_post(
            SubscriptionFacility::Sink,
            SubscriptionOperation::New,
            0,
        );
        core.subscription_post(
            SubscriptionFacility::Source,
            SubscriptionOperation::Change,
            1,
        );
        ml.iterate(false).unwrap();

        assert_eq!(count.get(), 1);
    }

    #[test]
    fn post_during_delivery_is_deferred_to_a_later_turn() {
        let (ml, core) = setup();
        let turns = Rc::new(RefCell::new(Vec::new()));

        let turns2 = turns.clone();
        let _sub = core.subscribe(
            SubscriptionMask::SERVER,
            Box::new(move |core, ev| {
                turns2.borrow_mut().push(ev.index);
                if ev.index == 0 {
                    // Nested post from inside a delivery.
                    core.subscription_post(
                        SubscriptionFacility::Server,
                        SubscriptionOperation::Change,
                        1,
                    );
                }
            }),
        );

        core.subscription_post(
            SubscriptionFacility::Server,
            SubscriptionOperation::Change,
            0,
        );

        ml.iterate(false).unwrap();
        assert_eq!(&*turns.borrow(), &[0], "nested event held for next turn");

        ml.iterate(false).unwrap();
        assert_eq!(&*turns.borrow(), &[0, 1]);
    }

    #[test]
    fn unsubscribing_inside_callback_stops_the_drain() {
        let (ml, core) = setup();
        let count = Rc::new(Cell::new(0));

        let sub_slot: Rc<RefCell<Option<Rc<Subscription>>>> = Default::default();
        let count2 = count.clone();
        let sub_slot2 = sub_slot.clone();
        let sub = core.subscribe(
            SubscriptionMask::SERVER,
            Box::new(move |_, _| {
                count2.set(count2.get() + 1);
                if let Some(s) = sub_slot2.borrow().as_ref() {
                    s.free();
                }
            }),
        );
        *sub_slot.borrow_mut() = Some(sub);

        for _ in 0..3 {
            core.subscription_post(
                SubscriptionFacility::Server,
                SubscriptionOperation::Change,
                INVALID_INDEX,
            );
        }

        ml.iterate(false).unwrap();
        ml.iterate(false).unwrap();
        assert_eq!(count.get(), 1, "freed subscriber sees nothing further");
    }
}
