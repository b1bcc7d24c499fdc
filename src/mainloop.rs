//! The single-threaded cooperative event loop.
//!
//! Everything in the server happens inside callbacks dispatched from here:
//! I/O readiness, timer expiry, and deferred work all run serially on one
//! thread, so the core needs no locking. The [`EventLoop`] trait is the
//! seam the core consumes; [`Mainloop`] is the poll-backed implementation,
//! but an embedding can substitute its own.
//!
//! Freeing a handle never tears it down immediately: the handle is marked
//! dead and collected at the top of the *next* iteration, which makes it
//! safe for a callback to free any handle, including its own.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Interest, Token};

bitflags! {
    /// Kinds of I/O readiness an [`IoEvent`] can watch and report.
    ///
    /// `HANGUP` and `ERROR` are always reported, whether requested or not.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct IoEventFlags: u32 {
        /// The fd is readable.
        const INPUT = 0x1;
        /// The fd is writable.
        const OUTPUT = 0x2;
        /// The peer hung up.
        const HANGUP = 0x4;
        /// The fd is in an error state.
        const ERROR = 0x8;
    }
}

/// Callback for I/O readiness. Receives the handle (for re-arming or
/// freeing from inside the callback) and the raised subset of flags.
pub type IoCallback = Box<dyn FnMut(&Rc<IoEvent>, IoEventFlags)>;
/// Callback for timer expiry. One-shot: re-arm through the handle.
pub type TimeCallback = Box<dyn FnMut(&Rc<TimeEvent>, Instant)>;
/// Callback for deferred work. Runs every iteration while enabled.
pub type DeferCallback = Box<dyn FnMut(&Rc<DeferEvent>)>;
/// Hook that runs when a freed handle is collected.
pub type DestroyCallback = Box<dyn FnOnce()>;

/// The abstract event loop API the core is written against.
pub trait EventLoop {
    /// Registers an I/O watch on `fd`. Readiness is edge-style: callbacks
    /// must drain the fd until `WouldBlock`, or they will not fire again.
    fn io_new(&self, fd: RawFd, events: IoEventFlags, callback: IoCallback) -> Rc<IoEvent>;

    /// Arms a one-shot timer with an absolute deadline.
    fn time_new(&self, deadline: Instant, callback: TimeCallback) -> Rc<TimeEvent>;

    /// Creates a deferred event, initially enabled. While enabled, the
    /// callback runs once per loop iteration, before polling.
    fn defer_new(&self, callback: DeferCallback) -> Rc<DeferEvent>;

    /// Asks the loop to terminate with the given exit code.
    fn quit(&self, retval: i32);
}

/// An I/O watch registered with the loop.
pub struct IoEvent {
    mainloop: Weak<Inner>,
    fd: RawFd,
    token: Token,
    events: Cell<IoEventFlags>,
    registered: Cell<bool>,
    dead: Cell<bool>,
    callback: RefCell<Option<IoCallback>>,
    destroy: RefCell<Option<DestroyCallback>>,
}

impl IoEvent {
    /// The watched fd.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Changes which readiness kinds are watched.
    pub fn enable(self: &Rc<Self>, events: IoEventFlags) {
        self.events.set(events);
        if let Some(inner) = self.mainloop.upgrade() {
            inner.reregister_io(self);
        }
    }

    /// Marks the event for deletion. The callback never fires after this
    /// returns; the destroy hook runs at the next iteration.
    pub fn free(&self) {
        self.dead.set(true);
        if let Some(inner) = self.mainloop.upgrade() {
            inner.io_dead.set(true);
        }
    }

    /// Installs a hook that runs when the dead handle is collected.
    pub fn set_destroy(&self, callback: DestroyCallback) {
        *self.destroy.borrow_mut() = Some(callback);
    }
}

/// A one-shot timer registered with the loop.
pub struct TimeEvent {
    mainloop: Weak<Inner>,
    deadline: Cell<Option<Instant>>,
    dead: Cell<bool>,
    callback: RefCell<Option<TimeCallback>>,
    destroy: RefCell<Option<DestroyCallback>>,
}

impl TimeEvent {
    /// Re-arms the timer with a new absolute deadline.
    pub fn restart(&self, deadline: Instant) {
        self.deadline.set(Some(deadline));
    }

    /// Disarms the timer without freeing it.
    pub fn disarm(&self) {
        self.deadline.set(None);
    }

    /// Marks the event for deletion.
    pub fn free(&self) {
        self.dead.set(true);
        if let Some(inner) = self.mainloop.upgrade() {
            inner.time_dead.set(true);
        }
    }

    /// Installs a hook that runs when the dead handle is collected.
    pub fn set_destroy(&self, callback: DestroyCallback) {
        *self.destroy.borrow_mut() = Some(callback);
    }
}

/// A deferred event registered with the loop.
pub struct DeferEvent {
    mainloop: Weak<Inner>,
    enabled: Cell<bool>,
    dead: Cell<bool>,
    callback: RefCell<Option<DeferCallback>>,
    destroy: RefCell<Option<DestroyCallback>>,
}

impl DeferEvent {
    /// Enables or disables the event. While enabled, the loop will not
    /// block in poll.
    pub fn enable(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    /// Whether the event is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Marks the event for deletion.
    pub fn free(&self) {
        self.dead.set(true);
        if let Some(inner) = self.mainloop.upgrade() {
            inner.defer_dead.set(true);
        }
    }

    /// Installs a hook that runs when the dead handle is collected.
    pub fn set_destroy(&self, callback: DestroyCallback) {
        *self.destroy.borrow_mut() = Some(callback);
    }
}

struct Inner {
    poll: RefCell<mio::Poll>,
    ios: RefCell<Vec<Rc<IoEvent>>>,
    times: RefCell<Vec<Rc<TimeEvent>>>,
    defers: RefCell<Vec<Rc<DeferEvent>>>,
    io_dead: Cell<bool>,
    time_dead: Cell<bool>,
    defer_dead: Cell<bool>,
    next_token: Cell<usize>,
    quit: Cell<Option<i32>>,
}

impl Inner {
    fn interest(flags: IoEventFlags) -> Option<Interest> {
        let mut interest = None;
        if flags.contains(IoEventFlags::INPUT) {
            interest = Some(Interest::READABLE);
        }
        if flags.contains(IoEventFlags::OUTPUT) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }

    fn reregister_io(&self, e: &IoEvent) {
        let poll = self.poll.borrow();
        let registry = poll.registry();
        let mut source = SourceFd(&e.fd);

        if e.registered.get() {
            let _ = registry.deregister(&mut source);
            e.registered.set(false);
        }

        if e.dead.get() {
            return;
        }

        if let Some(interest) = Self::interest(e.events.get()) {
            match registry.register(&mut source, e.token, interest) {
                Ok(()) => e.registered.set(true),
                Err(err) => log::error!("failed to register fd {}: {err}", e.fd),
            }
        }
    }

    fn sweep_dead(&self) {
        if self.io_dead.replace(false) {
            let dead: Vec<Rc<IoEvent>> = {
                let mut ios = self.ios.borrow_mut();
                let (dead, alive) = ios.drain(..).partition(|e| e.dead.get());
                *ios = alive;
                dead
            };

            for e in dead {
                self.reregister_io(&e);
                if let Some(destroy) = e.destroy.borrow_mut().take() {
                    destroy();
                }
                e.callback.borrow_mut().take();
            }
        }

        if self.time_dead.replace(false) {
            let dead: Vec<Rc<TimeEvent>> = {
                let mut times = self.times.borrow_mut();
                let (dead, alive) = times.drain(..).partition(|e| e.dead.get());
                *times = alive;
                dead
            };

            for e in dead {
                if let Some(destroy) = e.destroy.borrow_mut().take() {
                    destroy();
                }
                e.callback.borrow_mut().take();
            }
        }

        if self.defer_dead.replace(false) {
            let dead: Vec<Rc<DeferEvent>> = {
                let mut defers = self.defers.borrow_mut();
                let (dead, alive) = defers.drain(..).partition(|e| e.dead.get());
                *defers = alive;
                dead
            };

            for e in dead {
                if let Some(destroy) = e.destroy.borrow_mut().take() {
                    destroy();
                }
                e.callback.borrow_mut().take();
            }
        }
    }

    fn dispatch_defers(&self) {
        let snapshot: Vec<Rc<DeferEvent>> = self.defers.borrow().clone();
        for e in snapshot {
            if e.dead.get() || !e.enabled.get() {
                continue;
            }

            // Take the callback out for the call, so the callback can
            // inspect or free its own handle without re-borrowing.
            let cb = e.callback.borrow_mut().take();
            if let Some(mut cb) = cb {
                cb(&e);
                if e.callback.borrow().is_none() {
                    *e.callback.borrow_mut() = Some(cb);
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.times
            .borrow()
            .iter()
            .filter(|e| !e.dead.get())
            .filter_map(|e| e.deadline.get())
            .min()
    }

    fn dispatch_timers(&self, now: Instant) {
        let snapshot: Vec<Rc<TimeEvent>> = self.times.borrow().clone();
        for e in snapshot {
            if e.dead.get() {
                continue;
            }

            let Some(deadline) = e.deadline.get() else {
                continue;
            };
            if deadline > now {
                continue;
            }

            // One-shot: disarm before dispatch, the callback may re-arm.
            e.deadline.set(None);

            let cb = e.callback.borrow_mut().take();
            if let Some(mut cb) = cb {
                cb(&e, deadline);
                if e.callback.borrow().is_none() {
                    *e.callback.borrow_mut() = Some(cb);
                }
            }
        }
    }

    fn dispatch_io(&self, events: &mio::Events) {
        let ios: Vec<Rc<IoEvent>> = self.ios.borrow().clone();
        for event in events.iter() {
            let Some(e) = ios.iter().find(|e| e.token == event.token()) else {
                continue;
            };
            if e.dead.get() {
                continue;
            }

            let mut flags = IoEventFlags::empty();
            if event.is_readable() {
                flags |= IoEventFlags::INPUT;
            }
            if event.is_writable() {
                flags |= IoEventFlags::OUTPUT;
            }
            if event.is_read_closed() || event.is_write_closed() {
                flags |= IoEventFlags::HANGUP;
            }
            if event.is_error() {
                flags |= IoEventFlags::ERROR;
            }

            if flags.is_empty() {
                continue;
            }

            let cb = e.callback.borrow_mut().take();
            if let Some(mut cb) = cb {
                cb(e, flags);
                if e.callback.borrow().is_none() {
                    *e.callback.borrow_mut() = Some(cb);
                }
            }
        }
    }
}

/// The poll-backed event loop.
///
/// `Mainloop` is a cheap handle; clone it to hand the loop around.
#[derive(Clone)]
pub struct Mainloop {
    inner: Rc<Inner>,
}

impl Mainloop {
    /// Creates a new loop.
    pub fn new() -> std::io::Result<Mainloop> {
        Ok(Mainloop {
            inner: Rc::new(Inner {
                poll: RefCell::new(mio::Poll::new()?),
                ios: Default::default(),
                times: Default::default(),
                defers: Default::default(),
                io_dead: Cell::new(false),
                time_dead: Cell::new(false),
                defer_dead: Cell::new(false),
                next_token: Cell::new(0),
                quit: Cell::new(None),
            }),
        })
    }

    /// Runs a single iteration: collect dead handles, run deferred
    /// callbacks, poll (blocking according to `block` and the nearest
    /// timer), then dispatch expired timers and ready I/O.
    ///
    /// Returns the exit code once [`EventLoop::quit`] has been called.
    pub fn iterate(&self, block: bool) -> std::io::Result<Option<i32>> {
        let inner = &self.inner;

        if let Some(retval) = inner.quit.get() {
            return Ok(Some(retval));
        }

        inner.sweep_dead();
        inner.dispatch_defers();

        if let Some(retval) = inner.quit.get() {
            return Ok(Some(retval));
        }

        let any_defer_enabled = inner
            .defers
            .borrow()
            .iter()
            .any(|e| e.enabled.get() && !e.dead.get());

        let now = Instant::now();
        let timeout = if !block || any_defer_enabled {
            Some(Duration::ZERO)
        } else {
            inner
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
        };

        let mut events = mio::Events::with_capacity(64);
        {
            let mut poll = inner.poll.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        inner.dispatch_timers(Instant::now());
        inner.dispatch_io(&events);

        Ok(inner.quit.get())
    }

    /// Iterates until quit is requested, then returns the exit code.
    pub fn run(&self) -> std::io::Result<i32> {
        loop {
            if let Some(retval) = self.iterate(true)? {
                // One final sweep so destroy hooks of late frees run.
                self.inner.sweep_dead();
                return Ok(retval);
            }
        }
    }
}

impl EventLoop for Mainloop {
    fn io_new(&self, fd: RawFd, events: IoEventFlags, callback: IoCallback) -> Rc<IoEvent> {
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);

        let e = Rc::new(IoEvent {
            mainloop: Rc::downgrade(&self.inner),
            fd,
            token,
            events: Cell::new(events),
            registered: Cell::new(false),
            dead: Cell::new(false),
            callback: RefCell::new(Some(callback)),
            destroy: RefCell::new(None),
        });

        self.inner.reregister_io(&e);
        self.inner.ios.borrow_mut().push(e.clone());
        e
    }

    fn time_new(&self, deadline: Instant, callback: TimeCallback) -> Rc<TimeEvent> {
        let e = Rc::new(TimeEvent {
            mainloop: Rc::downgrade(&self.inner),
            deadline: Cell::new(Some(deadline)),
            dead: Cell::new(false),
            callback: RefCell::new(Some(callback)),
            destroy: RefCell::new(None),
        });

        self.inner.times.borrow_mut().push(e.clone());
        e
    }

    fn defer_new(&self, callback: DeferCallback) -> Rc<DeferEvent> {
        let e = Rc::new(DeferEvent {
            mainloop: Rc::downgrade(&self.inner),
            enabled: Cell::new(true),
            dead: Cell::new(false),
            callback: RefCell::new(Some(callback)),
            destroy: RefCell::new(None),
        });

        self.inner.defers.borrow_mut().push(e.clone());
        e
    }

    fn quit(&self, retval: i32) {
        self.inner.quit.set(Some(retval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_runs_every_iteration_until_disabled() {
        let ml = Mainloop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));

        let count2 = count.clone();
        let defer = ml.defer_new(Box::new(move |e| {
            count2.set(count2.get() + 1);
            if count2.get() == 3 {
                e.enable(false);
            }
        }));

        for _ in 0..5 {
            ml.iterate(false).unwrap();
        }
        assert_eq!(count.get(), 3);

        defer.enable(true);
        ml.iterate(false).unwrap();
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn timer_fires_once_and_can_rearm() {
        let ml = Mainloop::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));

        let fired2 = fired.clone();
        let _t = ml.time_new(
            Instant::now(),
            Box::new(move |e, deadline| {
                fired2.set(fired2.get() + 1);
                if fired2.get() < 2 {
                    e.restart(deadline);
                }
            }),
        );

        ml.iterate(false).unwrap();
        assert_eq!(fired.get(), 1);
        ml.iterate(false).unwrap();
        assert_eq!(fired.get(), 2);
        ml.iterate(false).unwrap();
        assert_eq!(fired.get(), 2, "one-shot after the re-arm chain ends");
    }

    #[test]
    fn freed_handle_never_fires_and_destroy_hook_runs() {
        let ml = Mainloop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let destroyed = Rc::new(Cell::new(false));

        let fired2 = fired.clone();
        let t = ml.time_new(
            Instant::now(),
            Box::new(move |_, _| {
                fired2.set(true);
            }),
        );

        let destroyed2 = destroyed.clone();
        t.set_destroy(Box::new(move || destroyed2.set(true)));
        t.free();

        ml.iterate(false).unwrap();
        assert!(!fired.get());

        ml.iterate(false).unwrap();
        assert!(destroyed.get(), "destroy hook runs at collection");
    }

    #[test]
    fn handle_freed_inside_its_own_callback_is_safe() {
        let ml = Mainloop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));

        let count2 = count.clone();
        let _d = ml.defer_new(Box::new(move |e| {
            count2.set(count2.get() + 1);
            e.free();
        }));

        for _ in 0..3 {
            ml.iterate(false).unwrap();
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn quit_stops_run() {
        let ml = Mainloop::new().unwrap();
        let ml2 = ml.clone();
        let _d = ml.defer_new(Box::new(move |_| {
            ml2.quit(7);
        }));

        assert_eq!(ml.run().unwrap(), 7);
    }

    #[test]
    fn io_event_fires_on_readable_pipe() {
        use std::io::Write;
        use std::os::fd::AsRawFd;

        let ml = Mainloop::new().unwrap();
        let (rx, mut tx) = std::io::pipe().unwrap();

        let got = Rc::new(Cell::new(IoEventFlags::empty()));
        let got2 = got.clone();
        let _io = ml.io_new(
            rx.as_raw_fd(),
            IoEventFlags::INPUT,
            Box::new(move |_, flags| {
                got2.set(flags);
            }),
        );

        tx.write_all(b"x").unwrap();
        // Give the kernel a beat; poll with a real (short) timeout.
        for _ in 0..10 {
            ml.iterate(false).unwrap();
            if !got.get().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(got.get().contains(IoEventFlags::INPUT));
    }
}
