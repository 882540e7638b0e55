//! Single-threaded I/O event loop.
//!
//! One thread calls [`IOEventLoop::run_loop`]; every registered callback runs
//! on that thread, serially and never re-entrantly. The loop blocks in a
//! single `epoll_wait`; timers are timerfds, signals arrive through one
//! signalfd (the signals are blocked on the loop thread at registration), and
//! a cross-thread exit is possible through an eventfd wakeup.
//!
//! A callback returning `Err` is a fatal condition: the loop stops and
//! `run_loop` propagates the error. Callbacks registered during dispatch are
//! observed no earlier than the next iteration.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use libc::{epoll_event, EPOLLIN, EPOLLOUT, EPOLL_CTL_ADD, EPOLL_CTL_DEL};
use log::error;

use crate::error::{Error, Result};
use crate::ffi::syscall;

/// Handle to a registered event, for enable/disable/delete.
pub type IoEventRef = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Dispatched before low-priority events ready in the same iteration.
    High,
    Low,
}

type Callback = Box<dyn FnMut() -> Result<()>>;
type SharedCallback = Rc<RefCell<Callback>>;

enum EventKind {
    /// An externally owned fd watched for readiness.
    ExternalFd { fd: RawFd },
    Timer { timer: File, periodic: bool },
    /// The loop's signalfd; per-signal callbacks live in `signal_callbacks`.
    SignalFd,
    Wakeup,
}

struct IoEvent {
    kind: EventKind,
    priority: Priority,
    callback: Option<SharedCallback>,
    enabled: Cell<bool>,
}

#[derive(Default)]
struct Registry {
    events: HashMap<u64, Rc<IoEvent>>,
    next_token: u64,
    signal_file: Option<File>,
    signal_fd_token: Option<u64>,
    signal_callbacks: HashMap<i32, SharedCallback>,
    signals: Vec<i32>,
}

pub struct IOEventLoop {
    epoll: File,
    wakeup: File,
    registry: RefCell<Registry>,
    exit: Cell<bool>,
    in_loop: Cell<bool>,
}

impl IOEventLoop {
    pub fn new() -> Result<Rc<Self>> {
        let epoll = syscall::epoll_create1()?;
        let wakeup = syscall::eventfd()?;
        let evloop = Rc::new(Self {
            epoll,
            wakeup,
            registry: RefCell::new(Registry::default()),
            exit: Cell::new(false),
            in_loop: Cell::new(false),
        });
        let token = evloop.register(
            IoEvent {
                kind: EventKind::Wakeup,
                priority: Priority::High,
                callback: None,
                enabled: Cell::new(true),
            },
            None,
        )?;
        evloop.epoll_add(evloop.wakeup.as_raw_fd(), EPOLLIN as u32, token)?;
        Ok(evloop)
    }

    fn register(&self, event: IoEvent, token: Option<u64>) -> Result<u64> {
        let mut registry = self.registry.borrow_mut();
        let token = token.unwrap_or_else(|| {
            registry.next_token += 1;
            registry.next_token
        });
        registry.events.insert(token, Rc::new(event));
        Ok(token)
    }

    fn epoll_add(&self, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = epoll_event { events, u64: token };
        syscall::epoll_ctl(&self.epoll, EPOLL_CTL_ADD, fd, Some(&mut ev))?;
        Ok(())
    }

    /// Calls `callback` whenever `fd` is readable without blocking.
    pub fn add_read_event(
        &self,
        fd: RawFd,
        priority: Priority,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<IoEventRef> {
        self.add_fd_event(fd, EPOLLIN as u32, priority, callback)
    }

    /// Calls `callback` whenever `fd` is writable without blocking.
    pub fn add_write_event(
        &self,
        fd: RawFd,
        priority: Priority,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<IoEventRef> {
        self.add_fd_event(fd, EPOLLOUT as u32, priority, callback)
    }

    fn add_fd_event(
        &self,
        fd: RawFd,
        events: u32,
        priority: Priority,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<IoEventRef> {
        let token = self.register(
            IoEvent {
                kind: EventKind::ExternalFd { fd },
                priority,
                callback: Some(Rc::new(RefCell::new(Box::new(callback)))),
                enabled: Cell::new(true),
            },
            None,
        )?;
        self.epoll_add(fd, events, token)?;
        Ok(token)
    }

    /// Calls `callback` every `interval` until the event is deleted.
    pub fn add_periodic_event(
        &self,
        interval: Duration,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<IoEventRef> {
        self.add_timer_event(interval, true, Priority::Low, callback)
    }

    /// Calls `callback` once, `delay` from now.
    pub fn add_one_time_event(
        &self,
        delay: Duration,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<IoEventRef> {
        self.add_timer_event(delay, false, Priority::Low, callback)
    }

    fn add_timer_event(
        &self,
        interval: Duration,
        periodic: bool,
        priority: Priority,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<IoEventRef> {
        let timer = syscall::timerfd_create()?;
        syscall::timerfd_settime(&timer, interval, periodic)?;
        let fd = timer.as_raw_fd();
        let token = self.register(
            IoEvent {
                kind: EventKind::Timer { timer, periodic },
                priority,
                callback: Some(Rc::new(RefCell::new(Box::new(callback)))),
                enabled: Cell::new(true),
            },
            None,
        )?;
        self.epoll_add(fd, EPOLLIN as u32, token)?;
        Ok(token)
    }

    /// Calls `callback` each time `sig` is delivered. Signal events are
    /// high priority; the signal is blocked on the calling thread so that it
    /// reaches the loop's signalfd instead of a handler.
    pub fn add_signal_event(
        &self,
        sig: i32,
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<()> {
        self.add_signal_callback(sig, Rc::new(RefCell::new(Box::new(callback))))
    }

    /// Registers one shared callback for several signals.
    pub fn add_signal_events(
        &self,
        sigs: &[i32],
        callback: impl FnMut() -> Result<()> + 'static,
    ) -> Result<()> {
        let shared: SharedCallback = Rc::new(RefCell::new(Box::new(callback)));
        for &sig in sigs {
            self.add_signal_callback(sig, Rc::clone(&shared))?;
        }
        Ok(())
    }

    fn add_signal_callback(&self, sig: i32, callback: SharedCallback) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        if registry.signal_callbacks.contains_key(&sig) {
            return Err(Error::ConfigConflict(format!(
                "signal {sig} is already registered with the loop"
            )));
        }
        registry.signals.push(sig);
        let mask = syscall::block_signals(&registry.signals)?;
        match registry.signal_fd_token {
            Some(_) => {
                // Re-arm the existing signalfd with the widened mask.
                let signal_fd = registry
                    .signal_file
                    .as_ref()
                    .expect("signalfd exists when its token does");
                syscall::signalfd_update(signal_fd, &mask)?;
            }
            None => {
                let signal_fd = syscall::signalfd_create(&mask)?;
                let fd = signal_fd.as_raw_fd();
                registry.signal_file = Some(signal_fd);
                drop(registry);
                let token = self.register(
                    IoEvent {
                        kind: EventKind::SignalFd,
                        priority: Priority::High,
                        callback: None,
                        enabled: Cell::new(true),
                    },
                    None,
                )?;
                self.epoll_add(fd, EPOLLIN as u32, token)?;
                registry = self.registry.borrow_mut();
                registry.signal_fd_token = Some(token);
            }
        }
        registry.signal_callbacks.insert(sig, callback);
        Ok(())
    }

    /// Runs until [`exit_loop`][Self::exit_loop] is called from a callback or
    /// a callback fails.
    pub fn run_loop(&self) -> Result<()> {
        if self.in_loop.replace(true) {
            return Err(Error::ConfigConflict("loop is already running".into()));
        }
        let result = self.poll_loop();
        self.in_loop.set(false);
        self.exit.set(false);
        result
    }

    fn poll_loop(&self) -> Result<()> {
        let mut buf = vec![epoll_event { events: 0, u64: 0 }; 64];
        while !self.exit.get() {
            let ready = match syscall::epoll_wait(&self.epoll, &mut buf, -1) {
                Ok(ready) => ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IoFault(e)),
            };

            // Snapshot the batch before dispatch so callbacks may register
            // and delete events freely.
            let mut batch: Vec<(u64, Rc<IoEvent>)> = {
                let registry = self.registry.borrow();
                ready
                    .iter()
                    .filter_map(|ev| {
                        let token = ev.u64;
                        registry.events.get(&token).map(|e| (token, Rc::clone(e)))
                    })
                    .collect()
            };
            batch.sort_by_key(|(_, event)| event.priority);

            for (token, event) in batch {
                if self.exit.get() {
                    break;
                }
                if !event.enabled.get() {
                    continue;
                }
                // The event may have been deleted by an earlier callback in
                // this batch.
                if !self.registry.borrow().events.contains_key(&token) {
                    continue;
                }
                self.dispatch(token, &event)?;
            }
        }
        Ok(())
    }

    fn dispatch(&self, token: u64, event: &IoEvent) -> Result<()> {
        match &event.kind {
            EventKind::Wakeup => {
                let mut buf = [0u8; 8];
                let _ = syscall::read(&self.wakeup, &mut buf);
                Ok(())
            }
            EventKind::SignalFd => self.drain_signals(),
            EventKind::Timer { timer, periodic } => {
                let mut buf = [0u8; 8];
                let _ = syscall::read(timer, &mut buf);
                let periodic = *periodic;
                let callback = event.callback.as_ref().expect("timer has a callback");
                (callback.borrow_mut())()?;
                if !periodic {
                    self.del_event(token);
                }
                Ok(())
            }
            EventKind::ExternalFd { .. } => {
                let callback = event.callback.as_ref().expect("fd event has a callback");
                (callback.borrow_mut())()
            }
        }
    }

    fn drain_signals(&self) -> Result<()> {
        let mut pending = Vec::new();
        {
            let registry = self.registry.borrow();
            let Some(signal_fd) = &registry.signal_file else {
                return Ok(());
            };
            loop {
                let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(
                        &mut info as *mut _ as *mut u8,
                        size_of::<libc::signalfd_siginfo>(),
                    )
                };
                match syscall::read(signal_fd, buf) {
                    Ok(n) if n == buf.len() => pending.push(info.ssi_signo as i32),
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::IoFault(e)),
                }
            }
        }
        for signo in pending {
            let callback = self
                .registry
                .borrow()
                .signal_callbacks
                .get(&signo)
                .cloned();
            match callback {
                Some(callback) => (callback.borrow_mut())()?,
                None => error!("unregistered signal {signo} delivered to the loop"),
            }
        }
        Ok(())
    }

    /// Makes `run_loop` return cleanly at the next iteration boundary. Safe
    /// to call from any callback; from another thread it additionally wakes
    /// the blocked `epoll_wait` through the eventfd.
    pub fn exit_loop(&self) -> Result<()> {
        self.exit.set(true);
        let one = 1u64.to_ne_bytes();
        let n = unsafe { libc::write(self.wakeup.as_raw_fd(), one.as_ptr() as _, one.len()) };
        if n == -1 {
            return Err(Error::IoFault(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Stops dispatching an event; it can be enabled again later.
    pub fn disable_event(&self, token: IoEventRef) -> bool {
        self.set_event_enabled(token, false)
    }

    pub fn enable_event(&self, token: IoEventRef) -> bool {
        self.set_event_enabled(token, true)
    }

    fn set_event_enabled(&self, token: IoEventRef, enabled: bool) -> bool {
        match self.registry.borrow().events.get(&token) {
            Some(event) => {
                event.enabled.set(enabled);
                true
            }
            None => false,
        }
    }

    /// Unregisters an event. External fds are detached from the epoll set;
    /// timer fds are closed by drop.
    pub fn del_event(&self, token: IoEventRef) -> bool {
        let Some(event) = self.registry.borrow_mut().events.remove(&token) else {
            return false;
        };
        if let EventKind::ExternalFd { fd } = &event.kind {
            let _ = syscall::epoll_ctl(&self.epoll, EPOLL_CTL_DEL, *fd, None);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};

    use super::*;

    fn new_loop() -> Rc<IOEventLoop> {
        IOEventLoop::new().unwrap()
    }

    #[test]
    fn periodic_event_fires_until_exit() {
        let evloop = new_loop();
        let count = Rc::new(Cell::new(0u32));
        let weak: Weak<IOEventLoop> = Rc::downgrade(&evloop);
        let count2 = Rc::clone(&count);
        evloop
            .add_periodic_event(Duration::from_millis(1), move || {
                count2.set(count2.get() + 1);
                if count2.get() == 3 {
                    weak.upgrade().unwrap().exit_loop()?;
                }
                Ok(())
            })
            .unwrap();
        evloop.run_loop().unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn one_time_event_fires_once() {
        let evloop = new_loop();
        let fired = Rc::new(Cell::new(0u32));
        let fired2 = Rc::clone(&fired);
        evloop
            .add_one_time_event(Duration::from_millis(1), move || {
                fired2.set(fired2.get() + 1);
                Ok(())
            })
            .unwrap();
        // Give the one-shot several chances to misfire before exiting.
        let weak = Rc::downgrade(&evloop);
        let ticks = Rc::new(Cell::new(0u32));
        evloop
            .add_periodic_event(Duration::from_millis(2), move || {
                ticks.set(ticks.get() + 1);
                if ticks.get() == 5 {
                    weak.upgrade().unwrap().exit_loop()?;
                }
                Ok(())
            })
            .unwrap();
        evloop.run_loop().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn failing_callback_aborts_loop() {
        let evloop = new_loop();
        evloop
            .add_one_time_event(Duration::from_millis(1), || {
                Err(Error::ConfigConflict("boom".into()))
            })
            .unwrap();
        assert!(evloop.run_loop().is_err());
    }

    #[test]
    fn signal_dispatch_and_priority_order() {
        let evloop = new_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order2 = Rc::clone(&order);
        evloop
            .add_signal_event(libc::SIGUSR1, move || {
                order2.borrow_mut().push("signal");
                Ok(())
            })
            .unwrap();

        let order3 = Rc::clone(&order);
        let weak = Rc::downgrade(&evloop);
        evloop
            .add_one_time_event(Duration::from_millis(1), move || {
                order3.borrow_mut().push("timer");
                weak.upgrade().unwrap().exit_loop()?;
                Ok(())
            })
            .unwrap();

        // SIGUSR1 is blocked on this thread since registration; make both the
        // pending signal and the expired timer ready before the first poll.
        unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGUSR1) };
        std::thread::sleep(Duration::from_millis(10));

        evloop.run_loop().unwrap();
        assert_eq!(*order.borrow(), vec!["signal", "timer"]);
    }

    #[test]
    fn deleted_event_stops_firing() {
        let evloop = new_loop();
        let count = Rc::new(Cell::new(0u32));
        let count2 = Rc::clone(&count);
        let token = evloop
            .add_periodic_event(Duration::from_millis(1), move || {
                count2.set(count2.get() + 1);
                Ok(())
            })
            .unwrap();
        assert!(evloop.del_event(token));
        assert!(!evloop.del_event(token));

        let weak = Rc::downgrade(&evloop);
        evloop
            .add_one_time_event(Duration::from_millis(5), move || {
                weak.upgrade().unwrap().exit_loop()
            })
            .unwrap();
        evloop.run_loop().unwrap();
        assert_eq!(count.get(), 0);
    }
}
