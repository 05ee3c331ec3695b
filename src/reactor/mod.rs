//! The reactor: a single-threaded readiness-event multiplexer.
//!
//! One `Reactor` owns one `mio::Poll` and a table mapping registered file
//! descriptors (by `Token`) to a readiness callback. `run()` blocks on the
//! OS poller, dispatching ready callbacks synchronously, one at a time, to
//! completion before the next begins. No callback may call `run()` itself.
//! Callbacks receive `&mut Reactor` so they can re-register interest, arm
//! timers, or defer further work.
//!
//! Two satellite queues live here because both are driven by the same
//! "what happens this tick" loop as the readiness events: a
//! deadline-ordered timer wheel (idle-connection timeouts) and a
//! zero-delay "next tick" queue, so a `Stream` read already satisfied at
//! submission time still completes asynchronously rather than
//! synchronously.

mod timer;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

pub use mio::{Interest, Token};
use mio::{Events, Poll, event::Source};

pub use timer::TimerHandle;
use timer::TimerWheel;

use crate::error::{Result, ServerError};

/// Which direction(s) became ready for a registered fd.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub readable: bool,
    pub writable: bool,
}

pub type ReadyCallback = Box<dyn FnMut(&mut Reactor, ReadyEvent)>;
pub type DeferredCallback = Box<dyn FnOnce(&mut Reactor)>;

pub struct Reactor {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, ReadyCallback>,
    timers: TimerWheel,
    next_tick: Vec<DeferredCallback>,
    stop: bool,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            registrations: HashMap::new(),
            timers: TimerWheel::new(),
            next_tick: Vec::new(),
            stop: false,
        })
    }

    /// Registers `source` under `token` with the given interest set and
    /// callback. Fails if `token` is already registered.
    pub fn add(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
        callback: ReadyCallback,
    ) -> Result<()> {
        if self.registrations.contains_key(&token) {
            return Err(ServerError::UserCallbackFault(format!(
                "fd already registered under {token:?}"
            )));
        }
        self.poll.registry().register(source, token, interest)?;
        self.registrations.insert(token, callback);
        Ok(())
    }

    /// Changes the interest set for an already-registered fd. Calling this
    /// with the same mask it already holds is a harmless no-op in effect
    /// (the syscall is idempotent at the kernel level).
    pub fn modify(&mut self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    /// Unregisters `token`. Idempotent: removing an already-removed or
    /// never-registered token is not an error.
    pub fn remove(&mut self, source: &mut dyn Source, token: Token) -> Result<()> {
        let _ = self.poll.registry().deregister(source);
        self.registrations.remove(&token);
        Ok(())
    }

    /// Arms a one-shot timer firing at or after `deadline`.
    pub fn add_timeout(&mut self, deadline: Instant, callback: DeferredCallback) -> TimerHandle {
        self.timers.add(deadline, callback)
    }

    /// Disarms a timer. Idempotent if it already fired or was removed.
    pub fn remove_timeout(&mut self, handle: TimerHandle) {
        self.timers.remove(handle);
    }

    /// Schedules `callback` to run on a later tick of `run()`, never on the
    /// current call stack. Used by `Stream::read_until`/`read_bytes` when
    /// the requested condition is already satisfied at submission time.
    pub fn defer(&mut self, callback: DeferredCallback) {
        self.next_tick.push(callback);
    }

    /// Requests that `run()` return after the current iteration.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Runs the event loop until `stop()` is called. Each ready callback
    /// (readiness event, expired timer, or deferred next-tick callback) is
    /// isolated: a panic inside one is logged and only that fd's
    /// registration is torn down, the reactor itself keeps running.
    pub fn run(&mut self) -> Result<()> {
        while !self.stop {
            self.run_once()?;
        }
        Ok(())
    }

    /// Runs exactly one iteration: drain the next-tick queue, fire expired
    /// timers, then block on the poller for at most the time remaining
    /// until the next timer (or indefinitely with none pending and an
    /// empty next-tick queue).
    pub fn run_once(&mut self) -> Result<()> {
        self.drain_next_tick();

        let now = Instant::now();
        let mut timers = std::mem::take(&mut self.timers);
        timers.fire_due(now, self);
        self.timers = timers;

        let timeout = self.poll_timeout(now);
        self.poll.poll(&mut self.events, timeout)?;

        let ready: Vec<(Token, ReadyEvent)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    ReadyEvent {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                    },
                )
            })
            .collect();

        for (token, ready_event) in ready {
            self.dispatch(token, ready_event);
        }
        Ok(())
    }

    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.next_tick.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers.next_deadline().map(|deadline| {
            if deadline <= now {
                Duration::ZERO
            } else {
                deadline - now
            }
        })
    }

    fn drain_next_tick(&mut self) {
        // Cap one sweep to what's queued *before* this call; callbacks that
        // themselves defer land on the following tick, same as a readiness
        // callback issuing a new read would.
        let pending = std::mem::take(&mut self.next_tick);
        for callback in pending {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(self)));
            if let Err(panic) = result {
                let msg = panic_message(&panic);
                proxy_log::errors!("deferred callback panicked: {msg}");
            }
        }
    }

    fn dispatch(&mut self, token: Token, ready_event: ReadyEvent) {
        let Some(mut callback) = self.registrations.remove(&token) else {
            return; // Removed between poll() returning and dispatch.
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(self, ready_event)));
        match result {
            Ok(()) => {
                // Put it back unless the callback already re-registered
                // (which would have inserted a fresh entry under the same
                // token) or deregistered it.
                self.registrations.entry(token).or_insert(callback);
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                proxy_log::errors!("callback for {token:?} panicked: {msg}; dropping registration");
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // These exercise the satellite queues directly rather than through
    // `run_once`, which would otherwise block in `Poll::poll` forever with
    // no registered sources and nothing due.

    #[test]
    fn defer_runs_on_a_later_tick_not_synchronously() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired_clone = fired.clone();
        reactor.defer(Box::new(move |_| *fired_clone.borrow_mut() = true));
        assert!(!*fired.borrow());
        reactor.drain_next_tick();
        assert!(*fired.borrow());
    }

    #[test]
    fn timer_fires_once_due() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired_clone = fired.clone();
        reactor.add_timeout(Instant::now(), Box::new(move |_| *fired_clone.borrow_mut() = true));
        let mut timers = std::mem::take(&mut reactor.timers);
        timers.fire_due(Instant::now(), &mut reactor);
        reactor.timers = timers;
        assert!(*fired.borrow());
    }

    #[test]
    fn removed_timer_does_not_fire() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired_clone = fired.clone();
        let handle = reactor.add_timeout(
            Instant::now() + Duration::from_secs(60),
            Box::new(move |_| *fired_clone.borrow_mut() = true),
        );
        reactor.remove_timeout(handle);
        let mut timers = std::mem::take(&mut reactor.timers);
        timers.fire_due(Instant::now() + Duration::from_secs(120), &mut reactor);
        reactor.timers = timers;
        assert!(!*fired.borrow());
    }
}
