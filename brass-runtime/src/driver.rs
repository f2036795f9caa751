//! Timers, clock and the blocking bridge.
//!
//! The driver owns everything that completes from outside the run queue:
//!
//! - a min-heap of timer deadlines, fired by [`Driver::fire_due`];
//! - a channel of results from helper threads started by
//!   [`Driver::spawn_blocking`], drained by [`Driver::poll_remote`].
//!
//! Callbacks always run on the loop thread, with no driver state borrowed,
//! so they may arm new timers or start new blocking work.
//!
//! With a virtual clock, [`Driver::park`] never sleeps: it jumps the clock to
//! the next deadline.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::config::ClockMode;
use crate::panic::{catch_panic, Defect};

type TimerCallback = Box<dyn FnOnce()>;
type RemoteValue = Result<Box<dyn Any + Send>, Defect>;
type RemoteCallback = Box<dyn FnOnce(RemoteValue)>;

/// Handle of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

/// Handle of an in-flight blocking task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RemoteId(u64);

enum Clock {
    System,
    Virtual(Cell<Instant>),
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,
}

impl Timers {
    /// Earliest deadline with a live callback. Cancelled entries are pruned.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.callbacks.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerCallback> {
        loop {
            let Reverse((deadline, id)) = self.heap.peek().copied()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&id) {
                return Some(callback);
            }
        }
    }
}

/// Timer queue and blocking bridge of one runtime.
pub(crate) struct Driver {
    clock: Clock,
    timers: RefCell<Timers>,
    tx: Sender<(u64, RemoteValue)>,
    rx: Receiver<(u64, RemoteValue)>,
    remote: RefCell<HashMap<u64, RemoteCallback>>,
    next_remote: Cell<u64>,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("timers", &self.timers.borrow().callbacks.len())
            .field("in_flight", &self.remote.borrow().len())
            .finish()
    }
}

impl Driver {
    pub(crate) fn new(mode: ClockMode) -> Self {
        let (tx, rx) = unbounded();
        Self {
            clock: match mode {
                ClockMode::System => Clock::System,
                ClockMode::Virtual => Clock::Virtual(Cell::new(Instant::now())),
            },
            timers: RefCell::new(Timers::default()),
            tx,
            rx,
            remote: RefCell::new(HashMap::new()),
            next_remote: Cell::new(0),
        }
    }

    pub(crate) fn now(&self) -> Instant {
        match &self.clock {
            Clock::System => Instant::now(),
            Clock::Virtual(now) => now.get(),
        }
    }

    /// Arm a timer that calls `callback` once `after` has elapsed.
    pub(crate) fn add_timer(&self, after: Duration, callback: TimerCallback) -> TimerId {
        let deadline = self.now() + after;
        let mut timers = self.timers.borrow_mut();
        let id = timers.next_id;
        timers.next_id += 1;
        timers.heap.push(Reverse((deadline, id)));
        timers.callbacks.insert(id, callback);
        TimerId(id)
    }

    /// Disarm a timer. Unknown or fired timers are ignored.
    pub(crate) fn cancel_timer(&self, id: TimerId) {
        let removed = self.timers.borrow_mut().callbacks.remove(&id.0);
        drop(removed);
    }

    /// Number of armed timers.
    #[cfg(test)]
    pub(crate) fn armed_timers(&self) -> usize {
        self.timers.borrow().callbacks.len()
    }

    /// Run every timer whose deadline has passed. Returns how many fired.
    pub(crate) fn fire_due(&self) -> usize {
        let now = self.now();
        let mut fired = 0;
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            let Some(callback) = due else { break };
            fired += 1;
            if let Err(defect) = catch_panic(callback) {
                warn!(error = %defect, "timer callback panicked");
            }
        }
        fired
    }

    /// Run `work` on a helper thread and deliver its result to `callback`
    /// on the loop thread. A panic in `work` arrives as a defect.
    pub(crate) fn spawn_blocking<T, F, C>(&self, work: F, callback: C) -> RemoteId
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(Result<T, Defect>) + 'static,
    {
        let id = self.next_remote.get();
        self.next_remote.set(id + 1);

        let typed: RemoteCallback = Box::new(move |value: RemoteValue| {
            let result = value.and_then(|boxed| {
                boxed
                    .downcast::<T>()
                    .map(|v| *v)
                    .map_err(|_| Defect::new("blocking task returned an unexpected type"))
            });
            callback(result);
        });
        self.remote.borrow_mut().insert(id, typed);

        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("brass-blocking-{}", id))
            .spawn(move || {
                let result = catch_panic(work).map(|v| Box::new(v) as Box<dyn Any + Send>);
                // The loop may be gone; nothing left to deliver to.
                let _ = tx.send((id, result));
            });

        if let Err(err) = spawned {
            let callback = self.remote.borrow_mut().remove(&id);
            if let Some(callback) = callback {
                callback(Err(Defect::new(format!(
                    "failed to spawn blocking thread: {}",
                    err
                ))));
            }
        }
        RemoteId(id)
    }

    /// Forget an in-flight blocking task. Its result is discarded on arrival.
    pub(crate) fn cancel_remote(&self, id: RemoteId) {
        let removed = self.remote.borrow_mut().remove(&id.0);
        drop(removed);
    }

    /// Number of blocking tasks whose result is still awaited.
    pub(crate) fn in_flight(&self) -> usize {
        self.remote.borrow().len()
    }

    /// Deliver every result that has arrived. Returns how many were
    /// delivered.
    pub(crate) fn poll_remote(&self) -> usize {
        let mut delivered = 0;
        while let Ok((id, value)) = self.rx.try_recv() {
            if self.dispatch(id, value) {
                delivered += 1;
            }
        }
        delivered
    }

    fn dispatch(&self, id: u64, value: RemoteValue) -> bool {
        let callback = self.remote.borrow_mut().remove(&id);
        match callback {
            Some(callback) => {
                if let Err(defect) = catch_panic(|| callback(value)) {
                    warn!(error = %defect, "blocking task callback panicked");
                }
                true
            }
            None => {
                debug!(task = id, "discarding result of a cancelled blocking task");
                false
            }
        }
    }

    /// Wait until a timer is due or a blocking result arrives, then fire or
    /// deliver it. Returns false when nothing can ever arrive.
    pub(crate) fn park(&self) -> bool {
        let deadline = self.timers.borrow_mut().next_deadline();
        let in_flight = self.in_flight() > 0;

        match (&self.clock, deadline) {
            (Clock::Virtual(now), Some(deadline)) => {
                if deadline > now.get() {
                    now.set(deadline);
                }
                self.fire_due();
                true
            }
            (Clock::System, Some(deadline)) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                if in_flight {
                    match self.rx.recv_timeout(wait) {
                        Ok((id, value)) => {
                            self.dispatch(id, value);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return false,
                    }
                } else if !wait.is_zero() {
                    thread::sleep(wait);
                }
                self.fire_due();
                true
            }
            (_, None) if in_flight => match self.rx.recv() {
                Ok((id, value)) => {
                    self.dispatch(id, value);
                    true
                }
                Err(_) => false,
            },
            (_, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_virtual_clock_fires_in_deadline_order() {
        let driver = Driver::new(ClockMode::Virtual);
        let order = Rc::new(RefCell::new(Vec::new()));
        for (ms, tag) in [(30, "c"), (10, "a"), (20, "b")] {
            let o = order.clone();
            driver.add_timer(Duration::from_millis(ms), Box::new(move || o.borrow_mut().push(tag)));
        }
        let start = driver.now();
        while driver.park() {}
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert_eq!(driver.now() - start, Duration::from_millis(30));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let driver = Driver::new(ClockMode::Virtual);
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let id = driver.add_timer(Duration::from_millis(5), Box::new(move || h.set(true)));
        driver.cancel_timer(id);
        assert_eq!(driver.armed_timers(), 0);
        assert!(!driver.park());
        assert!(!hit.get());
    }

    #[test]
    fn test_zero_timer_fires_without_waiting() {
        let driver = Driver::new(ClockMode::System);
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        driver.add_timer(Duration::ZERO, Box::new(move || h.set(true)));
        assert_eq!(driver.fire_due(), 1);
        assert!(hit.get());
    }

    #[test]
    fn test_blocking_result_is_delivered() {
        let driver = Driver::new(ClockMode::System);
        let out = Rc::new(RefCell::new(None));
        let o = out.clone();
        driver.spawn_blocking(|| 6 * 7, move |r| *o.borrow_mut() = Some(r));
        while out.borrow().is_none() {
            assert!(driver.park());
        }
        assert_eq!(out.borrow_mut().take().unwrap().unwrap(), 42);
        assert_eq!(driver.in_flight(), 0);
    }

    #[test]
    fn test_blocking_panic_is_a_defect() {
        let driver = Driver::new(ClockMode::System);
        let out = Rc::new(RefCell::new(None));
        let o = out.clone();
        driver.spawn_blocking(|| -> u8 { panic!("worker died") }, move |r| *o.borrow_mut() = Some(r));
        while out.borrow().is_none() {
            assert!(driver.park());
        }
        let err = out.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.message(), "worker died");
    }

    #[test]
    fn test_cancelled_blocking_result_is_discarded() {
        let driver = Driver::new(ClockMode::System);
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let id = driver.spawn_blocking(|| 1u8, move |_| h.set(true));
        driver.cancel_remote(id);
        assert!(!driver.park());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.poll_remote(), 0);
        assert!(!hit.get());
    }
}
