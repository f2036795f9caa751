//! # FIFO Step Scheduler
//!
//! Cooperative, single-threaded run queue.
//!
//! ## Design
//!
//! - A FIFO queue of zero-argument step closures.
//! - `schedule` enqueues and, when no flush is in progress, drains the
//!   queue immediately.
//! - A flush never re-enters itself: work enqueued while flushing is run by
//!   the outer flush before it returns.
//! - Exactly one step runs to completion before the next one starts.
//!
//! Task labels are diagnostic only. Ordering is strict FIFO; fairness comes
//! from each fiber yielding when its opcode budget runs out.
//!
//! The scheduler also carries the "current fiber" slot. It is set for the
//! duration of a fiber step so that forks and log calls made from inside
//! the step can find their parent without any global state.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::{trace, warn};

use crate::fiber::FiberId;
use crate::fork_policy::FiberMeta;
use crate::panic::catch_panic;

/// A unit of scheduled work.
struct Task {
    label: &'static str,
    run: Box<dyn FnOnce()>,
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks enqueued.
    pub scheduled: u64,
    /// Tasks executed.
    pub executed: u64,
    /// Completed flushes.
    pub flushes: u64,
    /// Longest the queue has been.
    pub max_queue_len: usize,
    /// Tasks that panicked outside any fiber guard.
    pub panicked: u64,
}

/// The fiber whose step is currently running.
#[derive(Debug, Clone)]
pub(crate) struct CurrentFiber {
    pub(crate) id: FiberId,
    pub(crate) meta: Rc<FiberMeta>,
}

struct Inner {
    queue: RefCell<VecDeque<Task>>,
    flushing: Cell<bool>,
    current: RefCell<Option<CurrentFiber>>,
    stats: Cell<SchedulerStats>,
}

/// FIFO scheduler shared by every fiber of a runtime.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                queue: RefCell::new(VecDeque::new()),
                flushing: Cell::new(false),
                current: RefCell::new(None),
                stats: Cell::new(SchedulerStats::default()),
            }),
        }
    }

    /// Enqueue `task` and drain the queue unless a flush is already running.
    pub fn schedule<F>(&self, label: &'static str, task: F)
    where
        F: FnOnce() + 'static,
    {
        let len = {
            let mut queue = self.inner.queue.borrow_mut();
            queue.push_back(Task {
                label,
                run: Box::new(task),
            });
            queue.len()
        };
        self.update_stats(|s| {
            s.scheduled += 1;
            s.max_queue_len = s.max_queue_len.max(len);
        });
        if !self.inner.flushing.get() {
            self.flush();
        }
    }

    /// Drain the queue until it is empty. A nested call returns at once.
    pub fn flush(&self) {
        if self.inner.flushing.replace(true) {
            return;
        }
        let _guard = FlushGuard { inner: &self.inner };
        loop {
            let task = self.inner.queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            trace!(label = task.label, "running task");
            let label = task.label;
            if let Err(defect) = catch_panic(task.run) {
                warn!(label, error = %defect, "scheduled task panicked");
                self.update_stats(|s| s.panicked += 1);
            }
            self.update_stats(|s| s.executed += 1);
        }
        self.update_stats(|s| s.flushes += 1);
    }

    /// True while a flush is draining the queue.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.get()
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats.get()
    }

    /// Id of the fiber whose step is running, if any.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.current.borrow().as_ref().map(|c| c.id)
    }

    pub(crate) fn current(&self) -> Option<CurrentFiber> {
        self.inner.current.borrow().clone()
    }

    /// Mark `id` as the running fiber until the guard drops.
    pub(crate) fn enter(&self, id: FiberId, meta: Rc<FiberMeta>) -> CurrentGuard {
        let previous = self
            .inner
            .current
            .borrow_mut()
            .replace(CurrentFiber { id, meta });
        CurrentGuard {
            inner: self.inner.clone(),
            previous,
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.inner.stats.get();
        f(&mut stats);
        self.inner.stats.set(stats);
    }
}

struct FlushGuard<'a> {
    inner: &'a Inner,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.inner.flushing.set(false);
    }
}

/// Restores the previous current-fiber slot on drop.
pub(crate) struct CurrentGuard {
    inner: Rc<Inner>,
    previous: Option<CurrentFiber>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        *self.inner.current.borrow_mut() = previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_runs_immediately_when_idle() {
        let scheduler = Scheduler::new();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        scheduler.schedule("test", move || h.set(true));
        assert!(hit.get());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_fifo_order_with_nested_schedule() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (s, l) = (scheduler.clone(), log.clone());
        scheduler.schedule("outer", move || {
            l.borrow_mut().push("a");
            let l2 = l.clone();
            s.schedule("inner-1", move || l2.borrow_mut().push("c"));
            let l3 = l.clone();
            s.schedule("inner-2", move || l3.borrow_mut().push("d"));
            // nested schedules are queued, not run in place
            l.borrow_mut().push("b");
        });
        assert_eq!(*log.borrow(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_flush_is_not_reentrant() {
        let scheduler = Scheduler::new();
        let depth = Rc::new(Cell::new(0u32));
        let max_depth = Rc::new(Cell::new(0u32));
        for _ in 0..3 {
            let (s, d, m) = (scheduler.clone(), depth.clone(), max_depth.clone());
            scheduler.schedule("task", move || {
                d.set(d.get() + 1);
                m.set(m.get().max(d.get()));
                s.flush();
                d.set(d.get() - 1);
            });
        }
        assert_eq!(max_depth.get(), 1);
    }

    #[test]
    fn test_panicking_task_does_not_wedge_the_queue() {
        let scheduler = Scheduler::new();
        scheduler.schedule("bad", || panic!("task failure"));
        assert!(!scheduler.is_flushing());
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        scheduler.schedule("good", move || h.set(true));
        assert!(hit.get());
        assert_eq!(scheduler.stats().panicked, 1);
    }

    #[test]
    fn test_stats() {
        let scheduler = Scheduler::new();
        scheduler.schedule("a", || {});
        scheduler.schedule("b", || {});
        let stats = scheduler.stats();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.max_queue_len, 1);
    }

    #[test]
    fn test_current_fiber_guard_restores() {
        let scheduler = Scheduler::new();
        assert!(scheduler.current_fiber().is_none());
        {
            let _g = scheduler.enter(FiberId::new(7), Rc::new(FiberMeta::root_for_tests()));
            assert_eq!(scheduler.current_fiber(), Some(FiberId::new(7)));
        }
        assert!(scheduler.current_fiber().is_none());
    }
}
