//! # Queue
//!
//! FIFO queue shared between fibers of one runtime.
//!
//! ## Design
//!
//! - Bounded queues pick a [`Strategy`] for a full buffer: suspend the
//!   offerer, drop the new item, or evict the oldest one.
//! - Unbounded queues never suspend offerers.
//! - A waiting taker is served directly by the next offer, bypassing the
//!   buffer.
//! - Suspended operations install cancelers, so an interrupted taker or
//!   offerer leaves the wait list and never receives an item.
//!
//! Completions always fire after the queue state has been released, so the
//! woken fiber may use the queue again straight away.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;

use crate::completion::Completion;
use crate::effect::Effect;

/// What a bounded queue does with an offer when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Suspend the offerer until a taker makes room.
    #[default]
    BackPressure,
    /// Reject the new item; the offer resolves with `false`.
    Dropping,
    /// Evict the oldest item to make room for the new one.
    Sliding,
}

/// Error raised by queue operations after [`Queue::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was shut down.
    #[error("queue is shut down")]
    Closed,
}

struct Taker<A> {
    id: u64,
    done: Completion<QueueError, A>,
}

struct Offerer<A> {
    id: u64,
    item: A,
    done: Completion<QueueError, bool>,
}

struct State<A> {
    items: VecDeque<A>,
    capacity: Option<usize>,
    strategy: Strategy,
    takers: VecDeque<Taker<A>>,
    offerers: VecDeque<Offerer<A>>,
    shutdown: bool,
    next_waiter: u64,
}

impl<A: 'static> State<A> {
    fn waiter_id(&mut self) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        id
    }

    fn has_room(&self) -> bool {
        self.capacity.map_or(true, |cap| self.items.len() < cap)
    }

    /// First taker that is still waiting. Stale entries are discarded.
    fn pop_taker(&mut self) -> Option<Taker<A>> {
        while let Some(taker) = self.takers.pop_front() {
            if !taker.done.is_completed() {
                return Some(taker);
            }
        }
        None
    }

    fn pop_offerer(&mut self) -> Option<Offerer<A>> {
        while let Some(offerer) = self.offerers.pop_front() {
            if !offerer.done.is_completed() {
                return Some(offerer);
            }
        }
        None
    }

    /// Take the head item and, if an offerer is parked, move its item into
    /// the freed slot.
    fn pop_item(&mut self) -> (Option<A>, Option<Completion<QueueError, bool>>) {
        let item = self.items.pop_front();
        if item.is_none() {
            return (None, None);
        }
        match self.pop_offerer() {
            Some(offerer) => {
                self.items.push_back(offerer.item);
                (item, Some(offerer.done))
            }
            None => (item, None),
        }
    }
}

/// A FIFO queue of `A` values.
///
/// Cloning yields another handle to the same queue.
pub struct Queue<A> {
    state: Rc<RefCell<State<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Queue")
            .field("len", &st.items.len())
            .field("capacity", &st.capacity)
            .field("strategy", &st.strategy)
            .field("takers", &st.takers.len())
            .field("offerers", &st.offerers.len())
            .field("shutdown", &st.shutdown)
            .finish()
    }
}

impl<A: 'static> Queue<A> {
    fn with_capacity(capacity: Option<usize>, strategy: Strategy) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                items: VecDeque::new(),
                capacity,
                strategy,
                takers: VecDeque::new(),
                offerers: VecDeque::new(),
                shutdown: false,
                next_waiter: 0,
            })),
        }
    }

    /// Create a queue holding at most `capacity` items. A capacity of zero
    /// is treated as one.
    pub fn bounded(capacity: usize, strategy: Strategy) -> Self {
        Self::with_capacity(Some(capacity.max(1)), strategy)
    }

    /// Create a queue without a size limit.
    pub fn unbounded() -> Self {
        Self::with_capacity(None, Strategy::BackPressure)
    }

    /// Maximum number of buffered items, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.state.borrow().capacity
    }

    /// The strategy applied when full.
    pub fn strategy(&self) -> Strategy {
        self.state.borrow().strategy
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    /// True when no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().items.is_empty()
    }

    /// True once [`Queue::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.state.borrow().shutdown
    }

    /// Number of fibers suspended in [`Queue::take`].
    pub fn waiting_takers(&self) -> usize {
        let st = self.state.borrow();
        st.takers.iter().filter(|t| !t.done.is_completed()).count()
    }

    /// Number of fibers suspended in [`Queue::offer`].
    pub fn waiting_offerers(&self) -> usize {
        let st = self.state.borrow();
        st.offerers.iter().filter(|o| !o.done.is_completed()).count()
    }

    /// Offer `item`. Resolves with `true` once the item is queued or handed
    /// to a taker, or `false` if a dropping queue rejected it.
    pub fn offer<R: 'static>(&self, item: A) -> Effect<R, QueueError, bool> {
        let state = self.state.clone();
        Effect::register_async_labeled("queue.offer", move |_, done: Completion<QueueError, bool>| {
            let mut st = state.borrow_mut();
            if st.shutdown {
                drop(st);
                done.fail(QueueError::Closed);
                return None;
            }
            if let Some(taker) = st.pop_taker() {
                drop(st);
                taker.done.succeed(item);
                done.succeed(true);
                return None;
            }
            if st.has_room() {
                st.items.push_back(item);
                drop(st);
                done.succeed(true);
                return None;
            }
            match st.strategy {
                Strategy::Dropping => {
                    drop(st);
                    done.succeed(false);
                    None
                }
                Strategy::Sliding => {
                    let evicted = st.items.pop_front();
                    st.items.push_back(item);
                    drop(st);
                    drop(evicted);
                    done.succeed(true);
                    None
                }
                Strategy::BackPressure => {
                    let id = st.waiter_id();
                    st.offerers.push_back(Offerer { id, item, done });
                    let weak = Rc::downgrade(&state);
                    Some(Box::new(move || withdraw_offerer(&weak, id)))
                }
            }
        })
    }

    /// Take the oldest item, suspending while the queue is empty. After
    /// shutdown the remaining items are still handed out; once drained,
    /// `take` fails with [`QueueError::Closed`].
    pub fn take<R: 'static>(&self) -> Effect<R, QueueError, A> {
        let state = self.state.clone();
        Effect::register_async_labeled("queue.take", move |_, done: Completion<QueueError, A>| {
            let mut st = state.borrow_mut();
            let (item, freed) = st.pop_item();
            if let Some(item) = item {
                drop(st);
                if let Some(offerer) = freed {
                    offerer.succeed(true);
                }
                done.succeed(item);
                return None;
            }
            if st.shutdown {
                drop(st);
                done.fail(QueueError::Closed);
                return None;
            }
            let id = st.waiter_id();
            st.takers.push_back(Taker { id, done });
            let weak = Rc::downgrade(&state);
            Some(Box::new(move || withdraw_taker(&weak, id)))
        })
    }

    /// Take the oldest item without suspending.
    pub fn poll(&self) -> Option<A> {
        let (item, freed) = self.state.borrow_mut().pop_item();
        if let Some(offerer) = freed {
            offerer.succeed(true);
        }
        item
    }

    /// Shut the queue down. Suspended takers and offerers fail with
    /// [`QueueError::Closed`]; buffered items stay available to `take` and
    /// `poll`. Later offers fail.
    pub fn shutdown(&self) {
        let (takers, offerers) = {
            let mut st = self.state.borrow_mut();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            (
                std::mem::take(&mut st.takers),
                std::mem::take(&mut st.offerers),
            )
        };
        for taker in takers {
            taker.done.fail(QueueError::Closed);
        }
        for offerer in offerers {
            offerer.done.fail(QueueError::Closed);
        }
    }
}

fn withdraw_taker<A>(state: &Weak<RefCell<State<A>>>, id: u64) {
    let Some(state) = state.upgrade() else { return };
    let removed = {
        let mut st = state.borrow_mut();
        st.takers
            .iter()
            .position(|t| t.id == id)
            .and_then(|at| st.takers.remove(at))
    };
    drop(removed);
}

fn withdraw_offerer<A>(state: &Weak<RefCell<State<A>>>, id: u64) {
    let Some(state) = state.upgrade() else { return };
    let removed = {
        let mut st = state.borrow_mut();
        st.offerers
            .iter()
            .position(|o| o.id == id)
            .and_then(|at| st.offerers.remove(at))
    };
    drop(removed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Exit;
    use crate::fiber::FiberStatus;
    use crate::runtime::Runtime;

    type Eff<A> = Effect<(), QueueError, A>;

    #[test]
    fn test_fifo_order() {
        let rt = Runtime::new(());
        let q = Queue::unbounded();
        let program: Eff<Vec<u32>> = q
            .offer(1)
            .zip_right(q.offer(2))
            .zip_right(q.offer(3))
            .zip_right(q.take())
            .zip(q.take())
            .zip(q.take())
            .map(|((a, b), c)| vec![a, b, c]);
        assert_eq!(rt.block_on(program).unwrap(), Exit::Success(vec![1, 2, 3]));
        assert!(q.is_empty());
    }

    #[test]
    fn test_take_suspends_until_offer() {
        let rt = Runtime::new(());
        let q: Queue<&str> = Queue::unbounded();
        let taker = rt.fork(q.take::<()>());
        assert_eq!(q.waiting_takers(), 1);
        let offered = rt.block_on(q.offer::<()>("hello")).unwrap();
        assert_eq!(offered, Exit::Success(true));
        rt.run_until_idle().unwrap();
        assert_eq!(taker.poll(), Some(Exit::Success("hello")));
        assert!(q.is_empty());
    }

    #[test]
    fn test_back_pressure_suspends_offerer() {
        let rt = Runtime::new(());
        let q = Queue::bounded(1, Strategy::BackPressure);
        assert_eq!(q.poll(), None);
        rt.block_on(q.offer::<()>(1)).unwrap();
        let blocked = rt.fork(q.offer::<()>(2));
        assert_eq!(q.waiting_offerers(), 1);
        assert_eq!(q.poll(), Some(1));
        rt.run_until_idle().unwrap();
        assert_eq!(blocked.poll(), Some(Exit::Success(true)));
        assert_eq!(q.poll(), Some(2));
    }

    #[test]
    fn test_dropping_and_sliding() {
        let rt = Runtime::new(());
        let dropping = Queue::bounded(2, Strategy::Dropping);
        let sliding = Queue::bounded(2, Strategy::Sliding);
        for i in 0..4 {
            rt.block_on(dropping.offer::<()>(i)).unwrap();
            rt.block_on(sliding.offer::<()>(i)).unwrap();
        }
        assert_eq!(rt.block_on(dropping.offer::<()>(9)).unwrap(), Exit::Success(false));
        assert_eq!((dropping.poll(), dropping.poll()), (Some(0), Some(1)));
        assert_eq!((sliding.poll(), sliding.poll()), (Some(2), Some(3)));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let q: Queue<u8> = Queue::bounded(0, Strategy::Dropping);
        assert_eq!(q.capacity(), Some(1));
    }

    #[test]
    fn test_interrupted_taker_is_withdrawn() {
        let rt = Runtime::new(());
        let q = Queue::unbounded();
        let taker = rt.fork(q.take::<()>());
        assert_eq!(q.waiting_takers(), 1);
        taker.interrupt();
        rt.run_until_idle().unwrap();
        assert_eq!(q.waiting_takers(), 0);
        rt.block_on(q.offer::<()>(5)).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_offer_skips_taker_interrupted_in_same_turn() {
        let rt = Runtime::new(());
        let q: Queue<u8> = Queue::unbounded();
        let taker = Rc::new(rt.fork(q.take::<()>()));
        let (t, q2) = (taker.clone(), q.clone());
        let program: Eff<bool> = Eff::sync(move |_| t.interrupt()).zip_right(q2.offer(5));
        assert_eq!(rt.block_on(program).unwrap(), Exit::Success(true));
        rt.run_until_idle().unwrap();
        assert_eq!(taker.status(), FiberStatus::Interrupted);
        assert_eq!(q.waiting_takers(), 0);
        assert_eq!(q.poll(), Some(5));
    }

    #[test]
    fn test_take_skips_offerer_interrupted_in_same_turn() {
        let rt = Runtime::new(());
        let q = Queue::bounded(1, Strategy::BackPressure);
        rt.block_on(q.offer::<()>(1)).unwrap();
        let offerer = Rc::new(rt.fork(q.offer::<()>(2)));
        assert_eq!(q.waiting_offerers(), 1);
        let (o, q2) = (offerer.clone(), q.clone());
        let program: Eff<u8> = Eff::sync(move |_| o.interrupt()).zip_right(q2.take());
        assert_eq!(rt.block_on(program).unwrap(), Exit::Success(1));
        rt.run_until_idle().unwrap();
        assert_eq!(offerer.status(), FiberStatus::Interrupted);
        assert!(q.is_empty());
        assert_eq!(q.waiting_offerers(), 0);
    }

    #[test]
    fn test_shutdown_releases_waiters_and_drains() {
        let rt = Runtime::new(());
        let q = Queue::bounded(1, Strategy::BackPressure);
        rt.block_on(q.offer::<()>(1)).unwrap();
        let offerer = rt.fork(q.offer::<()>(2));
        q.shutdown();
        rt.run_until_idle().unwrap();
        assert_eq!(offerer.poll(), Some(Exit::fail(QueueError::Closed)));
        assert_eq!(rt.block_on(q.take::<()>()).unwrap(), Exit::Success(1));
        assert_eq!(rt.block_on(q.take::<()>()).unwrap(), Exit::fail(QueueError::Closed));
        assert_eq!(rt.block_on(q.offer::<()>(3)).unwrap(), Exit::fail(QueueError::Closed));
    }

    #[test]
    fn test_shutdown_fails_waiting_taker() {
        let rt = Runtime::new(());
        let q: Queue<u8> = Queue::unbounded();
        let taker = rt.fork(q.take::<()>());
        q.shutdown();
        rt.run_until_idle().unwrap();
        assert_eq!(taker.poll(), Some(Exit::fail(QueueError::Closed)));
    }
}
