//! # Pull streams
//!
//! A [`Stream`] is a re-pullable description of "produce the next element".
//! Pulling runs an effect that resolves with a [`Pull`]:
//!
//! ```text
//!   pull ──► Value(a, rest) ──► pull rest ──► ... ──► End
//!                                         └─────────► Error(e)
//! ```
//!
//! End of data is a regular value, never a failure, so the failure channel
//! of the pull effect only ever carries interrupts and defects. Pulling the
//! same stream twice starts over; only `rest` advances.

use std::convert::Infallible;
use std::fmt;
use std::rc::Rc;

use crate::cause::Exit;
use crate::concurrency::race_with;
use crate::effect::Effect;
use crate::fiber::Fiber;
use crate::queue::Queue;
use crate::scope::Scope;

/// Result of pulling a stream once.
pub enum Pull<R, E, A> {
    /// One element and the stream of everything after it.
    Value(A, Stream<R, E, A>),
    /// The stream is exhausted.
    End,
    /// The stream failed; no more elements follow.
    Error(E),
}

impl<R, E: fmt::Debug, A: fmt::Debug> fmt::Debug for Pull<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pull::Value(a, _) => f.debug_tuple("Value").field(a).field(&"..").finish(),
            Pull::End => f.write_str("End"),
            Pull::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

type PullFn<R, E, A> = Rc<dyn Fn() -> Effect<R, Infallible, Pull<R, E, A>>>;

/// A lazily pulled sequence of `A` values that may fail with `E`.
pub struct Stream<R, E, A> {
    pull: PullFn<R, E, A>,
}

impl<R, E, A> Clone for Stream<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            pull: self.pull.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Stream<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stream(..)")
    }
}

impl<R: 'static, E: 'static, A: 'static> Stream<R, E, A> {
    /// Build a stream from its pull function.
    pub fn new<F>(pull: F) -> Self
    where
        F: Fn() -> Effect<R, Infallible, Pull<R, E, A>> + 'static,
    {
        Self { pull: Rc::new(pull) }
    }

    /// The effect producing the next element.
    pub fn pull(&self) -> Effect<R, Infallible, Pull<R, E, A>> {
        (self.pull)()
    }

    /// A stream with no elements.
    pub fn empty() -> Self {
        Self::new(|| Effect::succeed(Pull::End))
    }

    /// A stream of the items of `iter`, in order.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Clone,
    {
        let items: Rc<[A]> = iter.into_iter().collect::<Vec<_>>().into();
        Self::from_slice(items, 0)
    }

    fn from_slice(items: Rc<[A]>, at: usize) -> Self
    where
        A: Clone,
    {
        Self::new(move || match items.get(at) {
            Some(item) => Effect::succeed(Pull::Value(item.clone(), Self::from_slice(items.clone(), at + 1))),
            None => Effect::succeed(Pull::End),
        })
    }

    /// A single-element stream whose element is produced by running the
    /// effect built by `factory`. A failure becomes [`Pull::Error`].
    pub fn from_effect<F>(factory: F) -> Self
    where
        F: Fn() -> Effect<R, E, A> + 'static,
    {
        Self::new(move || {
            factory().fold(
                |e| Effect::succeed(Pull::Error(e)),
                |a| Effect::succeed(Pull::Value(a, Self::empty())),
            )
        })
    }

    /// Unfold a stream from a seed. `step` yields the next element and
    /// state, or `None` to end the stream.
    pub fn unfold<S, F>(seed: S, step: F) -> Self
    where
        S: Clone + 'static,
        F: Fn(S) -> Effect<R, E, Option<(A, S)>> + 'static,
    {
        Self::unfold_rc(seed, Rc::new(step))
    }

    fn unfold_rc<S>(seed: S, step: Rc<dyn Fn(S) -> Effect<R, E, Option<(A, S)>>>) -> Self
    where
        S: Clone + 'static,
    {
        Self::new(move || {
            let step = step.clone();
            step(seed.clone()).fold(
                |e| Effect::succeed(Pull::Error(e)),
                move |next| match next {
                    Some((a, state)) => Effect::succeed(Pull::Value(a, Self::unfold_rc(state, step))),
                    None => Effect::succeed(Pull::End),
                },
            )
        })
    }

    /// Drain `queue`. The stream ends once the queue is shut down and empty.
    pub fn from_queue(queue: Queue<A>) -> Self {
        Self::new(move || {
            let rest = queue.clone();
            queue.take().fold(
                |_closed| Effect::succeed(Pull::End),
                move |a| Effect::succeed(Pull::Value(a, Self::from_queue(rest))),
            )
        })
    }

    /// Transform every element.
    pub fn map<B, F>(self, f: F) -> Stream<R, E, B>
    where
        B: 'static,
        F: Fn(A) -> B + 'static,
    {
        map_rc(self, Rc::new(f))
    }

    /// Keep at most the first `n` elements. A zero-length take never pulls.
    pub fn take(self, n: usize) -> Self {
        if n == 0 {
            return Self::empty();
        }
        Self::new(move || {
            self.pull().map(move |pull| match pull {
                Pull::Value(a, rest) => Pull::Value(a, rest.take(n - 1)),
                other => other,
            })
        })
    }

    /// All elements of `self`, then all elements of `other`.
    pub fn concat(self, other: Self) -> Self {
        Self::new(move || {
            let other = other.clone();
            self.pull().flat_map(move |pull| match pull {
                Pull::Value(a, rest) => Effect::succeed(Pull::Value(a, rest.concat(other))),
                Pull::End => other.pull(),
                Pull::Error(e) => Effect::succeed(Pull::Error(e)),
            })
        })
    }

    /// Interleave two streams by racing their pulls inside `scope`.
    ///
    /// Each round the side that did not emit last is raced first. When a
    /// value arrives the other pull is interrupted and issued again next
    /// round. When one side ends the merge continues with the other alone.
    /// An error from either side ends the merge with that error.
    pub fn merge(self, other: Self, scope: &Scope<R>) -> Self {
        let scope = scope.clone();
        Self::new(move || {
            let (first, second) = (self.clone(), other.clone());
            let (left_scope, right_scope) = (scope.clone(), scope.clone());
            race_with(
                first.pull(),
                second.pull(),
                &scope,
                move |exit, loser, _| settle_round(exit, loser, second, left_scope),
                move |exit, loser, _| settle_round(exit, loser, first, right_scope),
            )
        })
    }

    /// Pull every element and collect them in order.
    pub fn run_collect(self) -> Effect<R, E, Vec<A>> {
        collect_into(self, Vec::new())
    }

    /// Pull every element and run `f` on each, in order. Stops at the first
    /// failure.
    pub fn run_for_each<F>(self, f: F) -> Effect<R, E, ()>
    where
        F: Fn(A) -> Effect<R, E, ()> + 'static,
    {
        for_each_rc(self, Rc::new(f))
    }
}

/// Resolve one merge round. `other` is the stream whose in-flight pull
/// lost; it goes first next round.
fn settle_round<R, E, A>(
    exit: Exit<Infallible, Pull<R, E, A>>,
    loser: Fiber<Infallible, Pull<R, E, A>>,
    other: Stream<R, E, A>,
    scope: Scope<R>,
) -> Effect<R, Infallible, Pull<R, E, A>>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    match exit {
        Exit::Success(Pull::Value(a, rest)) => {
            loser.interrupt();
            Effect::succeed(Pull::Value(a, other.merge(rest, &scope)))
        }
        Exit::Success(Pull::End) => loser.join_effect(),
        Exit::Success(Pull::Error(e)) => {
            loser.interrupt();
            Effect::succeed(Pull::Error(e))
        }
        Exit::Failure(cause) => {
            loser.interrupt();
            Effect::fail_cause(cause)
        }
    }
}

fn map_rc<R, E, A, B>(stream: Stream<R, E, A>, f: Rc<dyn Fn(A) -> B>) -> Stream<R, E, B>
where
    R: 'static,
    E: 'static,
    A: 'static,
    B: 'static,
{
    Stream::new(move || {
        let f = f.clone();
        stream.pull().map(move |pull| match pull {
            Pull::Value(a, rest) => Pull::Value(f(a), map_rc(rest, f.clone())),
            Pull::End => Pull::End,
            Pull::Error(e) => Pull::Error(e),
        })
    })
}

fn collect_into<R, E, A>(stream: Stream<R, E, A>, mut acc: Vec<A>) -> Effect<R, E, Vec<A>>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    stream.pull().widen_error().flat_map(move |pull| match pull {
        Pull::Value(a, rest) => {
            acc.push(a);
            collect_into(rest, acc)
        }
        Pull::End => Effect::succeed(acc),
        Pull::Error(e) => Effect::fail(e),
    })
}

fn for_each_rc<R, E, A>(stream: Stream<R, E, A>, f: Rc<dyn Fn(A) -> Effect<R, E, ()>>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    stream.pull().widen_error().flat_map(move |pull| match pull {
        Pull::Value(a, rest) => f(a).flat_map(move |_| for_each_rc(rest, f)),
        Pull::End => Effect::unit(),
        Pull::Error(e) => Effect::fail(e),
    })
}
