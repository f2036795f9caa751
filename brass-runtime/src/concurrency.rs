//! Structured concurrency combinators.
//!
//! Each combinator opens a fresh sub-scope of the caller's scope, forks its
//! operands into it and closes it before reporting back. Losers and
//! leftovers are therefore always interrupted and awaited, and interrupting
//! the caller closes the sub-scope with an interrupt.
//!
//! | Combinator | Resolves with |
//! |------------|---------------|
//! | [`race`] | the exit of whichever side finishes first |
//! | [`zip_par`] | both values, or the first failure |
//! | [`collect_all_par`] | all values in input order, or the first failure |
//! | [`race_with`] | whatever the winner's handler produces |
//! | [`timeout`] | `Some(value)`, or `None` when time ran out |

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::cause::{Cause, Exit, ScopeExit};
use crate::completion::{Canceler, Completion};
use crate::effect::Effect;
use crate::fiber::Fiber;
use crate::panic::catch_panic;
use crate::scope::Scope;

/// Canceler that closes `sub` with an interrupt.
fn close_on_cancel<R: 'static>(sub: Scope<R>) -> Option<Canceler> {
    Some(Box::new(move || sub.close(ScopeExit::interrupt())))
}

/// Run `left` and `right` concurrently; adopt the exit of the first to
/// finish. The loser is interrupted before the race reports.
pub fn race<R, E, A>(left: Effect<R, E, A>, right: Effect<R, E, A>, scope: &Scope<R>) -> Effect<R, E, A>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    let parent = scope.clone();
    Effect::register_async_labeled("race", move |_, done| {
        let sub = match parent.sub_scope() {
            Ok(sub) => sub,
            Err(err) => {
                done.die(err.to_string());
                return None;
            }
        };
        let settled = Rc::new(Cell::new(false));

        for effect in [left, right] {
            let fiber = match sub.fork(effect) {
                Ok(fiber) => fiber,
                Err(err) => {
                    if !settled.replace(true) {
                        done.die(err.to_string());
                    }
                    break;
                }
            };
            let (sub, done, settled) = (sub.clone(), done.clone(), settled.clone());
            fiber.into_exit(move |exit| {
                if settled.replace(true) {
                    return;
                }
                sub.close_with(exit.to_scope_exit(), move || {
                    done.complete(exit);
                });
            });
        }

        close_on_cancel(sub)
    })
}

struct ZipState<A, B> {
    left: Option<A>,
    right: Option<B>,
    settled: bool,
}

/// Run both effects concurrently and pair their values. The first failure
/// wins: the other side is interrupted and the pair fails with that cause.
pub fn zip_par<R, E, A, B>(
    left: Effect<R, E, A>,
    right: Effect<R, E, B>,
    scope: &Scope<R>,
) -> Effect<R, E, (A, B)>
where
    R: 'static,
    E: 'static,
    A: 'static,
    B: 'static,
{
    let parent = scope.clone();
    Effect::register_async_labeled("zip_par", move |_, done: Completion<E, (A, B)>| {
        let sub = match parent.sub_scope() {
            Ok(sub) => sub,
            Err(err) => {
                done.die(err.to_string());
                return None;
            }
        };
        let state = Rc::new(RefCell::new(ZipState {
            left: None,
            right: None,
            settled: false,
        }));

        let (left_fiber, right_fiber) = match (sub.fork(left), sub.fork(right)) {
            (Ok(l), Ok(r)) => (l, r),
            (l, r) => {
                // Only reachable if the sub-scope closed under us.
                drop((l, r));
                done.die("zip_par: sub-scope closed before both sides started");
                return close_on_cancel(sub);
            }
        };

        {
            let (sub, done, state) = (sub.clone(), done.clone(), state.clone());
            left_fiber.into_exit(move |exit| match exit {
                Exit::Success(a) => {
                    state.borrow_mut().left = Some(a);
                    finish_zip(&sub, &done, &state);
                }
                Exit::Failure(cause) => fail_zip(&sub, &done, &state, cause),
            });
        }
        {
            let (sub, done, state) = (sub.clone(), done.clone(), state.clone());
            right_fiber.into_exit(move |exit| match exit {
                Exit::Success(b) => {
                    state.borrow_mut().right = Some(b);
                    finish_zip(&sub, &done, &state);
                }
                Exit::Failure(cause) => fail_zip(&sub, &done, &state, cause),
            });
        }

        close_on_cancel(sub)
    })
}

fn finish_zip<R, E, A, B>(sub: &Scope<R>, done: &Completion<E, (A, B)>, state: &Rc<RefCell<ZipState<A, B>>>)
where
    R: 'static,
    E: 'static,
    A: 'static,
    B: 'static,
{
    let pair = {
        let mut st = state.borrow_mut();
        if st.settled || st.left.is_none() || st.right.is_none() {
            return;
        }
        st.settled = true;
        st.left.take().zip(st.right.take())
    };
    let Some(pair) = pair else { return };
    let done = done.clone();
    sub.close_with(ScopeExit::succeed(()), move || {
        done.succeed(pair);
    });
}

fn fail_zip<R, E, A, B>(
    sub: &Scope<R>,
    done: &Completion<E, (A, B)>,
    state: &Rc<RefCell<ZipState<A, B>>>,
    cause: Cause<E>,
) where
    R: 'static,
    E: 'static,
    A: 'static,
    B: 'static,
{
    if std::mem::replace(&mut state.borrow_mut().settled, true) {
        return;
    }
    let done = done.clone();
    sub.close_with(Exit::Failure(cause.to_unit()), move || {
        done.fail_cause(cause);
    });
}

struct CollectState<A> {
    results: Vec<Option<A>>,
    remaining: usize,
    settled: bool,
}

/// Run every effect concurrently and collect the values in input order.
/// The first failure interrupts all the others. An empty input succeeds
/// with an empty vector.
pub fn collect_all_par<R, E, A>(effects: Vec<Effect<R, E, A>>, scope: &Scope<R>) -> Effect<R, E, Vec<A>>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    if effects.is_empty() {
        return Effect::succeed(Vec::new());
    }
    let parent = scope.clone();
    Effect::register_async_labeled("collect_all_par", move |_, done: Completion<E, Vec<A>>| {
        let sub = match parent.sub_scope() {
            Ok(sub) => sub,
            Err(err) => {
                done.die(err.to_string());
                return None;
            }
        };
        let count = effects.len();
        let state = Rc::new(RefCell::new(CollectState {
            results: (0..count).map(|_| None).collect(),
            remaining: count,
            settled: false,
        }));

        for (index, effect) in effects.into_iter().enumerate() {
            let fiber = match sub.fork(effect) {
                Ok(fiber) => fiber,
                Err(err) => {
                    if !std::mem::replace(&mut state.borrow_mut().settled, true) {
                        done.die(err.to_string());
                    }
                    break;
                }
            };
            let (sub, done, state) = (sub.clone(), done.clone(), state.clone());
            fiber.into_exit(move |exit| match exit {
                Exit::Success(value) => {
                    let collected = {
                        let mut st = state.borrow_mut();
                        if st.settled {
                            return;
                        }
                        st.results[index] = Some(value);
                        st.remaining -= 1;
                        if st.remaining > 0 {
                            return;
                        }
                        st.settled = true;
                        std::mem::take(&mut st.results)
                    };
                    let values: Option<Vec<A>> = collected.into_iter().collect();
                    sub.close_with(ScopeExit::succeed(()), move || match values {
                        Some(values) => {
                            done.succeed(values);
                        }
                        None => {
                            done.die("collect_all_par: a result went missing");
                        }
                    });
                }
                Exit::Failure(cause) => {
                    if std::mem::replace(&mut state.borrow_mut().settled, true) {
                        return;
                    }
                    sub.close_with(Exit::Failure(cause.to_unit()), move || {
                        done.fail_cause(cause);
                    });
                }
            });
        }

        close_on_cancel(sub)
    })
}

type LeftHandler<R, E, A, B, C> = Box<dyn FnOnce(Exit<E, A>, Fiber<E, B>, Scope<R>) -> Effect<R, E, C>>;
type RightHandler<R, E, A, B, C> = Box<dyn FnOnce(Exit<E, B>, Fiber<E, A>, Scope<R>) -> Effect<R, E, C>>;

struct RaceWithState<R, E, A, B, C> {
    left: Option<Fiber<E, A>>,
    right: Option<Fiber<E, B>>,
    handlers: Option<(LeftHandler<R, E, A, B, C>, RightHandler<R, E, A, B, C>)>,
}

/// Race two effects and hand the outcome to a handler instead of adopting
/// it.
///
/// When `left` finishes first, `on_left` receives its exit, the still
/// running right fiber and the race's sub-scope; `on_right` is the mirror.
/// The handler decides what happens to the loser: interrupt it, join it,
/// or leave it to be interrupted when the sub-scope closes after the
/// handler's effect completes.
pub fn race_with<R, E, A, B, C, L, Rh>(
    left: Effect<R, E, A>,
    right: Effect<R, E, B>,
    scope: &Scope<R>,
    on_left: L,
    on_right: Rh,
) -> Effect<R, E, C>
where
    R: 'static,
    E: 'static,
    A: 'static,
    B: 'static,
    C: 'static,
    L: FnOnce(Exit<E, A>, Fiber<E, B>, Scope<R>) -> Effect<R, E, C> + 'static,
    Rh: FnOnce(Exit<E, B>, Fiber<E, A>, Scope<R>) -> Effect<R, E, C> + 'static,
{
    let parent = scope.clone();
    Effect::register_async_labeled("race_with", move |_, done: Completion<E, C>| {
        let sub = match parent.sub_scope() {
            Ok(sub) => sub,
            Err(err) => {
                done.die(err.to_string());
                return None;
            }
        };
        let (left_fiber, right_fiber) = match (sub.fork(left), sub.fork(right)) {
            (Ok(l), Ok(r)) => (l, r),
            (l, r) => {
                drop((l, r));
                done.die("race_with: sub-scope closed before both sides started");
                return close_on_cancel(sub);
            }
        };
        let left_control = left_fiber.control();
        let right_control = right_fiber.control();
        let state = Rc::new(RefCell::new(RaceWithState {
            left: Some(left_fiber),
            right: Some(right_fiber),
            handlers: Some((
                Box::new(on_left) as LeftHandler<R, E, A, B, C>,
                Box::new(on_right) as RightHandler<R, E, A, B, C>,
            )),
        }));

        {
            let (sub, done, state) = (sub.clone(), done.clone(), state.clone());
            left_control.on_done(Box::new(move || {
                let decided = {
                    let mut st = state.borrow_mut();
                    match (st.handlers.take(), st.left.take(), st.right.take()) {
                        (Some((on_left, _)), Some(winner), Some(loser)) => Some((on_left, winner, loser)),
                        _ => None,
                    }
                };
                let Some((on_left, winner, loser)) = decided else { return };
                let handler_sub = sub.clone();
                winner.into_exit(move |exit| {
                    let effect = run_handler(|| on_left(exit, loser, handler_sub.clone()));
                    adopt(&handler_sub, &done, effect);
                });
            }));
        }
        {
            let (sub, done, state) = (sub.clone(), done.clone(), state.clone());
            right_control.on_done(Box::new(move || {
                let decided = {
                    let mut st = state.borrow_mut();
                    match (st.handlers.take(), st.right.take(), st.left.take()) {
                        (Some((_, on_right)), Some(winner), Some(loser)) => Some((on_right, winner, loser)),
                        _ => None,
                    }
                };
                let Some((on_right, winner, loser)) = decided else { return };
                let handler_sub = sub.clone();
                winner.into_exit(move |exit| {
                    let effect = run_handler(|| on_right(exit, loser, handler_sub.clone()));
                    adopt(&handler_sub, &done, effect);
                });
            }));
        }

        close_on_cancel(sub)
    })
}

fn run_handler<R, E, C, F>(handler: F) -> Effect<R, E, C>
where
    R: 'static,
    E: 'static,
    C: 'static,
    F: FnOnce() -> Effect<R, E, C>,
{
    match catch_panic(handler) {
        Ok(effect) => effect,
        Err(defect) => Effect::fail_cause(Cause::Die(defect)),
    }
}

/// Run the handler's effect inside `sub`, then close `sub` and report.
fn adopt<R, E, C>(sub: &Scope<R>, done: &Completion<E, C>, effect: Effect<R, E, C>)
where
    R: 'static,
    E: 'static,
    C: 'static,
{
    match sub.fork(effect) {
        Ok(fiber) => {
            let (sub, done) = (sub.clone(), done.clone());
            fiber.into_exit(move |exit| {
                sub.close_with(exit.to_scope_exit(), move || {
                    done.complete(exit);
                });
            });
        }
        Err(err) => {
            done.die(err.to_string());
        }
    }
}

/// Run `effect` with a time limit: `Some(value)` if it finishes in time,
/// `None` if `duration` elapses first (and the effect is interrupted).
pub fn timeout<R, E, A>(effect: Effect<R, E, A>, duration: Duration, scope: &Scope<R>) -> Effect<R, E, Option<A>>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    let timer = scope.runtime().sleep::<E>(duration).map(|_| None);
    race(effect.map(Some), timer, scope)
}

/// Acquire a resource inside `scope` and register `release` as a scope
/// finalizer. The release action receives the resource and the scope's
/// close exit. If the scope is already closing, the resource is released
/// at once and the effect dies.
pub fn acquire_release<R, E, A, F>(acquire: Effect<R, E, A>, release: F, scope: &Scope<R>) -> Effect<R, E, A>
where
    R: 'static,
    E: 'static,
    A: Clone + 'static,
    F: FnOnce(A, &ScopeExit) -> Effect<R, std::convert::Infallible, ()> + 'static,
{
    let scope = scope.clone();
    acquire.flat_map(move |resource| {
        let release = Rc::new(RefCell::new(Some(release)));
        let held = resource.clone();
        let slot = release.clone();
        let registered = scope.add_finalizer(move |exit: &ScopeExit| {
            let release = slot.borrow_mut().take();
            match release {
                Some(release) => release(held, exit),
                None => Effect::unit(),
            }
        });
        match registered {
            Ok(()) => Effect::succeed(resource),
            Err(err) => {
                let release = release.borrow_mut().take();
                let released = match release {
                    Some(release) => release(resource, &ScopeExit::interrupt()),
                    None => Effect::unit(),
                };
                released
                    .widen_error()
                    .zip_right(Effect::die(format!("acquire_release: {}", err)))
            }
        }
    })
}
