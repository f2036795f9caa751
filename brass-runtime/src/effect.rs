//! The effect algebra.
//!
//! An [`Effect<R, E, A>`] is a lazy description of a computation that reads
//! an environment `R`, may fail with `E`, and otherwise produces an `A`.
//! Building an effect runs nothing. A fiber interprets it.
//!
//! Six primitive instructions exist: succeed, fail, run a function, register
//! an async callback, sequence and fold. Every combinator in this module is
//! defined in terms of them.
//!
//! Effects are consumed when they run. An effect built from closures that
//! perform side effects performs them again each time a new copy of the
//! description is built and run; nothing is memoized.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::cause::{Cause, Exit};
use crate::completion::{Canceler, Completion, Token};

/// Type-erased value flowing through the interpreter.
pub(crate) type AnyValue = Box<dyn Any>;

/// Continuation from an erased value to the next instruction.
pub(crate) type Cont<R> = Box<dyn FnOnce(AnyValue) -> Instr<R>>;

/// Async registration, erased.
pub(crate) type Register<R> = Box<dyn FnOnce(&R, Rc<Token>) -> Option<Canceler>>;

/// Untyped instruction set interpreted by the fiber.
pub(crate) enum Instr<R> {
    Succeed(AnyValue),
    Fail(Cause<AnyValue>),
    RunFn(Box<dyn FnOnce(&R) -> Result<AnyValue, AnyValue>>),
    Async {
        label: Option<&'static str>,
        register: Register<R>,
    },
    Sequence(Box<Instr<R>>, Cont<R>),
    Fold(Box<Instr<R>>, Cont<R>, Cont<R>),
}

impl<R> Instr<R> {
    /// Produced when an erased value does not have the type the typed layer
    /// promised. Unreachable through the public API.
    pub(crate) fn type_mismatch(expected: &'static str) -> Self {
        Instr::Fail(Cause::die(format!(
            "effect value type mismatch: expected {}",
            expected
        )))
    }

    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Instr::Succeed(_) => "Succeed",
            Instr::Fail(_) => "Fail",
            Instr::RunFn(_) => "RunFn",
            Instr::Async { .. } => "Async",
            Instr::Sequence(..) => "Sequence",
            Instr::Fold(..) => "Fold",
        }
    }
}

fn mismatch<R, T: 'static>() -> Instr<R> {
    Instr::type_mismatch(std::any::type_name::<T>())
}

/// A lazy, composable description of a computation.
///
/// `R` is the read-only environment, `E` the typed failure and `A` the
/// success value.
#[must_use = "effects do nothing unless forked or run"]
pub struct Effect<R, E, A> {
    instr: Instr<R>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect").field("op", &self.instr.tag()).finish()
    }
}

impl<R: 'static, E: 'static, A: 'static> Effect<R, E, A> {
    pub(crate) fn from_instr(instr: Instr<R>) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_instr(self) -> Instr<R> {
        self.instr
    }

    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_instr(Instr::Succeed(Box::new(value)))
    }

    /// An effect that fails with the typed error `error`.
    pub fn fail(error: E) -> Self {
        Self::from_instr(Instr::Fail(Cause::Fail(Box::new(error))))
    }

    /// An effect that fails with an arbitrary cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instr(Instr::Fail(cause.map(|e| Box::new(e) as AnyValue)))
    }

    /// An effect that dies with a defect.
    pub fn die(message: impl Into<String>) -> Self {
        Self::from_instr(Instr::Fail(Cause::die(message)))
    }

    /// An effect that terminates the running fiber as interrupted.
    pub fn interrupt() -> Self {
        Self::from_instr(Instr::Fail(Cause::Interrupt))
    }

    /// Lift a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// Lift an `Exit`, re-raising its cause.
    pub fn from_exit(exit: Exit<E, A>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(c) => Self::fail_cause(c),
        }
    }

    /// Run an infallible function of the environment.
    ///
    /// A panic inside `f` becomes a defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(&R) -> A + 'static,
    {
        Self::from_instr(Instr::RunFn(Box::new(move |env| {
            Ok(Box::new(f(env)) as AnyValue)
        })))
    }

    /// Run a fallible function of the environment. `Err` takes the typed
    /// failure path; a panic becomes a defect.
    pub fn attempt<F>(f: F) -> Self
    where
        F: FnOnce(&R) -> Result<A, E> + 'static,
    {
        Self::from_instr(Instr::RunFn(Box::new(move |env| match f(env) {
            Ok(a) => Ok(Box::new(a) as AnyValue),
            Err(e) => Err(Box::new(e) as AnyValue),
        })))
    }

    /// Defer construction of an effect until it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Effect<R, E, A> + 'static,
    {
        Self::from_instr(Instr::Sequence(
            Box::new(Instr::Succeed(Box::new(()))),
            Box::new(move |_| f().instr),
        ))
    }

    /// Bridge a callback-style operation into an effect.
    ///
    /// `register` receives the environment and a single-shot
    /// [`Completion`]. It may complete synchronously, or keep the token and
    /// complete later. The returned [`Canceler`], if any, runs when the
    /// waiting fiber is interrupted while the operation is still
    /// outstanding.
    pub fn register_async<F>(register: F) -> Self
    where
        F: FnOnce(&R, Completion<E, A>) -> Option<Canceler> + 'static,
    {
        Self::async_inner(None, register)
    }

    /// Like [`Effect::register_async`], with a label reported in suspend
    /// events ("sleep", "queue.take", ...).
    pub fn register_async_labeled<F>(label: &'static str, register: F) -> Self
    where
        F: FnOnce(&R, Completion<E, A>) -> Option<Canceler> + 'static,
    {
        Self::async_inner(Some(label), register)
    }

    fn async_inner<F>(label: Option<&'static str>, register: F) -> Self
    where
        F: FnOnce(&R, Completion<E, A>) -> Option<Canceler> + 'static,
    {
        Self::from_instr(Instr::Async {
            label,
            register: Box::new(move |env, token| register(env, Completion::new(token))),
        })
    }

    /// Sequence: run `self`, then feed its value to `k`.
    pub fn flat_map<B, F>(self, k: F) -> Effect<R, E, B>
    where
        B: 'static,
        F: FnOnce(A) -> Effect<R, E, B> + 'static,
    {
        Effect::from_instr(Instr::Sequence(
            Box::new(self.instr),
            Box::new(move |value| match value.downcast::<A>() {
                Ok(a) => k(*a).instr,
                Err(_) => mismatch::<R, A>(),
            }),
        ))
    }

    /// Fold: handle a typed failure with `on_failure` and a value with
    /// `on_success`. Interruption and defects pass through untouched.
    pub fn fold<E2, B, F, S>(self, on_failure: F, on_success: S) -> Effect<R, E2, B>
    where
        E2: 'static,
        B: 'static,
        F: FnOnce(E) -> Effect<R, E2, B> + 'static,
        S: FnOnce(A) -> Effect<R, E2, B> + 'static,
    {
        Effect::from_instr(Instr::Fold(
            Box::new(self.instr),
            Box::new(move |error| match error.downcast::<E>() {
                Ok(e) => on_failure(*e).instr,
                Err(_) => mismatch::<R, E>(),
            }),
            Box::new(move |value| match value.downcast::<A>() {
                Ok(a) => on_success(*a).instr,
                Err(_) => mismatch::<R, A>(),
            }),
        ))
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<R, E, B>
    where
        B: 'static,
        F: FnOnce(A) -> B + 'static,
    {
        self.flat_map(move |a| Effect::succeed(f(a)))
    }

    /// Transform the typed failure.
    pub fn map_error<E2, F>(self, f: F) -> Effect<R, E2, A>
    where
        E2: 'static,
        F: FnOnce(E) -> E2 + 'static,
    {
        self.fold(move |e| Effect::fail(f(e)), Effect::succeed)
    }

    /// Recover from any typed failure.
    pub fn catch_all<E2, F>(self, handler: F) -> Effect<R, E2, A>
    where
        E2: 'static,
        F: FnOnce(E) -> Effect<R, E2, A> + 'static,
    {
        self.fold(handler, Effect::succeed)
    }

    /// Fall back to `that` on typed failure.
    pub fn or_else<E2: 'static>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that)
    }

    /// Run `self` then `that`, pairing the results.
    pub fn zip<B: 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.flat_map(move |a| that.map(move |b| (a, b)))
    }

    /// Run `self` then `that`, keeping the second result.
    pub fn zip_right<B: 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, B> {
        self.flat_map(move |_| that)
    }

    /// Run `self` then `that`, keeping the first result.
    pub fn zip_left<B: 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, A> {
        self.flat_map(move |a| that.map(move |_| a))
    }

    /// Observe the success value without changing it.
    pub fn tap<F>(self, f: F) -> Self
    where
        F: FnOnce(&A) + 'static,
    {
        self.map(move |a| {
            f(&a);
            a
        })
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<R, E, ()> {
        self.map(|_| ())
    }

    /// Move the typed failure into the success channel.
    pub fn either(self) -> Effect<R, Infallible, Result<A, E>> {
        self.fold(
            |e| Effect::succeed(Err(e)),
            |a| Effect::succeed(Ok(a)),
        )
    }

    /// Discard both the value and any typed failure.
    pub fn ignore(self) -> Effect<R, Infallible, ()> {
        self.fold(|_| Effect::unit(), |_| Effect::unit())
    }
}

impl<R: 'static, E: 'static> Effect<R, E, ()> {
    /// The effect that succeeds with `()`.
    pub fn unit() -> Self {
        Self::succeed(())
    }
}

impl<R: 'static, A: 'static> Effect<R, Infallible, A> {
    /// Reinterpret an effect that cannot fail as one failing with any `E`.
    pub fn widen_error<E: 'static>(self) -> Effect<R, E, A> {
        self.map_error(|never| match never {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Eff<A> = Effect<(), String, A>;

    #[test]
    fn test_construction_is_lazy() {
        let ran = Rc::new(std::cell::Cell::new(false));
        let flag = ran.clone();
        let effect: Eff<()> = Effect::sync(move |_| flag.set(true));
        assert_eq!(effect.instr.tag(), "RunFn");
        assert!(!ran.get());
    }

    #[test]
    fn test_constructor_tags() {
        assert_eq!(Eff::succeed(1).instr.tag(), "Succeed");
        assert_eq!(Eff::<i32>::fail("x".into()).instr.tag(), "Fail");
        assert_eq!(Eff::succeed(1).map(|n| n + 1).instr.tag(), "Sequence");
        assert_eq!(Eff::succeed(1).catch_all(|_| Eff::succeed(0)).instr.tag(), "Fold");
        let registered: Eff<u8> = Effect::register_async(|_, _| None);
        assert_eq!(registered.instr.tag(), "Async");
    }

    #[test]
    fn test_type_mismatch_is_a_defect() {
        match mismatch::<(), String>() {
            Instr::Fail(Cause::Die(d)) => {
                assert!(d.message().contains("type mismatch"));
                assert!(d.message().contains("String"));
            }
            other => panic!("expected a defect, got {}", other.tag()),
        }
    }

    #[test]
    fn test_catch_all_skips_defects() {
        let rt = crate::runtime::Runtime::new(());
        let caught = rt
            .block_on(Eff::<i32>::fail("e".into()).catch_all(|e| Eff::succeed(e.len() as i32)))
            .unwrap();
        assert_eq!(caught, Exit::Success(1));

        let died = rt
            .block_on(Eff::<i32>::die("boom").catch_all(|_| Eff::succeed(0)))
            .unwrap();
        assert!(matches!(died.cause(), Some(c) if c.is_die()));
    }

    #[test]
    fn test_derived_combinators() {
        let rt = crate::runtime::Runtime::new(());
        let either = rt.block_on(Eff::<u8>::fail("no".into()).either()).unwrap();
        assert_eq!(either, Exit::Success(Err("no".to_string())));

        let mapped = Effect::<(), u8, u8>::from_result(Err(4)).map_error(|n| n * 2);
        assert_eq!(rt.block_on(mapped).unwrap(), Exit::fail(8));

        let fallback = Eff::<u8>::fail("x".into()).or_else(Effect::<(), u8, u8>::succeed(9));
        assert_eq!(rt.block_on(fallback).unwrap(), Exit::Success(9));

        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let pair = Eff::sync(move |_| a.borrow_mut().push("left"))
            .as_unit()
            .zip_left(Eff::sync(move |_| b.borrow_mut().push("right")));
        assert!(rt.block_on(pair).unwrap().is_success());
        assert_eq!(*order.borrow(), vec!["left", "right"]);
    }

    #[test]
    fn test_debug_shows_opcode() {
        let effect = Eff::succeed(3).flat_map(|n| Eff::succeed(n * 2));
        assert_eq!(format!("{:?}", effect), "Effect { op: \"Sequence\" }");
    }
}
