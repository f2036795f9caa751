//! One-shot completion tokens for asynchronous registrations.
//!
//! When a fiber reaches an `Async` opcode it hands the registration a
//! [`Completion`]. The token accepts exactly one outcome; the flag is
//! claimed with a compare-and-swap so later calls are rejected even if the
//! token was cloned and handed to several callbacks.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cause::{Cause, Exit};
use crate::effect::AnyValue;

/// Cancellation thunk returned by an async registration. It runs if the
/// waiting fiber is interrupted while the operation is still outstanding.
pub type Canceler = Box<dyn FnOnce()>;

/// Untyped outcome delivered to a suspended fiber.
pub(crate) type Outcome = Result<AnyValue, Cause<AnyValue>>;

/// Receiver side of a token: the suspended fiber.
pub(crate) trait Resumable {
    /// Deliver the outcome for the registration identified by `epoch`.
    fn resume(&self, epoch: u64, outcome: Outcome);
}

/// Shared state of a completion token.
pub(crate) struct Token {
    fired: AtomicBool,
    epoch: u64,
    target: RefCell<Option<Rc<dyn Resumable>>>,
}

impl Token {
    pub(crate) fn new(epoch: u64, target: Rc<dyn Resumable>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            epoch,
            target: RefCell::new(Some(target)),
        }
    }

    /// Claim the token and deliver. Returns false if it was already used.
    pub(crate) fn fire(&self, outcome: Outcome) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let target = self.target.borrow_mut().take();
        if let Some(target) = target {
            target.resume(self.epoch, outcome);
        }
        true
    }

    /// Mark the token used without delivering, releasing the fiber.
    pub(crate) fn disarm(&self) {
        self.fired.store(true, Ordering::Release);
        let target = self.target.borrow_mut().take();
        drop(target);
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Typed, single-shot completion callback for `Effect::register_async`.
///
/// Only the first completion is delivered; every later call returns `false`
/// and is ignored. Clones share the same token.
pub struct Completion<E, A> {
    token: Rc<Token>,
    _marker: PhantomData<fn(Exit<E, A>)>,
}

impl<E, A> Clone for Completion<E, A> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Completion<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.token.is_fired())
            .finish()
    }
}

impl<E: 'static, A: 'static> Completion<E, A> {
    pub(crate) fn new(token: Rc<Token>) -> Self {
        Self {
            token,
            _marker: PhantomData,
        }
    }

    /// Resume the fiber with a value.
    pub fn succeed(&self, value: A) -> bool {
        self.token.fire(Ok(Box::new(value)))
    }

    /// Resume the fiber with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.token.fire(Err(Cause::Fail(Box::new(error) as AnyValue)))
    }

    /// Resume the fiber with an arbitrary cause.
    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.token
            .fire(Err(cause.map(|e| Box::new(e) as AnyValue)))
    }

    /// Resume the fiber with a defect.
    pub fn die(&self, message: impl Into<String>) -> bool {
        self.token.fire(Err(Cause::die(message)))
    }

    /// Resume the fiber with a complete exit.
    pub fn complete(&self, exit: Exit<E, A>) -> bool {
        match exit {
            Exit::Success(a) => self.succeed(a),
            Exit::Failure(c) => self.fail_cause(c),
        }
    }

    /// Resume from a `Result`.
    pub fn complete_result(&self, result: Result<A, E>) -> bool {
        match result {
            Ok(a) => self.succeed(a),
            Err(e) => self.fail(e),
        }
    }

    /// True once an outcome was delivered, or the waiting fiber gave up.
    pub fn is_completed(&self) -> bool {
        self.token.is_fired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Recorder {
        hits: Cell<u32>,
        last_epoch: Cell<u64>,
    }

    impl Resumable for Recorder {
        fn resume(&self, epoch: u64, _outcome: Outcome) {
            self.hits.set(self.hits.get() + 1);
            self.last_epoch.set(epoch);
        }
    }

    fn recorder() -> Rc<Recorder> {
        Rc::new(Recorder {
            hits: Cell::new(0),
            last_epoch: Cell::new(0),
        })
    }

    #[test]
    fn test_completion_fires_once() {
        let rec = recorder();
        let token = Rc::new(Token::new(3, rec.clone()));
        let done: Completion<String, i32> = Completion::new(token);
        assert!(done.succeed(1));
        assert!(!done.succeed(2));
        assert!(!done.fail("late".into()));
        assert_eq!(rec.hits.get(), 1);
        assert_eq!(rec.last_epoch.get(), 3);
    }

    #[test]
    fn test_clones_share_the_token() {
        let rec = recorder();
        let done: Completion<(), ()> = Completion::new(Rc::new(Token::new(1, rec.clone())));
        let other = done.clone();
        assert!(other.succeed(()));
        assert!(done.is_completed());
        assert!(!done.succeed(()));
        assert_eq!(rec.hits.get(), 1);
    }

    #[test]
    fn test_disarmed_token_rejects() {
        let rec = recorder();
        let token = Rc::new(Token::new(1, rec.clone()));
        let done: Completion<(), u8> = Completion::new(token.clone());
        token.disarm();
        assert!(done.is_completed());
        assert!(!done.succeed(9));
        assert_eq!(rec.hits.get(), 0);
    }
}
