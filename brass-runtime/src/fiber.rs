//! # Fiber Implementation
//!
//! A fiber is a lightweight, cooperatively scheduled interpreter for one
//! effect program.
//!
//! ## Design
//!
//! - Trampoline evaluation: each scheduler step runs a loop over the current
//!   instruction with an explicit, heap-allocated continuation stack, so
//!   arbitrarily deep `flat_map` chains never grow the host stack.
//! - A step evaluates at most `opcode_budget` instructions, then re-queues
//!   itself behind every other runnable fiber.
//! - An `Async` instruction hands the registration a one-shot token and
//!   suspends. Firing the token re-queues the fiber.
//! - Interruption is a sticky flag checked at the start of every step and
//!   before every instruction. It wins against any result not yet committed.
//! - Termination happens exactly once: pending cancelers run, finalizers run
//!   LIFO, the exit is stored, and every joiner is notified.
//!
//! ## Run states
//!
//! ```text
//!  Queued ──► Running ──► Done
//!    ▲           │
//!    │           ▼
//!    └──────  Suspended
//! ```
//!
//! The interpreter works on type-erased values. [`Fiber<E, A>`] is the typed
//! handle; its exit cell restores the types when the fiber settles.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::cause::{Cause, Exit, ExitKind};
use crate::completion::{Canceler, Outcome, Resumable, Token};
use crate::continuation::{ContinuationStack, Frame};
use crate::effect::{AnyValue, Cont, Effect, Instr, Register};
use crate::events::{EmitContext, RuntimeEvent};
use crate::fork_policy::FiberMeta;
use crate::panic::catch_panic;
use crate::runtime::Runtime;

/// Unique identifier for a fiber within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// Create a new fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Where a fiber is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    /// Waiting in the scheduler queue.
    #[default]
    Queued,
    /// Its step is executing.
    Running,
    /// Waiting for an async registration to complete.
    Suspended,
    /// Terminated. Final.
    Done,
}

impl RunState {
    /// Lowercase name used in dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Suspended => "suspended",
            RunState::Done => "done",
        }
    }
}

/// Snapshot of a fiber's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    /// No exit yet.
    Running,
    /// Finished with a value, a typed failure or a defect.
    Done,
    /// Finished by interruption.
    Interrupted,
}

impl FiberStatus {
    fn of<E, A>(exit: &Exit<E, A>) -> Self {
        if exit.is_interrupted() {
            FiberStatus::Interrupted
        } else {
            FiberStatus::Done
        }
    }
}

/// Type-erased control surface shared by scopes, combinators and the
/// runtime.
pub(crate) trait FiberControl {
    fn id(&self) -> FiberId;
    fn interrupt(&self);
    fn run_state(&self) -> RunState;
    fn status(&self) -> FiberStatus;
    /// Run `f` once the fiber is done; immediately if it already is.
    fn on_done(&self, f: Box<dyn FnOnce()>);
    /// Queue the first step. Later calls do nothing.
    fn start(&self);
}

// ============================================================================
// EXIT CELL
// ============================================================================

/// Receives the erased result of an interpreter and owns everything that
/// depends on its type: finalizers and joiners.
pub(crate) trait ExitSink {
    /// Convert and store the result, running finalizers first. Returns the
    /// flavor and a rendered cause for the end event.
    fn settle(&self, fiber: FiberId, result: Outcome) -> (ExitKind, Option<String>);
    /// Notify every registered joiner.
    fn notify(&self, fiber: FiberId);
    fn status(&self) -> FiberStatus;
    fn on_done(&self, f: Box<dyn FnOnce()>);
}

type Finalizer<E, A> = Box<dyn FnOnce(&Exit<E, A>)>;

enum Joiner<E, A> {
    Ref(Box<dyn FnOnce(&Exit<E, A>)>),
    Owned(Box<dyn FnOnce(Exit<E, A>)>),
    Notify(Box<dyn FnOnce()>),
}

/// Typed, write-once exit slot of a fiber.
pub(crate) struct ExitCell<E, A> {
    exit: RefCell<Option<Rc<Exit<E, A>>>>,
    status: Cell<Option<FiberStatus>>,
    finalizers: RefCell<Vec<Finalizer<E, A>>>,
    joiners: RefCell<Vec<Joiner<E, A>>>,
}

impl<E: 'static, A: 'static> ExitCell<E, A> {
    pub(crate) fn new() -> Self {
        Self {
            exit: RefCell::new(None),
            status: Cell::new(None),
            finalizers: RefCell::new(Vec::new()),
            joiners: RefCell::new(Vec::new()),
        }
    }

    fn is_done(&self) -> bool {
        self.status.get().is_some()
    }

    fn add_finalizer(&self, f: Finalizer<E, A>) {
        if self.is_done() {
            let exit = self.exit.borrow().clone();
            if let Some(exit) = exit {
                f(&exit);
            }
            return;
        }
        self.finalizers.borrow_mut().push(f);
    }

    fn join(&self, f: Box<dyn FnOnce(&Exit<E, A>)>) {
        let exit = self.exit.borrow().clone();
        match exit {
            Some(exit) => f(&exit),
            None if self.is_done() => {
                f(&Exit::die("fiber exit was already taken by its owner"));
            }
            None => self.joiners.borrow_mut().push(Joiner::Ref(f)),
        }
    }

    fn take_exit(&self, f: Box<dyn FnOnce(Exit<E, A>)>) {
        if !self.is_done() {
            self.joiners.borrow_mut().push(Joiner::Owned(f));
            return;
        }
        let exit = self.exit.borrow_mut().take();
        match exit.map(Rc::try_unwrap) {
            Some(Ok(exit)) => f(exit),
            Some(Err(shared)) => {
                *self.exit.borrow_mut() = Some(shared);
                f(Exit::die("fiber exit is still borrowed by a joiner"));
            }
            None => f(Exit::die("fiber exit was already taken by its owner")),
        }
    }

    fn typed(result: Outcome) -> Exit<E, A> {
        match result {
            Ok(value) => match value.downcast::<A>() {
                Ok(a) => Exit::Success(*a),
                Err(_) => Exit::die(format!(
                    "fiber result type mismatch: expected {}",
                    std::any::type_name::<A>()
                )),
            },
            Err(Cause::Fail(error)) => match error.downcast::<E>() {
                Ok(e) => Exit::Failure(Cause::Fail(*e)),
                Err(_) => Exit::die(format!(
                    "fiber error type mismatch: expected {}",
                    std::any::type_name::<E>()
                )),
            },
            Err(Cause::Interrupt) => Exit::Failure(Cause::Interrupt),
            Err(Cause::Die(defect)) => Exit::Failure(Cause::Die(defect)),
        }
    }
}

impl<E: 'static, A: 'static> ExitSink for ExitCell<E, A> {
    fn settle(&self, fiber: FiberId, result: Outcome) -> (ExitKind, Option<String>) {
        let exit = Self::typed(result);

        // One at a time, so a finalizer may register another.
        loop {
            let next = self.finalizers.borrow_mut().pop();
            let Some(finalizer) = next else { break };
            if let Err(defect) = catch_panic(|| finalizer(&exit)) {
                warn!(fiber = %fiber, error = %defect, "fiber finalizer panicked");
            }
        }

        let kind = exit.kind();
        let error = exit.cause().map(Cause::describe);
        self.status.set(Some(FiberStatus::of(&exit)));
        *self.exit.borrow_mut() = Some(Rc::new(exit));
        (kind, error)
    }

    fn notify(&self, fiber: FiberId) {
        let joiners = mem::take(&mut *self.joiners.borrow_mut());
        let mut notify = Vec::new();
        let mut owned = Vec::new();

        let exit = self.exit.borrow().clone();
        if let Some(exit) = exit {
            for joiner in joiners {
                match joiner {
                    Joiner::Ref(f) => {
                        if let Err(defect) = catch_panic(|| f(&exit)) {
                            warn!(fiber = %fiber, error = %defect, "join callback panicked");
                        }
                    }
                    Joiner::Notify(f) => notify.push(f),
                    Joiner::Owned(f) => owned.push(f),
                }
            }
        }

        for f in notify {
            if let Err(defect) = catch_panic(f) {
                warn!(fiber = %fiber, error = %defect, "completion listener panicked");
            }
        }
        for f in owned {
            if let Err(defect) = catch_panic(|| self.take_exit(f)) {
                warn!(fiber = %fiber, error = %defect, "join callback panicked");
            }
        }
    }

    fn status(&self) -> FiberStatus {
        self.status.get().unwrap_or(FiberStatus::Running)
    }

    fn on_done(&self, f: Box<dyn FnOnce()>) {
        if self.is_done() {
            f();
        } else {
            self.joiners.borrow_mut().push(Joiner::Notify(f));
        }
    }
}

// ============================================================================
// INTERPRETER
// ============================================================================

struct PendingAsync {
    epoch: u64,
    token: Rc<Token>,
    canceler: Option<Canceler>,
}

enum AsyncStep<R> {
    /// Completed during registration, or the registration itself failed.
    Ready(Instr<R>),
    Suspended,
    Interrupted,
}

/// The interpreter state of one fiber.
pub(crate) struct FiberCore<R: 'static> {
    id: FiberId,
    meta: Rc<FiberMeta>,
    runtime: Runtime<R>,
    this: Weak<FiberCore<R>>,
    started: Cell<bool>,
    run_state: Cell<RunState>,
    interrupted: Cell<bool>,
    finishing: Cell<bool>,
    current: RefCell<Option<Instr<R>>>,
    stack: RefCell<ContinuationStack<R>>,
    resumed: RefCell<Option<Instr<R>>>,
    pending: RefCell<Option<PendingAsync>>,
    epoch: Cell<u64>,
    sink: Rc<dyn ExitSink>,
}

impl<R: 'static> FiberCore<R> {
    fn new(
        id: FiberId,
        meta: FiberMeta,
        runtime: Runtime<R>,
        program: Instr<R>,
        sink: Rc<dyn ExitSink>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id,
            meta: Rc::new(meta),
            runtime,
            this: this.clone(),
            started: Cell::new(false),
            run_state: Cell::new(RunState::Queued),
            interrupted: Cell::new(false),
            finishing: Cell::new(false),
            current: RefCell::new(Some(program)),
            stack: RefCell::new(ContinuationStack::default()),
            resumed: RefCell::new(None),
            pending: RefCell::new(None),
            epoch: Cell::new(0),
            sink,
        })
    }

    fn emit(&self, event: RuntimeEvent) {
        let ctx = EmitContext {
            fiber_id: Some(self.id),
            scope_id: self.meta.scope,
            trace_id: Some(self.meta.trace.trace_id),
            span_id: Some(self.meta.trace.span_id),
        };
        self.runtime.emit(&event, &ctx);
    }

    fn enqueue(&self, label: &'static str) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.run_state.set(RunState::Queued);
        self.runtime
            .scheduler()
            .schedule(label, move || this.run_step());
    }

    /// One scheduler turn: evaluate until done, suspended or out of budget.
    fn run_step(&self) {
        if self.run_state.get() == RunState::Done || self.finishing.get() {
            return;
        }
        self.run_state.set(RunState::Running);
        let _current = self.runtime.scheduler().enter(self.id, self.meta.clone());

        let mut stack = mem::take(&mut *self.stack.borrow_mut());
        if self.interrupted.get() {
            *self.stack.borrow_mut() = stack;
            self.finalize(Err(Cause::Interrupt));
            return;
        }

        let resumed = self.resumed.borrow_mut().take();
        let next = match resumed {
            Some(instr) => Some(instr),
            None => self.current.borrow_mut().take(),
        };
        let Some(mut instr) = next else {
            *self.stack.borrow_mut() = stack;
            self.finalize(Err(Cause::die("fiber stepped without a program")));
            return;
        };

        let env_rc = self.runtime.env_rc();
        let env: &R = &env_rc;
        let budget = self.runtime.config().scheduler.opcode_budget.max(1);
        let mut ops = 0usize;

        loop {
            if self.interrupted.get() {
                *self.stack.borrow_mut() = stack;
                self.finalize(Err(Cause::Interrupt));
                return;
            }
            if ops == budget {
                *self.current.borrow_mut() = Some(instr);
                *self.stack.borrow_mut() = stack;
                trace!(fiber = %self.id, "opcode budget exhausted, yielding");
                self.enqueue("fiber.yield");
                return;
            }
            ops += 1;

            instr = match instr {
                Instr::Succeed(value) => match stack.pop_success() {
                    Some(k) => apply(k, value),
                    None => {
                        *self.stack.borrow_mut() = stack;
                        self.finalize(Ok(value));
                        return;
                    }
                },
                Instr::Fail(Cause::Fail(error)) => match stack.unwind_to_handler() {
                    Some(handler) => apply(handler, error),
                    None => {
                        *self.stack.borrow_mut() = stack;
                        self.finalize(Err(Cause::Fail(error)));
                        return;
                    }
                },
                // Interrupt and Die bypass every fold.
                Instr::Fail(cause) => {
                    *self.stack.borrow_mut() = stack;
                    self.finalize(Err(cause));
                    return;
                }
                Instr::RunFn(thunk) => match catch_panic(|| thunk(env)) {
                    Ok(Ok(value)) => Instr::Succeed(value),
                    Ok(Err(error)) => Instr::Fail(Cause::Fail(error)),
                    Err(defect) => Instr::Fail(Cause::Die(defect)),
                },
                Instr::Sequence(first, k) => {
                    stack.push(Frame::Success(k));
                    *first
                }
                Instr::Fold(first, on_failure, on_success) => {
                    stack.push(Frame::fold(on_failure, on_success));
                    *first
                }
                Instr::Async { label, register } => match self.begin_async(env, label, register) {
                    AsyncStep::Ready(next) => next,
                    AsyncStep::Suspended => {
                        *self.stack.borrow_mut() = stack;
                        self.run_state.set(RunState::Suspended);
                        self.emit(RuntimeEvent::FiberSuspend {
                            fiber: self.id,
                            reason: label,
                        });
                        return;
                    }
                    AsyncStep::Interrupted => {
                        *self.stack.borrow_mut() = stack;
                        self.finalize(Err(Cause::Interrupt));
                        return;
                    }
                },
            };
        }
    }

    fn begin_async(&self, env: &R, label: Option<&'static str>, register: Register<R>) -> AsyncStep<R> {
        let Some(this) = self.this.upgrade() else {
            return AsyncStep::Ready(Instr::Fail(Cause::die("fiber released while running")));
        };
        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);
        let target: Rc<dyn Resumable> = this;
        let token = Rc::new(Token::new(epoch, target));
        *self.pending.borrow_mut() = Some(PendingAsync {
            epoch,
            token: token.clone(),
            canceler: None,
        });

        let registered = catch_panic(|| register(env, token));
        let canceler = match registered {
            Ok(canceler) => canceler,
            Err(defect) => {
                let pending = self.pending.borrow_mut().take();
                if let Some(pending) = pending {
                    pending.token.disarm();
                }
                let resumed = self.resumed.borrow_mut().take();
                drop(resumed);
                return AsyncStep::Ready(Instr::Fail(Cause::Die(defect)));
            }
        };

        let resumed = self.resumed.borrow_mut().take();
        if let Some(next) = resumed {
            // Completed synchronously; the canceler has nothing left to cancel.
            return AsyncStep::Ready(next);
        }

        if let Some(pending) = self.pending.borrow_mut().as_mut() {
            pending.canceler = canceler;
        }
        if self.interrupted.get() {
            return AsyncStep::Interrupted;
        }
        trace!(fiber = %self.id, label = label.unwrap_or("async"), epoch, "awaiting completion");
        AsyncStep::Suspended
    }

    /// Terminate exactly once with `result`.
    fn finalize(&self, result: Outcome) {
        if self.finishing.replace(true) {
            return;
        }

        let pending = self.pending.borrow_mut().take();
        if let Some(pending) = pending {
            pending.token.disarm();
            if let Some(cancel) = pending.canceler {
                if let Err(defect) = catch_panic(cancel) {
                    warn!(fiber = %self.id, error = %defect, "async canceler panicked");
                }
            }
        }
        let current = self.current.borrow_mut().take();
        drop(current);
        let resumed = self.resumed.borrow_mut().take();
        drop(resumed);
        let stack = mem::take(&mut *self.stack.borrow_mut());
        let depth = stack.high_water();
        drop(stack);

        let (status, error) = self.sink.settle(self.id, result);
        self.run_state.set(RunState::Done);
        trace!(fiber = %self.id, status = status.as_str(), max_depth = depth, "fiber done");
        self.emit(RuntimeEvent::FiberEnd {
            fiber: self.id,
            status,
            error,
        });
        self.sink.notify(self.id);
    }
}

fn apply<R>(k: Cont<R>, value: AnyValue) -> Instr<R> {
    match catch_panic(|| k(value)) {
        Ok(next) => next,
        Err(defect) => Instr::Fail(Cause::Die(defect)),
    }
}

impl<R: 'static> Resumable for FiberCore<R> {
    fn resume(&self, epoch: u64, outcome: Outcome) {
        if self.finishing.get() || self.run_state.get() == RunState::Done {
            return;
        }
        let pending = self.pending.borrow_mut().take();
        match pending {
            Some(p) if p.epoch == epoch => drop(p),
            Some(p) => {
                *self.pending.borrow_mut() = Some(p);
                return;
            }
            None => return,
        }

        let next = match outcome {
            Ok(value) => Instr::Succeed(value),
            Err(cause) => Instr::Fail(cause),
        };
        *self.resumed.borrow_mut() = Some(next);

        if self.run_state.get() == RunState::Suspended {
            self.emit(RuntimeEvent::FiberResume { fiber: self.id });
            self.enqueue("fiber.resume");
        }
    }
}

impl<R: 'static> FiberControl for FiberCore<R> {
    fn id(&self) -> FiberId {
        self.id
    }

    fn interrupt(&self) {
        if self.run_state.get() == RunState::Done || self.finishing.get() {
            return;
        }
        if self.interrupted.replace(true) {
            return;
        }
        trace!(fiber = %self.id, "interrupt requested");
        if self.run_state.get() == RunState::Suspended {
            // Retire the outstanding completion now so its source stops
            // treating this fiber as a live waiter. The canceler still runs
            // in finalize.
            if let Some(pending) = self.pending.borrow().as_ref() {
                pending.token.disarm();
            }
            self.enqueue("fiber.interrupt");
        }
    }

    fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    fn status(&self) -> FiberStatus {
        self.sink.status()
    }

    fn on_done(&self, f: Box<dyn FnOnce()>) {
        self.sink.on_done(f);
    }

    fn start(&self) {
        if self.started.replace(true) {
            return;
        }
        self.emit(RuntimeEvent::FiberStart {
            fiber: self.id,
            parent: self.meta.parent,
            scope: self.meta.scope,
            name: self.meta.name.clone(),
        });
        self.enqueue("fiber.start");
    }
}

// ============================================================================
// FIBER HANDLE
// ============================================================================

/// Typed handle to a running fiber.
///
/// The handle is not `Clone`: [`Fiber::into_exit`] and the effects built on
/// it take the exit by value. Any number of [`Fiber::join`] callbacks can be
/// registered through a shared reference.
pub struct Fiber<E, A> {
    id: FiberId,
    cell: Rc<ExitCell<E, A>>,
    control: Rc<dyn FiberControl>,
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("run_state", &self.control.run_state())
            .field("status", &self.control.status())
            .finish()
    }
}

/// Create a fiber for `effect` without starting it.
pub(crate) fn create<R, E, A>(
    runtime: &Runtime<R>,
    id: FiberId,
    meta: FiberMeta,
    effect: Effect<R, E, A>,
) -> Fiber<E, A>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    let cell = Rc::new(ExitCell::<E, A>::new());
    let sink: Rc<dyn ExitSink> = cell.clone();
    let core = FiberCore::new(id, meta, runtime.clone(), effect.into_instr(), sink);
    Fiber {
        id,
        cell,
        control: core,
    }
}

impl<E: 'static, A: 'static> Fiber<E, A> {
    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Snapshot of the outcome.
    pub fn status(&self) -> FiberStatus {
        self.cell.status()
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.control.run_state()
    }

    /// True once the fiber has an exit.
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Observe the exit. Runs immediately if the fiber is done, otherwise
    /// when it finishes. Every callback sees the same exit.
    pub fn join<F>(&self, f: F)
    where
        F: FnOnce(&Exit<E, A>) + 'static,
    {
        self.cell.join(Box::new(f));
    }

    /// Request cooperative interruption. Idempotent; takes effect at the
    /// fiber's next step boundary.
    pub fn interrupt(&self) {
        self.control.interrupt();
    }

    /// Register a finalizer. Finalizers run LIFO, exactly once, before any
    /// joiner is notified. On a finished fiber it runs immediately.
    pub fn add_finalizer<F>(&self, f: F)
    where
        F: FnOnce(&Exit<E, A>) + 'static,
    {
        self.cell.add_finalizer(Box::new(f));
    }

    /// Consume the handle and receive the exit by value.
    pub fn into_exit<F>(self, f: F)
    where
        F: FnOnce(Exit<E, A>) + 'static,
    {
        self.cell.take_exit(Box::new(f));
    }

    /// The exit, cloned, if the fiber is done.
    pub fn poll(&self) -> Option<Exit<E, A>>
    where
        E: Clone,
        A: Clone,
    {
        let exit = self.cell.exit.borrow().clone();
        exit.map(|exit| (*exit).clone())
    }

    /// An effect that waits for this fiber and yields its exit.
    pub fn await_exit<R: 'static>(self) -> Effect<R, Infallible, Exit<E, A>> {
        Effect::register_async_labeled("fiber.await", move |_, done| {
            self.into_exit(move |exit| {
                done.succeed(exit);
            });
            None
        })
    }

    /// An effect that waits for this fiber and adopts its exit: its value,
    /// its failure, or its interruption.
    pub fn join_effect<R: 'static>(self) -> Effect<R, E, A> {
        Effect::register_async_labeled("fiber.join", move |_, done| {
            self.into_exit(move |exit| {
                done.complete(exit);
            });
            None
        })
    }

    pub(crate) fn control(&self) -> Rc<dyn FiberControl> {
        self.control.clone()
    }
}
