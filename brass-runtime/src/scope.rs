//! # Scopes
//!
//! A [`Scope`] owns a group of child fibers, nested sub-scopes and
//! finalizers, and releases all of them when it closes.
//!
//! Closing runs in a fixed order:
//!
//! 1. Freeze: mark the scope closing and snapshot its children, sub-scopes
//!    and finalizers. From here on `fork`, `sub_scope` and `add_finalizer`
//!    fail with [`ScopeError::Closed`].
//! 2. Interrupt every child that is still running.
//! 3. Close every sub-scope, one after another, with the same exit.
//! 4. Run this scope's finalizers LIFO. Each runs in its own fiber, so a
//!    failing or panicking finalizer never skips the ones after it.
//! 5. Optionally wait for the interrupted children to terminate.
//!
//! Only then is the scope closed and its waiters notified. A second close
//! is a no-op that waits for the first one.
//!
//! # Example
//!
//! ```rust,ignore
//! let scope = rt.scope();
//! let worker = scope.fork(rt.sleep(Duration::from_secs(60)))?;
//! scope.add_finalizer(|_exit| Effect::sync(|_| println!("released")))?;
//! scope.close(ScopeExit::succeed(()));
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::cause::{Exit, ExitKind, ScopeExit};
use crate::effect::Effect;
use crate::error::ScopeError;
use crate::events::RuntimeEvent;
use crate::fiber::{Fiber, FiberControl, FiberId, RunState};
use crate::panic::catch_panic;
use crate::runtime::Runtime;

/// Unique identifier for a scope within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Create a new scope ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self.0)
    }
}

/// Options for closing a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOptions {
    /// Wait for interrupted children to terminate before reporting closed.
    pub await_children: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            await_children: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

type ScopeFinalizer<R> = Box<dyn FnOnce(&ScopeExit) -> Effect<R, Infallible, ()>>;

struct State<R> {
    phase: Phase,
    children: BTreeMap<FiberId, Rc<dyn FiberControl>>,
    subs: BTreeMap<ScopeId, Scope<R>>,
    finalizers: Vec<ScopeFinalizer<R>>,
    waiters: Vec<Box<dyn FnOnce()>>,
}

struct Inner<R> {
    id: ScopeId,
    parent: Option<Weak<Inner<R>>>,
    parent_id: Option<ScopeId>,
    runtime: Runtime<R>,
    state: RefCell<State<R>>,
}

/// Lexical owner of child fibers, sub-scopes and finalizers.
///
/// Cloning yields another handle to the same scope.
pub struct Scope<R> {
    inner: Rc<Inner<R>>,
}

impl<R> Clone for Scope<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> fmt::Debug for Scope<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("children", &state.children.len())
            .field("subs", &state.subs.len())
            .field("finalizers", &state.finalizers.len())
            .finish()
    }
}

impl<R: 'static> Scope<R> {
    pub(crate) fn open(runtime: &Runtime<R>, parent: Option<&Scope<R>>) -> Self {
        let id = runtime.next_scope_id();
        let parent_id = parent.map(Scope::id);
        let scope = Self {
            inner: Rc::new(Inner {
                id,
                parent: parent.map(|p| Rc::downgrade(&p.inner)),
                parent_id,
                runtime: runtime.clone(),
                state: RefCell::new(State {
                    phase: Phase::Open,
                    children: BTreeMap::new(),
                    subs: BTreeMap::new(),
                    finalizers: Vec::new(),
                    waiters: Vec::new(),
                }),
            }),
        };
        debug!(scope = %id, parent = ?parent_id, "scope opened");
        runtime.emit_current(RuntimeEvent::ScopeOpen {
            scope: id,
            parent: parent_id,
        });
        scope
    }

    /// The scope's id.
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// The enclosing scope, for sub-scopes.
    pub fn parent(&self) -> Option<ScopeId> {
        self.inner.parent_id
    }

    /// The runtime this scope forks on.
    pub fn runtime(&self) -> &Runtime<R> {
        &self.inner.runtime
    }

    /// True until close begins.
    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().phase == Phase::Open
    }

    /// True once close has completed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().phase == Phase::Closed
    }

    /// Number of children that have not finished.
    pub fn child_count(&self) -> usize {
        self.inner.state.borrow().children.len()
    }

    /// Number of open sub-scopes.
    pub fn sub_scope_count(&self) -> usize {
        self.inner.state.borrow().subs.len()
    }

    fn closed_error(&self) -> ScopeError {
        ScopeError::Closed {
            scope: self.inner.id,
        }
    }

    /// Fork `effect` as a child of this scope. The child leaves the scope
    /// on its own when it finishes.
    pub fn fork<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
    ) -> Result<Fiber<E, A>, ScopeError> {
        self.fork_inner(effect, None)
    }

    /// Fork a named child.
    pub fn fork_named<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        name: impl Into<String>,
    ) -> Result<Fiber<E, A>, ScopeError> {
        self.fork_inner(effect, Some(name.into()))
    }

    fn fork_inner<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        name: Option<String>,
    ) -> Result<Fiber<E, A>, ScopeError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let fiber = self.inner.runtime.spawn(effect, Some(self.inner.id), name);
        let control = fiber.control();
        let id = control.id();
        self.inner
            .state
            .borrow_mut()
            .children
            .insert(id, control.clone());

        let weak = Rc::downgrade(&self.inner);
        control.on_done(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.state.borrow_mut().children.remove(&id);
                drop(removed);
            }
        }));
        control.start();
        Ok(fiber)
    }

    /// Open a nested scope. Closing this scope closes it first.
    pub fn sub_scope(&self) -> Result<Scope<R>, ScopeError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let sub = Scope::open(&self.inner.runtime, Some(self));
        self.inner
            .state
            .borrow_mut()
            .subs
            .insert(sub.id(), sub.clone());
        Ok(sub)
    }

    /// Register a finalizer to run when the scope closes, with the close
    /// exit. Finalizers run LIFO. Their failures are ignored.
    pub fn add_finalizer<E, F>(&self, finalizer: F) -> Result<(), ScopeError>
    where
        E: 'static,
        F: FnOnce(&ScopeExit) -> Effect<R, E, ()> + 'static,
    {
        let mut state = self.inner.state.borrow_mut();
        if state.phase != Phase::Open {
            return Err(self.closed_error());
        }
        state
            .finalizers
            .push(Box::new(move |exit| finalizer(exit).ignore()));
        Ok(())
    }

    /// Close with `exit` and forget about it.
    pub fn close(&self, exit: ScopeExit) {
        self.close_with(exit, || {});
    }

    /// Close with `exit` and call `on_closed` once the scope is closed.
    /// Uses the runtime's default close options.
    pub fn close_with<F>(&self, exit: ScopeExit, on_closed: F)
    where
        F: FnOnce() + 'static,
    {
        let options = CloseOptions {
            await_children: self.inner.runtime.config().scope.await_children,
        };
        self.close_with_options(exit, options, on_closed);
    }

    /// Close with explicit options.
    pub fn close_with_options<F>(&self, exit: ScopeExit, options: CloseOptions, on_closed: F)
    where
        F: FnOnce() + 'static,
    {
        let (children, subs, finalizers) = {
            let mut state = self.inner.state.borrow_mut();
            match state.phase {
                Phase::Closed => {
                    drop(state);
                    on_closed();
                    return;
                }
                Phase::Closing => {
                    state.waiters.push(Box::new(on_closed));
                    return;
                }
                Phase::Open => {
                    state.phase = Phase::Closing;
                    state.waiters.push(Box::new(on_closed));
                    let children: Vec<_> = std::mem::take(&mut state.children).into_values().collect();
                    let subs: Vec<_> = std::mem::take(&mut state.subs).into_values().collect();
                    let finalizers = std::mem::take(&mut state.finalizers);
                    (children, subs, finalizers)
                }
            }
        };

        debug!(
            scope = %self.inner.id,
            children = children.len(),
            subs = subs.len(),
            finalizers = finalizers.len(),
            "closing scope"
        );

        for child in &children {
            if let Err(defect) = catch_panic(|| child.interrupt()) {
                warn!(scope = %self.inner.id, fiber = %child.id(), error = %defect, "interrupting child panicked");
            }
        }

        let runtime = self.inner.runtime.clone();
        let mut program: Effect<R, Infallible, ()> = Effect::unit();

        for sub in subs {
            let exit = exit.clone();
            program = program.zip_right(Effect::suspend(move || {
                sub.close_async_with(exit, options)
            }));
        }

        for finalizer in finalizers.into_iter().rev() {
            let exit = exit.clone();
            let rt = runtime.clone();
            let id = self.inner.id;
            program = program.zip_right(Effect::suspend(move || {
                let isolated: Effect<R, Infallible, ()> = Effect::suspend(move || finalizer(&exit));
                rt.fork_in(isolated, Some(id))
                    .await_exit()
                    .map(move |outcome: Exit<Infallible, ()>| {
                        if let Some(cause) = outcome.cause() {
                            warn!(scope = %id, cause = %cause.describe(), "scope finalizer did not complete");
                        }
                    })
            }));
        }

        if options.await_children {
            program = program.zip_right(await_all(children));
        }

        let status = exit.kind();
        let this = self.clone();
        runtime
            .fork_in(program, Some(self.inner.id))
            .into_exit(move |_| this.finish(status));
    }

    fn finish(&self, status: ExitKind) {
        let waiters = {
            let mut state = self.inner.state.borrow_mut();
            state.phase = Phase::Closed;
            std::mem::take(&mut state.waiters)
        };
        debug!(scope = %self.inner.id, status = status.as_str(), "scope closed");
        self.inner.runtime.emit_current(RuntimeEvent::ScopeClose {
            scope: self.inner.id,
            status,
        });

        let parent = self.inner.parent.as_ref().and_then(Weak::upgrade);
        if let Some(parent) = parent {
            let removed = parent.state.borrow_mut().subs.remove(&self.inner.id);
            drop(removed);
        }

        for waiter in waiters {
            if let Err(defect) = catch_panic(waiter) {
                warn!(scope = %self.inner.id, error = %defect, "scope close callback panicked");
            }
        }
    }

    /// Close as an effect that completes once the scope is closed.
    pub fn close_async(&self, exit: ScopeExit) -> Effect<R, Infallible, ()> {
        let options = CloseOptions {
            await_children: self.inner.runtime.config().scope.await_children,
        };
        self.close_async_with(exit, options)
    }

    /// Close as an effect, with explicit options.
    pub fn close_async_with(&self, exit: ScopeExit, options: CloseOptions) -> Effect<R, Infallible, ()> {
        let this = self.clone();
        Effect::register_async_labeled("scope.close", move |_, done| {
            this.close_with_options(exit, options, move || {
                done.succeed(());
            });
            None
        })
    }
}

/// Completes once every fiber in `children` is done.
fn await_all<R: 'static>(children: Vec<Rc<dyn FiberControl>>) -> Effect<R, Infallible, ()> {
    Effect::register_async_labeled("scope.await_children", move |_, done| {
        let live: Vec<_> = children
            .into_iter()
            .filter(|c| c.run_state() != RunState::Done)
            .collect();
        if live.is_empty() {
            done.succeed(());
            return None;
        }
        let remaining = Rc::new(std::cell::Cell::new(live.len()));
        for child in live {
            let (remaining, done) = (remaining.clone(), done.clone());
            child.on_done(Box::new(move || {
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    done.succeed(());
                }
            }));
        }
        None
    })
}
