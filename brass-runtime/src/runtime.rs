//! # Runtime Facade
//!
//! A [`Runtime`] bundles an environment value with the machinery every fiber
//! shares: the scheduler, the timer driver, lifecycle hooks, the fork policy
//! and the configuration. It is cheap to clone and never mutated after
//! construction; all mutable state lives in fibers and scopes.
//!
//! ```text
//! ┌──────────────────────────── Runtime<R> ───────────────────────────┐
//! │  env: Rc<R>                                                        │
//! │  ┌───────────┐  ┌────────────┐  ┌─────────┐  ┌──────────────────┐ │
//! │  │ Scheduler │  │   Driver   │  │  Hooks  │  │ ForkPolicy/Config│ │
//! │  │  (FIFO)   │  │timers+bridge│ │ (emit)  │  │                  │ │
//! │  └───────────┘  └────────────┘  └─────────┘  └──────────────────┘ │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use brass_runtime::{Effect, Runtime};
//!
//! let rt = Runtime::new(());
//! let exit = rt.block_on(Effect::<(), String, i32>::succeed(42))?;
//! assert_eq!(exit.value(), Some(&42));
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::cause::{Cause, Exit, ScopeExit};
use crate::config::{LogLevel, RuntimeConfig};
use crate::driver::Driver;
use crate::effect::Effect;
use crate::error::RuntimeError;
use crate::events::{EmitContext, NoopHooks, RuntimeEvent, RuntimeHooks};
use crate::fiber::{self, Fiber, FiberId};
use crate::fork_policy::{FiberMeta, ForkPolicy};
use crate::observability::TracingHooks;
use crate::panic::catch_panic;
use crate::scheduler::Scheduler;
use crate::scope::{Scope, ScopeId};

/// State shared by every runtime derived from the same builder.
struct Shared {
    scheduler: Scheduler,
    driver: Driver,
    hooks: Rc<dyn RuntimeHooks>,
    policy: ForkPolicy,
    config: RuntimeConfig,
    next_fiber: Cell<u64>,
    next_scope: Cell<u64>,
}

/// Entry point for running effects.
pub struct Runtime<R> {
    env: Rc<R>,
    shared: Rc<Shared>,
}

impl<R> Clone for Runtime<R> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<R> fmt::Debug for Runtime<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.shared.scheduler)
            .field("driver", &self.shared.driver)
            .field("policy", &self.shared.policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder<R> {
    env: R,
    config: RuntimeConfig,
    hooks: Option<Rc<dyn RuntimeHooks>>,
    policy: Option<ForkPolicy>,
}

impl<R: 'static> RuntimeBuilder<R> {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install lifecycle hooks.
    pub fn hooks(mut self, hooks: impl RuntimeHooks + 'static) -> Self {
        self.hooks = Some(Rc::new(hooks));
        self
    }

    /// Install shared lifecycle hooks.
    pub fn shared_hooks(mut self, hooks: Rc<dyn RuntimeHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Use a custom fork policy.
    pub fn policy(mut self, policy: ForkPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Runtime<R> {
        let log = self.config.log.clone();
        let hooks = self.hooks.unwrap_or_else(|| -> Rc<dyn RuntimeHooks> {
            if log.lifecycle_events {
                Rc::new(TracingHooks::from_config(&log))
            } else {
                Rc::new(NoopHooks)
            }
        });
        Runtime {
            env: Rc::new(self.env),
            shared: Rc::new(Shared {
                scheduler: Scheduler::new(),
                driver: Driver::new(self.config.clock.mode),
                hooks,
                policy: self.policy.unwrap_or_default(),
                config: self.config,
                next_fiber: Cell::new(1),
                next_scope: Cell::new(1),
            }),
        }
    }
}

impl<R: 'static> Runtime<R> {
    /// A runtime with default configuration and no hooks.
    pub fn new(env: R) -> Self {
        Self::builder(env).build()
    }

    /// Start configuring a runtime.
    pub fn builder(env: R) -> RuntimeBuilder<R> {
        RuntimeBuilder {
            env,
            config: RuntimeConfig::default(),
            hooks: None,
            policy: None,
        }
    }

    /// The environment.
    pub fn env(&self) -> &R {
        &self.env
    }

    pub(crate) fn env_rc(&self) -> Rc<R> {
        self.env.clone()
    }

    /// The configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// A runtime with a different environment, sharing the scheduler,
    /// timers, hooks and id counters of this one.
    pub fn provide<R2: 'static>(&self, env: R2) -> Runtime<R2> {
        Runtime {
            env: Rc::new(env),
            shared: self.shared.clone(),
        }
    }

    /// The current time of the runtime's clock.
    pub fn now(&self) -> Instant {
        self.shared.driver.now()
    }

    /// Id of the fiber whose step is running.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.shared.scheduler.current_fiber()
    }

    // ------------------------------------------------------------------------
    // Forking
    // ------------------------------------------------------------------------

    /// Fork `effect` as a new root fiber and queue its first step.
    pub fn fork<E: 'static, A: 'static>(&self, effect: Effect<R, E, A>) -> Fiber<E, A> {
        self.fork_with(effect, None, None)
    }

    /// Fork with a diagnostic name.
    pub fn fork_named<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        name: impl Into<String>,
    ) -> Fiber<E, A> {
        self.fork_with(effect, None, Some(name.into()))
    }

    /// Fork a fiber tagged with `scope` for correlation. Ownership and
    /// cleanup go through [`Scope::fork`]; this only labels the fiber.
    pub fn fork_in<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        scope: Option<ScopeId>,
    ) -> Fiber<E, A> {
        self.fork_with(effect, scope, None)
    }

    fn fork_with<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        scope: Option<ScopeId>,
        name: Option<String>,
    ) -> Fiber<E, A> {
        let fiber = self.spawn(effect, scope, name);
        fiber.control().start();
        fiber
    }

    /// Create a fiber without starting it.
    pub(crate) fn spawn<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        scope: Option<ScopeId>,
        name: Option<String>,
    ) -> Fiber<E, A> {
        let id = FiberId::new(self.shared.next_fiber.get());
        self.shared.next_fiber.set(id.as_u64() + 1);
        let parent = self.shared.scheduler.current();
        let meta: FiberMeta = self.shared.policy.init_child(parent.as_ref(), scope, name);
        fiber::create(self, id, meta, effect)
    }

    /// Fork as an effect: yields the child's handle.
    pub fn fork_effect<E, E2, A>(&self, effect: Effect<R, E, A>) -> Effect<R, E2, Fiber<E, A>>
    where
        E: 'static,
        E2: 'static,
        A: 'static,
    {
        let rt = self.clone();
        Effect::sync(move |_| rt.fork(effect))
    }

    /// Fork `effect` and hand its exit to `callback`.
    pub fn run_callback<E, A, F>(&self, effect: Effect<R, E, A>, callback: F)
    where
        E: 'static,
        A: 'static,
        F: FnOnce(Exit<E, A>) + 'static,
    {
        self.fork(effect).into_exit(callback);
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Run `effect` to completion on this thread, driving the scheduler,
    /// timers and blocking tasks.
    ///
    /// Fails with [`RuntimeError::Reentrant`] when called from inside a
    /// step, and with [`RuntimeError::Stalled`] when the fiber is waiting on
    /// something that can never complete.
    pub fn block_on<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
    ) -> Result<Exit<E, A>, RuntimeError> {
        if self.shared.scheduler.is_flushing() {
            return Err(RuntimeError::Reentrant);
        }

        let slot: Rc<RefCell<Option<Exit<E, A>>>> = Rc::new(RefCell::new(None));
        let fiber = self.fork(effect);
        let id = fiber.id();
        let out = slot.clone();
        fiber.into_exit(move |exit| *out.borrow_mut() = Some(exit));

        loop {
            self.shared.scheduler.flush();
            self.flush_hooks();

            let exit = slot.borrow_mut().take();
            if let Some(exit) = exit {
                return Ok(exit);
            }

            if self.poll_driver() > 0 || self.shared.scheduler.pending() > 0 {
                continue;
            }
            if !self.shared.driver.park() {
                return Err(RuntimeError::Stalled { fiber: id });
            }
        }
    }

    /// Drive the runtime until no step is queued, no timer is armed and no
    /// blocking task is in flight.
    pub fn run_until_idle(&self) -> Result<(), RuntimeError> {
        if self.shared.scheduler.is_flushing() {
            return Err(RuntimeError::Reentrant);
        }
        loop {
            self.shared.scheduler.flush();
            self.flush_hooks();
            if self.poll_driver() > 0 || self.shared.scheduler.pending() > 0 {
                continue;
            }
            if !self.shared.driver.park() {
                return Ok(());
            }
        }
    }

    fn poll_driver(&self) -> usize {
        self.shared.driver.fire_due() + self.shared.driver.poll_remote()
    }

    fn flush_hooks(&self) {
        if let Err(defect) = catch_panic(|| self.shared.hooks.flush()) {
            warn!(error = %defect, "runtime hooks panicked while flushing");
        }
    }

    // ------------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------------

    pub(crate) fn next_scope_id(&self) -> ScopeId {
        let id = self.shared.next_scope.get();
        self.shared.next_scope.set(id + 1);
        ScopeId::new(id)
    }

    /// Open a new root scope.
    pub fn scope(&self) -> Scope<R> {
        Scope::open(self, None)
    }

    /// Open a scope, run `f(scope)` as its child, close the scope with the
    /// child's exit and then yield that exit. Interrupting the caller closes
    /// the scope with an interrupt.
    pub fn with_scope<E, A, F>(&self, f: F) -> Effect<R, E, A>
    where
        E: 'static,
        A: 'static,
        F: FnOnce(&Scope<R>) -> Effect<R, E, A> + 'static,
    {
        let rt = self.clone();
        Effect::register_async_labeled("scope.use", move |_, done| {
            let scope = rt.scope();
            let effect = match catch_panic(|| f(&scope)) {
                Ok(effect) => effect,
                Err(defect) => Effect::fail_cause(Cause::Die(defect)),
            };
            let fiber = match scope.fork(effect) {
                Ok(fiber) => fiber,
                Err(err) => {
                    done.die(err.to_string());
                    return None;
                }
            };
            let closing = scope.clone();
            fiber.into_exit(move |exit| {
                let scope_exit = exit.to_scope_exit();
                closing.close_with(scope_exit, move || {
                    done.complete(exit);
                });
            });
            Some(Box::new(move || scope.close(ScopeExit::interrupt())))
        })
    }

    // ------------------------------------------------------------------------
    // Time and blocking work
    // ------------------------------------------------------------------------

    /// Suspend for `duration`. Interrupting the sleeper disarms the timer.
    pub fn sleep<E: 'static>(&self, duration: Duration) -> Effect<R, E, ()> {
        let rt = self.clone();
        Effect::register_async_labeled("sleep", move |_, done| {
            let timer = rt.shared.driver.add_timer(
                duration,
                Box::new(move || {
                    done.succeed(());
                }),
            );
            Some(Box::new(move || rt.shared.driver.cancel_timer(timer)))
        })
    }

    /// An effect that never completes on its own; only interruption ends it.
    pub fn never<E: 'static, A: 'static>(&self) -> Effect<R, E, A> {
        Effect::register_async_labeled("never", |_, _| None)
    }

    /// Sleep for `duration`, then run `effect`.
    pub fn delay<E: 'static, A: 'static>(
        &self,
        duration: Duration,
        effect: Effect<R, E, A>,
    ) -> Effect<R, E, A> {
        self.sleep(duration).zip_right(effect)
    }

    /// Run `work` on a helper thread; the fiber suspends until it returns.
    /// A panic in `work` becomes a defect. Interrupting the fiber discards
    /// the result when it arrives.
    pub fn spawn_blocking<E, T, F>(&self, work: F) -> Effect<R, E, T>
    where
        E: 'static,
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let rt = self.clone();
        Effect::register_async_labeled("blocking", move |_, done| {
            let task = rt.shared.driver.spawn_blocking(work, move |result| {
                match result {
                    Ok(value) => done.succeed(value),
                    Err(defect) => done.fail_cause(Cause::Die(defect)),
                };
            });
            Some(Box::new(move || rt.shared.driver.cancel_remote(task)))
        })
    }

    /// Race `effect` against the configured default timeout. Without one,
    /// the effect runs unbounded and its value is wrapped in `Some`.
    pub fn with_default_timeout<E: 'static, A: 'static>(
        &self,
        effect: Effect<R, E, A>,
        scope: &Scope<R>,
    ) -> Effect<R, E, Option<A>> {
        match self.shared.config.timeout.default_timeout {
            Some(limit) => crate::concurrency::timeout(effect, limit, scope),
            None => effect.map(Some),
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Deliver `event` to the hooks. A panicking hook is logged and ignored.
    pub(crate) fn emit(&self, event: &RuntimeEvent, ctx: &EmitContext) {
        if let Err(defect) = catch_panic(|| self.shared.hooks.emit(event, ctx)) {
            warn!(event = event.name(), error = %defect, "runtime hook panicked");
        }
    }

    /// Emit with the correlation context of the running fiber, if any.
    pub(crate) fn emit_current(&self, event: RuntimeEvent) {
        let ctx = match self.shared.scheduler.current() {
            Some(current) => EmitContext {
                fiber_id: Some(current.id),
                scope_id: current.meta.scope,
                trace_id: Some(current.meta.trace.trace_id),
                span_id: Some(current.meta.trace.span_id),
            },
            None => EmitContext::default(),
        };
        self.emit(&event, &ctx);
    }

    /// Emit a `log` event carrying the running fiber's correlation ids.
    /// Messages below the configured level are dropped.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_with(level, message, std::iter::empty::<(String, String)>());
    }

    /// Like [`Runtime::log`], with structured fields.
    pub fn log_with<I, K, V>(&self, level: LogLevel, message: impl Into<String>, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: fmt::Display,
    {
        if !self.shared.config.log.level.allows(level) {
            return;
        }
        self.emit_current(RuntimeEvent::Log {
            level,
            message: message.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClockMode;
    use crate::fiber::FiberStatus;

    type Eff<A> = Effect<(), String, A>;

    fn virtual_runtime() -> Runtime<()> {
        let config = RuntimeConfig::builder()
            .clock(ClockMode::Virtual)
            .build()
            .unwrap();
        Runtime::builder(()).config(config).build()
    }

    #[test]
    fn test_block_on_succeed() {
        let rt = Runtime::new(());
        assert_eq!(rt.block_on(Eff::succeed(42)).unwrap(), Exit::Success(42));
    }

    #[test]
    fn test_env_is_threaded_to_thunks() {
        let rt = Runtime::new(String::from("env"));
        let effect: Effect<String, (), usize> = Effect::sync(|env: &String| env.len());
        assert_eq!(rt.block_on(effect).unwrap(), Exit::Success(3));
    }

    #[test]
    fn test_provide_shares_scheduler() {
        let rt = Runtime::new(1u8);
        let other = rt.provide("two");
        assert_eq!(*other.env(), "two");
        let a = rt.fork(Effect::<u8, (), u8>::succeed(1));
        let b = other.fork(Effect::<&str, (), u8>::succeed(2));
        assert_eq!(b.id().as_u64(), a.id().as_u64() + 1);
    }

    #[test]
    fn test_sleep_with_virtual_clock() {
        let rt = virtual_runtime();
        let start = rt.now();
        let exit = rt
            .block_on(rt.delay(Duration::from_secs(60), Eff::succeed("late")))
            .unwrap();
        assert_eq!(exit, Exit::Success("late"));
        assert!(rt.now() - start >= Duration::from_secs(60));
    }

    #[test]
    fn test_block_on_reports_stall() {
        let rt = Runtime::new(());
        let err = rt.block_on(rt.never::<String, ()>()).unwrap_err();
        assert!(matches!(err, RuntimeError::Stalled { .. }));
    }

    #[test]
    fn test_block_on_is_not_reentrant() {
        let rt = Runtime::new(());
        let inner = rt.clone();
        let exit = rt
            .block_on(Effect::<(), String, bool>::sync(move |_| {
                matches!(inner.block_on(Eff::succeed(1)), Err(RuntimeError::Reentrant))
            }))
            .unwrap();
        assert_eq!(exit, Exit::Success(true));
    }

    #[test]
    fn test_spawn_blocking() {
        let rt = Runtime::new(());
        let exit = rt
            .block_on(rt.spawn_blocking::<String, _, _>(|| (1..=10u32).sum::<u32>()))
            .unwrap();
        assert_eq!(exit, Exit::Success(55));
    }

    #[test]
    fn test_fork_effect_and_current_fiber() {
        let rt = Runtime::new(());
        let probe = rt.clone();
        let exit = rt
            .block_on(
                rt.fork_effect::<String, String, _>(Effect::sync(move |_| probe.current_fiber()))
                    .flat_map(|fiber| fiber.join_effect()),
            )
            .unwrap();
        assert!(matches!(exit, Exit::Success(Some(_))));
        assert!(rt.current_fiber().is_none());
    }

    #[test]
    fn test_with_scope_closes_after_use() {
        let rt = virtual_runtime();
        let closed = Rc::new(Cell::new(false));
        let c = closed.clone();
        let exit = rt
            .block_on(rt.with_scope(move |scope| {
                scope
                    .add_finalizer(move |exit: &ScopeExit| {
                        assert!(exit.is_success());
                        c.set(true);
                        Effect::<(), (), ()>::unit()
                    })
                    .unwrap();
                Eff::succeed(9)
            }))
            .unwrap();
        assert_eq!(exit, Exit::Success(9));
        assert!(closed.get());
    }

    #[test]
    fn test_interrupting_sleep_disarms_timer() {
        let rt = virtual_runtime();
        let fiber = rt.fork(rt.sleep::<()>(Duration::from_secs(5)));
        assert_eq!(rt.shared.driver.armed_timers(), 1);
        fiber.interrupt();
        rt.run_until_idle().unwrap();
        assert_eq!(fiber.status(), FiberStatus::Interrupted);
        assert_eq!(rt.shared.driver.armed_timers(), 0);
    }

    #[test]
    fn test_run_callback() {
        let rt = Runtime::new(());
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        rt.run_callback(Eff::succeed(3), move |exit| *s.borrow_mut() = Some(exit));
        assert_eq!(*seen.borrow(), Some(Exit::Success(3)));
    }
}
