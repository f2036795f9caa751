//! End-to-end scenarios for the runtime.
//!
//! Each test drives a complete program through `Runtime::block_on` and
//! checks the exits observed by joiners, finalizers and hooks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use brass_runtime::{
    acquire_release, race, zip_par, Cause, ClockMode, Effect, Exit, ExitKind, FiberStatus,
    Registry, Runtime, RuntimeConfig, ScopeExit,
};
use tracing_subscriber::EnvFilter;

type Eff<A> = Effect<(), String, A>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn virtual_runtime_with(registry: Option<Rc<Registry>>) -> Runtime<()> {
    init_tracing();
    let config = RuntimeConfig::builder()
        .clock(ClockMode::Virtual)
        .build()
        .expect("valid config");
    let builder = Runtime::builder(()).config(config);
    match registry {
        Some(registry) => builder.shared_hooks(registry).build(),
        None => builder.build(),
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn fork_and_join_success() {
    let rt = virtual_runtime_with(None);
    let fiber = rt.fork(Eff::succeed(42));
    let seen = Rc::new(RefCell::new(None));
    let s = seen.clone();
    fiber.join(move |exit| *s.borrow_mut() = Some(exit.clone()));
    rt.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), Some(Exit::Success(42)));
    assert_eq!(fiber.status(), FiberStatus::Done);
}

#[test]
fn panicking_thunk_fails_the_fiber() {
    let rt = virtual_runtime_with(None);
    let program: Eff<i32> = Eff::sync(|_| -> i32 { panic!("x") }).flat_map(Eff::succeed);
    let exit = rt.block_on(program).unwrap();
    assert!(exit.is_failure());
    match exit {
        Exit::Failure(Cause::Die(defect)) => assert_eq!(defect.message(), "x"),
        other => panic!("expected a defect, got {:?}", other),
    }
}

#[test]
fn race_resolves_fast_and_interrupts_slow() {
    let registry = Rc::new(Registry::new(64));
    let rt = virtual_runtime_with(Some(registry.clone()));
    let scope = rt.scope();
    let slow = rt.delay(ms(100), Eff::succeed("slow"));
    let fast = rt.delay(ms(10), Eff::succeed("fast"));

    let exit = rt.block_on(race(slow, fast, &scope)).unwrap();
    assert_eq!(exit, Exit::Success("fast"));

    let ends: Vec<_> = registry
        .finished_fibers()
        .into_iter()
        .filter_map(|f| f.end)
        .collect();
    assert!(ends.contains(&ExitKind::Interrupted));
    assert!(ends.contains(&ExitKind::Success));
}

#[test]
fn zip_par_failure_interrupts_the_other_side() {
    let registry = Rc::new(Registry::new(64));
    let rt = virtual_runtime_with(Some(registry.clone()));
    let scope = rt.scope();
    let ok = rt.delay(ms(10), Eff::succeed(1));

    let exit = rt
        .block_on(zip_par(ok, Eff::<()>::fail("boom".into()), &scope))
        .unwrap();
    assert_eq!(exit, Exit::fail("boom".to_string()));

    let ends: Vec<_> = registry
        .finished_fibers()
        .into_iter()
        .filter_map(|f| f.end)
        .collect();
    assert!(ends.contains(&ExitKind::Interrupted));
    assert!(ends.contains(&ExitKind::Failure));
}

#[test]
fn closing_a_scope_interrupts_children_then_runs_finalizers() {
    let rt = virtual_runtime_with(None);
    let scope = rt.scope();
    let log = Rc::new(RefCell::new(Vec::new()));

    let children: Vec<_> = (0..3)
        .map(|_| scope.fork(rt.delay(ms(10_000), Eff::succeed(()))).unwrap())
        .collect();
    for tag in ["f1", "f2"] {
        let l = log.clone();
        scope
            .add_finalizer(move |exit: &ScopeExit| {
                assert!(exit.is_success());
                l.borrow_mut().push(tag);
                Effect::<(), String, ()>::unit()
            })
            .unwrap();
    }

    let l = log.clone();
    let program = rt
        .sleep::<String>(ms(50))
        .zip_right(scope.close_async(ScopeExit::succeed(())).widen_error())
        .tap(move |_| l.borrow_mut().push("closed"));
    let exit = rt.block_on(program).unwrap();

    assert!(exit.is_success());
    assert_eq!(*log.borrow(), vec!["f2", "f1", "closed"]);
    for child in &children {
        assert_eq!(child.status(), FiberStatus::Interrupted);
    }
    assert!(scope.is_closed());
    assert!(scope.fork(Eff::succeed(())).is_err());
}

#[test]
fn release_runs_once_when_the_owner_is_interrupted() {
    let rt = virtual_runtime_with(None);
    let releases = Rc::new(Cell::new(0));
    let flavor = Rc::new(Cell::new(None));

    let (r, f, inner) = (releases.clone(), flavor.clone(), rt.clone());
    let program: Eff<()> = rt.with_scope(move |scope| {
        acquire_release(
            Eff::succeed("connection"),
            move |_, exit| {
                r.set(r.get() + 1);
                f.set(Some(exit.kind()));
                Effect::unit()
            },
            scope,
        )
        .zip_right(inner.never())
    });

    let owner = rt.fork(program);
    rt.block_on(rt.sleep::<String>(ms(20))).unwrap();
    assert_eq!(releases.get(), 0);

    owner.interrupt();
    rt.run_until_idle().unwrap();
    assert_eq!(owner.status(), FiberStatus::Interrupted);
    assert_eq!(releases.get(), 1);
    assert_eq!(flavor.get(), Some(ExitKind::Interrupted));
}

#[test]
fn join_fan_out_sees_one_exit_and_one_finalizer_run() {
    let rt = virtual_runtime_with(None);
    let fiber = rt.fork(rt.delay(ms(5), Eff::succeed(7)));
    let finalized = Rc::new(Cell::new(0));
    let seen = Rc::new(RefCell::new(Vec::new()));

    let f = finalized.clone();
    fiber.add_finalizer(move |_| f.set(f.get() + 1));
    for _ in 0..3 {
        let s = seen.clone();
        fiber.join(move |exit| s.borrow_mut().push(exit.clone()));
    }
    rt.run_until_idle().unwrap();
    for _ in 0..2 {
        let s = seen.clone();
        fiber.join(move |exit| s.borrow_mut().push(exit.clone()));
    }

    assert_eq!(finalized.get(), 1);
    assert_eq!(*seen.borrow(), vec![Exit::Success(7); 5]);
}

#[test]
fn interrupt_before_start_wins() {
    let rt = virtual_runtime_with(None);
    let ran = Rc::new(Cell::new(false));
    let r = ran.clone();
    let outer = rt.fork(rt.with_scope(move |inner| {
        let child = inner
            .fork(Eff::sync(move |_| r.set(true)))
            .expect("open scope");
        child.interrupt();
        child.join_effect()
    }));
    rt.run_until_idle().unwrap();
    assert!(!ran.get());
    assert_eq!(outer.poll(), Some(Exit::interrupt()));
}

#[test]
fn logs_reach_the_registry_with_fiber_context() {
    let registry = Rc::new(Registry::new(32));
    let rt = virtual_runtime_with(Some(registry.clone()));
    let logger = rt.clone();
    let program: Eff<()> = Eff::sync(move |_| {
        logger.log_with(brass_runtime::LogLevel::Info, "charging", [("amount", 12)]);
    });
    rt.block_on(program).unwrap();
    let lines = registry.recent_events();
    assert!(lines
        .iter()
        .any(|l| l.contains("Fiber(") && l.contains("log[info] charging amount=12")));
}
