//! Integration tests for queues, streams, timers and the blocking bridge.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use brass_runtime::{
    collect_all_par, timeout, ClockMode, Effect, EventBus, Exit, Queue, QueueError, Runtime,
    RuntimeConfig, Strategy, Stream,
};

fn virtual_runtime() -> Runtime<()> {
    let config = RuntimeConfig::builder()
        .clock(ClockMode::Virtual)
        .build()
        .expect("valid config");
    Runtime::builder(()).config(config).build()
}

#[test]
fn producer_and_consumer_share_a_bounded_queue() {
    let rt = virtual_runtime();
    let q: Queue<u32> = Queue::bounded(2, Strategy::BackPressure);

    let producer = {
        let q = q.clone();
        let rt2 = rt.clone();
        (0..10u32).fold(Effect::<(), QueueError, ()>::unit(), move |acc, i| {
            let q = q.clone();
            let rt3 = rt2.clone();
            acc.zip_right(rt3.sleep(Duration::from_millis(1)))
                .zip_right(q.offer(i).as_unit())
        })
    };
    let consumer = Stream::<(), QueueError, u32>::from_queue(q.clone()).take(10).run_collect();

    let scope = rt.scope();
    let producer_fiber = scope.fork(producer).unwrap();
    let exit = rt.block_on(consumer).unwrap();
    assert_eq!(exit, Exit::Success((0..10).collect::<Vec<_>>()));
    rt.run_until_idle().unwrap();
    assert_eq!(producer_fiber.poll(), Some(Exit::Success(())));
}

#[test]
fn timeout_interrupts_a_stuck_consumer() {
    let rt = virtual_runtime();
    let scope = rt.scope();
    let q: Queue<u8> = Queue::unbounded();
    let exit = rt
        .block_on(timeout(q.take::<()>(), Duration::from_millis(30), &scope))
        .unwrap();
    assert_eq!(exit, Exit::Success(None));
    assert_eq!(q.waiting_takers(), 0);
}

#[test]
fn merged_streams_deliver_every_element() {
    let rt = virtual_runtime();
    let scope = rt.scope();
    let left = Stream::<(), String, u32>::from_iter(0..50);
    let right = Stream::from_iter(100..150);
    let exit = rt
        .block_on(left.merge(right, &scope).run_collect())
        .unwrap();
    let mut values = exit.value().cloned().unwrap_or_default();
    values.sort_unstable();
    let mut expected: Vec<u32> = (0..50).chain(100..150).collect();
    expected.sort_unstable();
    assert_eq!(values, expected);
    assert_eq!(scope.sub_scope_count(), 0);
}

#[test]
fn blocking_work_runs_off_the_loop() {
    let rt = Runtime::new(());
    let scope = rt.scope();
    let jobs: Vec<Effect<(), String, u64>> = (1..=4u64)
        .map(|n| {
            rt.spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(5));
                n * n
            })
        })
        .collect();
    let exit = rt.block_on(collect_all_par(jobs, &scope)).unwrap();
    assert_eq!(exit, Exit::Success(vec![1, 4, 9, 16]));
}

#[test]
fn blocking_panic_becomes_a_defect() {
    let rt = Runtime::new(());
    let exit = rt
        .block_on(rt.spawn_blocking::<String, u8, _>(|| panic!("worker")))
        .unwrap();
    assert!(matches!(exit.cause(), Some(c) if c.is_die()));
}

#[test]
fn event_bus_sees_sleep_suspensions() {
    let bus = Rc::new(EventBus::new(128));
    let reasons = Rc::new(RefCell::new(Vec::new()));
    let id = bus.subscribe_buffer(128);
    let rt = {
        let config = RuntimeConfig::builder()
            .clock(ClockMode::Virtual)
            .build()
            .expect("valid config");
        Runtime::builder(()).config(config).shared_hooks(bus.clone()).build()
    };
    rt.block_on(rt.sleep::<String>(Duration::from_millis(5))).unwrap();
    for record in bus.drain(id) {
        if let brass_runtime::RuntimeEvent::FiberSuspend { reason, .. } = record.event {
            reasons.borrow_mut().push(reason);
        }
    }
    assert_eq!(*reasons.borrow(), vec![Some("sleep")]);
}
