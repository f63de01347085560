// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scope behaviour: draining, cancellation, failure policy, ordering and
//! the default context.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use corral_rt::{
    apply, default_context, first, int_channel, launch, launch_in, receive,
    reset_default_context, select, send, set_default_context, string_channel, supply, try_apply,
    ChannelId, ConfigKey, Context, Coroutine, CoroutineError, ExceptionHandler, RunState,
    CHANNEL_CAPACITY, EXCEPTION_HANDLER, FAIL_FAST, WORKER_THREADS,
};
use parking_lot::Mutex;

const A: ChannelId<String> = string_channel("A");
const B: ChannelId<String> = string_channel("B");
const C: ChannelId<String> = string_channel("C");
const NUMBERS: ChannelId<i64> = int_channel("numbers");

fn select_abc() -> Coroutine<(), String> {
    first(select(receive(&A)).or(receive(&B)).or(receive(&C)))
}

fn context() -> Arc<Context> {
    let ctx = Context::with_defaults();
    ctx.set(WORKER_THREADS, 4);
    ctx
}

/// Context whose exception handler records every failure.
fn recording_context() -> (Arc<Context>, Arc<Mutex<Vec<CoroutineError>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: ExceptionHandler = Arc::new(move |e: &CoroutineError| sink.lock().push(e.clone()));
    let ctx = context();
    ctx.set(EXCEPTION_HANDLER, handler);
    (ctx, seen)
}

fn checked_double() -> Coroutine<i64, i64> {
    first(try_apply(|x: i64| {
        if x < 0 {
            Err(format!("negative input {}", x))
        } else {
            Ok(x * 2)
        }
    }))
}

#[test]
fn launch_waits_for_every_run() {
    let conts = launch_in(&context(), |scope| {
        let conts: Vec<_> = (0..3).map(|_| scope.run_async(&select_abc(), ())).collect();
        let channel = scope.get_channel(&B);
        thread::spawn(move || {
            for i in 0..3 {
                thread::sleep(Duration::from_millis(5));
                channel.send_blocking(format!("late-{}", i)).unwrap();
            }
        });
        conts
    })
    .unwrap();

    for cont in &conts {
        assert_eq!(cont.state(), RunState::Finished);
        assert!(cont.get_result().unwrap().starts_with("late-"));
    }
}

#[test]
fn scope_cancel_unblocks_parked_async_runs() {
    let conts = launch_in(&context(), |scope| {
        let conts: Vec<_> = (0..4).map(|_| scope.run_async(&select_abc(), ())).collect();
        thread::sleep(Duration::from_millis(10));
        scope.cancel();
        assert!(scope.is_cancelled());
        conts
    })
    .unwrap();

    for cont in conts {
        assert!(cont.is_cancelled());
        assert_eq!(cont.get_result(), Err(CoroutineError::Cancelled));
    }
}

#[test]
fn scope_cancel_unblocks_blocking_run() {
    launch_in(&context(), |scope| {
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                scope.cancel();
            });
            let cont = scope.run_blocking(&select_abc(), ());
            assert!(cont.is_finished());
            assert!(cont.is_cancelled());
        });
    })
    .unwrap();
}

#[test]
fn run_that_received_its_last_value_finishes_despite_cancel() {
    let take_a: Coroutine<(), String> = first(receive(&A));
    for round in 0..10 {
        launch_in(&context(), |scope| {
            let channel = scope.get_channel(&A);
            thread::scope(|s| {
                s.spawn(|| {
                    thread::sleep(Duration::from_millis(20));
                    channel.send_blocking(format!("v{}", round)).unwrap();
                    scope.cancel();
                });
                let cont = scope.run_blocking(&take_a, ());
                assert_eq!(cont.state(), RunState::Finished, "round {}", round);
                assert_eq!(cont.get_result().unwrap(), format!("v{}", round));
            });
        })
        .unwrap();
    }
}

#[test]
fn runs_started_after_cancel_are_cancelled() {
    let double: Coroutine<i64, i64> = first(apply(|x: i64| x * 2));
    launch_in(&context(), |scope| {
        scope.cancel();
        let cont = scope.run_blocking(&double, 1);
        assert_eq!(cont.state(), RunState::Cancelled);
    })
    .unwrap();
}

#[test]
fn continuation_cancel_leaves_siblings_alone() {
    launch_in(&context(), |scope| {
        let victim = scope.run_async(&select_abc(), ());
        let sibling = scope.run_async(&select_abc(), ());
        thread::sleep(Duration::from_millis(10));

        assert!(victim.cancel());
        assert_eq!(victim.await_completion(), RunState::Cancelled);
        assert!(!scope.is_cancelled());

        scope.get_channel(&C).send_blocking("still here".into()).unwrap();
        assert_eq!(sibling.get_result().unwrap(), "still here");
        assert!(!sibling.cancel());
    })
    .unwrap();
}

#[test]
fn step_failure_goes_to_handler() {
    let (ctx, seen) = recording_context();
    let (bad, good) = launch_in(&ctx, |scope| {
        (
            scope.run_async(&checked_double(), -3),
            scope.run_async(&checked_double(), 4),
        )
    })
    .unwrap();

    let expected = CoroutineError::Failed {
        step: "try_apply".into(),
        cause: "negative input -3".into(),
    };
    assert!(bad.is_failed());
    assert_eq!(bad.error(), Some(expected.clone()));
    assert_eq!(bad.get_result(), Err(expected.clone()));
    assert_eq!(good.get_result().unwrap(), 8);
    assert_eq!(*seen.lock(), vec![expected]);
}

#[test]
fn step_panic_fails_the_run() {
    let (ctx, seen) = recording_context();
    let exploding: Coroutine<(), i64> =
        first(supply(|| -> i64 { panic!("step exploded") })).with_name("exploding");
    let cont = launch_in(&ctx, |scope| scope.run_blocking(&exploding, ())).unwrap();

    match cont.error() {
        Some(CoroutineError::Panicked { step, message }) => {
            assert_eq!(step, "supply");
            assert_eq!(message, "step exploded");
        }
        other => panic!("expected a panic failure, got {:?}", other),
    }
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn failure_without_fail_fast_keeps_siblings_running() {
    let (ctx, _seen) = recording_context();
    launch_in(&ctx, |scope| {
        let sibling = scope.run_async(&select_abc(), ());
        let bad = scope.run_blocking(&checked_double(), -1);
        assert!(bad.is_failed());
        assert!(!scope.is_cancelled());

        scope.get_channel(&A).send_blocking("TEST-A".into()).unwrap();
        assert_eq!(sibling.get_result().unwrap(), "TEST-A");
    })
    .unwrap();
}

#[test]
fn fail_fast_cancels_siblings() {
    let (ctx, seen) = recording_context();
    ctx.set(FAIL_FAST, true);
    let (sibling, bad) = launch_in(&ctx, |scope| {
        let sibling = scope.run_async(&select_abc(), ());
        thread::sleep(Duration::from_millis(10));
        let bad = scope.run_blocking(&checked_double(), -1);
        assert!(scope.is_cancelled());
        (sibling, bad)
    })
    .unwrap();

    assert!(bad.is_failed());
    assert!(sibling.is_cancelled());
    // Cancellation of the sibling is not reported as a failure.
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn channel_preserves_send_order() {
    let take: Coroutine<(), i64> = first(receive(&NUMBERS));
    let ctx = context();
    ctx.set(CHANNEL_CAPACITY, 8);
    let got = launch_in(&ctx, |scope| {
        let numbers = scope.get_channel(&NUMBERS);
        for i in 1..=5 {
            numbers.send_blocking(i).unwrap();
        }
        (0..5)
            .map(|_| scope.run_blocking(&take, ()).get_result().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();
    assert_eq!(got, vec![1, 2, 3, 4, 5]);
}

#[test]
fn pipeline_over_rendezvous_channel() {
    let producer: Coroutine<(), i64> = first(supply(|| 7i64)).then(send(&NUMBERS));
    let consumer: Coroutine<(), i64> = first(receive(&NUMBERS)).then(apply(|x: i64| x * 6));
    let ctx = context();
    ctx.set(CHANNEL_CAPACITY, 0);

    let (p, c) = launch_in(&ctx, |scope| {
        assert_eq!(scope.get_channel(&NUMBERS).capacity(), 0);
        let p = scope.run_async(&producer, ());
        let c = scope.run_async(&consumer, ());
        (p, c)
    })
    .unwrap();
    assert_eq!(p.get_result().unwrap(), 7);
    assert_eq!(c.get_result().unwrap(), 42);
}

#[test]
fn channels_do_not_outlive_their_scope() {
    let ctx = context();
    let (channel, scope_ctx) = launch_in(&ctx, |scope| {
        let channel = scope.get_channel(&A);
        channel.send_blocking("left behind".into()).unwrap();
        (channel, scope.context().clone())
    })
    .unwrap();

    assert!(channel.is_cancelled());
    assert!(!scope_ctx.has_channel(&A));
    assert!(!ctx.has_channel(&A));
}

#[test]
fn results_can_be_taken_once() {
    let double: Coroutine<i64, i64> = first(apply(|x: i64| x * 2));
    let cont = launch_in(&context(), |scope| scope.run_async(&double, 5)).unwrap();
    assert_eq!(cont.get_result_timeout(Duration::from_secs(1)).unwrap(), 10);
    assert_eq!(cont.take_result().unwrap(), 10);
    assert_eq!(cont.try_result(), Some(Err(CoroutineError::ResultTaken)));
}

const GREETING: ConfigKey<String> = ConfigKey::new("greeting");

#[test]
fn default_context_can_be_replaced_and_reset() {
    let custom = Context::with_defaults();
    custom.set(WORKER_THREADS, 1);
    custom.set(GREETING, "hello".to_string());
    set_default_context(custom.clone());
    assert!(Arc::ptr_eq(&default_context(), &custom));

    let seen = launch(|scope| scope.context().get(GREETING)).unwrap();
    assert_eq!(seen.as_deref(), Some("hello"));

    reset_default_context();
    let fresh = default_context();
    assert!(!Arc::ptr_eq(&fresh, &custom));
    assert_eq!(fresh.get(GREETING), None);
    assert!(fresh.has(EXCEPTION_HANDLER));
}
