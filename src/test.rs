use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    Borrowed, Owned, Timer, TimerConfig, TimerError, TimerState,
    user_data::UserData,
};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn counting_timer(config: TimerConfig) -> (Timer, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_cb = calls.clone();
    let timer = Timer::new(config)
        .set_expiration_event(move |_, _| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    (timer, calls)
}

#[test]
fn test_create_then_start() {
    for (initial, interval, threshold) in [(5000, 10_000, 0), (100, 0, 3), (1000, 1, 1)] {
        let (timer, _) = counting_timer(TimerConfig::from_millis(initial, interval).threshold(threshold));
        assert_eq!(timer.state(), TimerState::Init);
        assert_eq!(timer.invocation_count(), 0);
        timer.start().unwrap();
        assert_eq!(timer.state(), TimerState::Running);
        assert!(timer.is_running());
        timer.delete().unwrap();
    }
}

#[test]
fn test_build_requires_callback() {
    let result = Timer::new(TimerConfig::default()).build();
    assert!(matches!(result, Err(TimerError::BuildErrorNoCallbackSet)));
}

#[test]
fn test_cancel_is_idempotent() {
    let (timer, _) = counting_timer(TimerConfig::from_millis(5000, 0));
    timer.cancel().unwrap();
    assert_eq!(timer.state(), TimerState::Init);

    timer.start().unwrap();
    timer.cancel().unwrap();
    assert_eq!(timer.state(), TimerState::Cancelled);
    timer.cancel().unwrap();
    assert_eq!(timer.state(), TimerState::Cancelled);
    assert_eq!(timer.remaining_time(), None);
    assert!(timer.schedule().is_disarmed());
}

#[test]
fn test_pause_resume_round_trip() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(600, 0));
    timer.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    timer.pause().unwrap();
    assert_eq!(timer.state(), TimerState::Paused);
    assert!(timer.schedule().is_disarmed());
    // pausing twice is harmless.
    timer.pause().unwrap();

    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    timer.resume().unwrap();
    assert_eq!(timer.state(), TimerState::Resumed);
    assert_eq!(timer.invocation_count(), 0);
    let resumed_with = timer.schedule().initial_delay;
    assert!(
        resumed_with > Duration::from_millis(400) && resumed_with <= Duration::from_millis(500),
        "resumed with {:?}",
        resumed_with
    );

    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
    assert!(wait_until(Duration::from_secs(1), || timer.state() == TimerState::Running));
    timer.delete().unwrap();
}

#[test]
fn test_resume_requires_pause() {
    let (timer, _) = counting_timer(TimerConfig::from_millis(5000, 0));
    assert!(matches!(
        timer.resume(),
        Err(TimerError::InvalidTransition {
            state: TimerState::Init,
            ..
        })
    ));
    timer.start().unwrap();
    assert!(timer.resume().is_err());
    assert_eq!(timer.state(), TimerState::Running);
}

#[test]
fn test_threshold_stops_callbacks() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(20, 20).threshold(3));
    timer.start().unwrap();

    assert!(wait_until(Duration::from_secs(3), || timer.state() == TimerState::Cancelled));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(timer.invocation_count(), 0);
    assert_eq!(timer.remaining_time(), None);
}

#[test]
fn test_backoff_doubles_the_delay() {
    // delay=20ms, interval=0, threshold=3, backoff on.
    let (tx, rx) = crossbeam_channel::unbounded::<(u32, Duration)>();
    let timer = Timer::new(
        TimerConfig::from_millis(20, 0)
            .threshold(3)
            .exponential_backoff(true),
    )
    .set_expiration_event(move |timer, _| {
        tx.send((timer.invocation_count(), timer.schedule().initial_delay))
            .unwrap();
    })
    .build()
    .unwrap();

    assert_eq!(timer.schedule().interval, Duration::ZERO);
    assert_eq!(timer.backoff_interval(), Duration::from_millis(20));
    timer.start().unwrap();

    assert!(wait_until(Duration::from_secs(3), || timer.state() == TimerState::Cancelled));
    let fired: Vec<(u32, Duration)> = rx.try_iter().collect();
    assert_eq!(
        fired,
        vec![
            (1, Duration::from_millis(20)),
            (2, Duration::from_millis(40)),
            (3, Duration::from_millis(80)),
        ]
    );
}

#[test]
fn test_backoff_with_zero_delay_never_fires() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(0, 0).exponential_backoff(true));
    timer.start().unwrap();
    assert!(timer.schedule().is_disarmed());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_reschedule_preserves_counter() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(20, 20));
    timer.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || calls.load(Ordering::SeqCst) >= 2));

    timer.pause().unwrap();
    let delivered = timer.invocation_count();
    assert!(delivered >= 2);

    timer
        .reschedule(Duration::from_secs(5), Duration::ZERO)
        .unwrap();
    assert_eq!(timer.invocation_count(), delivered);
    assert_eq!(timer.state(), TimerState::Running);
    assert_eq!(timer.schedule().initial_delay, Duration::from_secs(5));

    timer.restart().unwrap();
    assert_eq!(timer.invocation_count(), 0);
    assert_eq!(timer.state(), TimerState::Running);
    assert_eq!(timer.schedule().initial_delay, Duration::from_millis(20));
}

#[test]
fn test_reschedule_after_cancel_starts_from_zero() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(20, 20));
    timer.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || calls.load(Ordering::SeqCst) >= 1));
    timer.cancel().unwrap();
    timer
        .reschedule(Duration::from_secs(5), Duration::ZERO)
        .unwrap();
    assert_eq!(timer.invocation_count(), 0);
    assert_eq!(timer.state(), TimerState::Running);
}

#[test]
fn test_periodic_timer() {
    // delay=200ms, interval=400ms, threshold=0, no backoff.
    let (tx, rx) = crossbeam_channel::unbounded::<(u32, Instant)>();
    let timer = Timer::new(TimerConfig::from_millis(200, 400))
        .set_expiration_event(move |timer, _| {
            tx.send((timer.invocation_count(), Instant::now())).unwrap();
        })
        .build()
        .unwrap();
    let started = Instant::now();
    timer.start().unwrap();

    let (first, first_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, 1);
    let gap = first_at - started;
    assert!(
        gap >= Duration::from_millis(190) && gap < Duration::from_millis(350),
        "first expiration after {:?}",
        gap
    );
    assert_eq!(timer.state(), TimerState::Running);

    // every delivery rearms with (initial_delay, interval), so the next one comes
    // initial_delay later and not after the configured interval.
    let (second, second_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second, 2);
    let gap = second_at - first_at;
    assert!(
        gap >= Duration::from_millis(150) && gap < Duration::from_millis(350),
        "second expiration {:?} after the first",
        gap
    );

    let (third, third_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(third, 3);
    assert!(third_at - second_at < Duration::from_millis(350));
    timer.delete().unwrap();
}

#[test]
fn test_pause_keeps_delivered_count() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(40, 0));
    timer.start().unwrap();
    assert!(wait_until(Duration::from_secs(3), || timer.invocation_count() >= 2));

    timer.pause().unwrap();
    let delivered = timer.invocation_count();
    assert!(delivered >= 2);
    let called = calls.load(Ordering::SeqCst);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(timer.invocation_count(), delivered);
    assert_eq!(calls.load(Ordering::SeqCst), called);

    timer.resume().unwrap();
    assert_eq!(timer.state(), TimerState::Resumed);
    assert_eq!(timer.invocation_count(), delivered);
    assert!(wait_until(Duration::from_secs(2), || timer.invocation_count() > delivered));
    timer.delete().unwrap();
}

#[test]
fn test_out_of_range_delay_cancels_timer() {
    let (timer, _) = counting_timer(TimerConfig::from_millis(5000, 0));
    timer.start().unwrap();
    assert!(matches!(
        timer.reschedule(Duration::from_secs(u64::MAX / 2), Duration::ZERO),
        Err(TimerError::OsResource(_))
    ));
    assert_eq!(timer.state(), TimerState::Cancelled);
    assert!(timer.schedule().is_disarmed());

    // the timer is still usable.
    timer.restart().unwrap();
    assert_eq!(timer.state(), TimerState::Running);
    timer.delete().unwrap();
}

#[test]
fn test_deleted_timer_rejects_commands() {
    let (timer, _) = counting_timer(TimerConfig::from_millis(50, 0));
    timer.start().unwrap();
    timer.delete().unwrap();
    assert_eq!(timer.state(), TimerState::Deleted);
    assert_eq!(timer.remaining_time(), None);

    let results = [
        timer.start(),
        timer.pause(),
        timer.resume(),
        timer.cancel(),
        timer.restart(),
        timer.reschedule(Duration::from_millis(10), Duration::ZERO),
        timer.delete(),
    ];
    for result in results {
        assert!(matches!(
            result,
            Err(TimerError::InvalidTransition {
                state: TimerState::Deleted,
                ..
            })
        ));
    }
    assert_eq!(timer.state(), TimerState::Deleted);
}

#[test]
fn test_cancel_suppresses_expiration() {
    let (timer, calls) = counting_timer(TimerConfig::from_millis(50, 0));
    timer.start().unwrap();
    timer.cancel().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_callback_can_cancel_its_timer() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_cb = calls.clone();
    let timer = Timer::new(TimerConfig::from_millis(20, 20))
        .set_expiration_event(move |timer, _| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            timer.cancel().unwrap();
        })
        .build()
        .unwrap();
    timer.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || timer.state() == TimerState::Cancelled));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_callback_panic_cancels_timer() {
    let timer = Timer::new(TimerConfig::from_millis(20, 20))
        .set_expiration_event(|_, _| panic!("callback failure"))
        .build()
        .unwrap();
    timer.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || timer.state() == TimerState::Cancelled));
}

#[test]
fn test_borrowed_user_data() {
    let name = Arc::new(String::from("subbu"));
    let (tx, rx) = crossbeam_channel::bounded::<String>(4);
    let timer = Timer::with_user_data(TimerConfig::from_millis(20, 0), Borrowed::new(name.clone()))
        .set_expiration_event(move |timer, name| {
            tx.send(name.map(|n| n.to_string()).unwrap_or_default()).unwrap();
            timer.cancel().unwrap();
        })
        .build()
        .unwrap();
    timer.start().unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "subbu");
    timer.delete().unwrap();
    drop(timer);
    assert!(wait_until(Duration::from_secs(1), || Arc::strong_count(&name) == 1));
}

#[test]
fn test_owned_user_data_release() {
    let data = Owned::new(vec![1u8, 2, 3]);
    assert!(data.get().is_some());

    let (tx, rx) = crossbeam_channel::bounded::<Option<usize>>(4);
    let timer = Timer::with_user_data(TimerConfig::from_millis(20, 0), data)
        .set_expiration_event(move |timer, data| {
            tx.send(data.map(|d| d.len())).unwrap();
            timer.cancel().unwrap();
        })
        .build()
        .unwrap();

    assert!(timer.release_user_data().unwrap());
    assert!(!timer.release_user_data().unwrap());

    timer.start().unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), None);
    timer.delete().unwrap();
}

#[test]
fn test_deleted_timer_keeps_user_data() {
    let timer = Timer::with_user_data(TimerConfig::from_millis(5000, 0), Owned::new(7u32))
        .set_expiration_event(|_, _| {})
        .build()
        .unwrap();
    timer.delete().unwrap();
    assert!(matches!(
        timer.release_user_data(),
        Err(TimerError::InvalidTransition {
            state: TimerState::Deleted,
            ..
        })
    ));
}

#[test]
fn test_display() {
    let (timer, _) = counting_timer(TimerConfig::from_millis(5000, 0));
    assert_eq!(
        timer.to_string(),
        "Counter = 0, time remaining = 0ms, state = TIMER_INIT"
    );
    timer.cancel().unwrap();
    timer.start().unwrap();
    timer.cancel().unwrap();
    assert!(timer.to_string().ends_with("time remaining = n/a, state = TIMER_CANCELLED"));
}
