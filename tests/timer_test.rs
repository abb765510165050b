//! Timer facility tests. Local schedules run on a manual clock without a
//! tokio runtime, so only explicit `tick()` calls advance them.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use workq::error::Error;
use workq::timer::{Callback, EventLoop, ManualClock, Timer, TimerId, TimerMode, TokioEventLoop};

fn counter() -> (Arc<AtomicUsize>, Callback) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let callback: Callback = Arc::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (hits, callback)
}

fn manual_timer(start: i64) -> (Arc<ManualClock>, Timer) {
    let clock = Arc::new(ManualClock::new(start));
    let timer = Timer::with_clock(clock.clone());
    (clock, timer)
}

#[test]
fn one_shot_fires_once_when_due() {
    let (clock, timer) = manual_timer(1_000);
    let (hits, callback) = counter();

    timer
        .add(Duration::from_secs(2), callback, false, None)
        .unwrap();
    assert_eq!(timer.count(), 1);

    assert_eq!(timer.tick(), 0);
    clock.advance(Duration::from_secs(1));
    assert_eq!(timer.tick(), 0);
    clock.advance(Duration::from_secs(1));
    assert_eq!(timer.tick(), 1);

    clock.advance(Duration::from_secs(10));
    assert_eq!(timer.tick(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(timer.count(), 0);
}

#[test]
fn persistent_task_rearms_from_tick_time() {
    let (clock, timer) = manual_timer(100);
    let (hits, callback) = counter();
    timer
        .add(Duration::from_secs(2), callback, true, None)
        .unwrap();

    // Fires late, at 103; the next run is due at 105, not 104.
    clock.set(103);
    assert_eq!(timer.tick(), 1);
    clock.set(104);
    assert_eq!(timer.tick(), 0);
    clock.set(105);
    assert_eq!(timer.tick(), 1);

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(timer.count(), 1);
}

#[test]
fn due_tasks_run_in_insertion_order() {
    let (clock, timer) = manual_timer(0);
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let order = order.clone();
        timer
            .add(
                Duration::from_secs(1),
                Arc::new(move || {
                    order.lock().push(name);
                    Ok(())
                }),
                false,
                None,
            )
            .unwrap();
    }

    clock.advance(Duration::from_secs(1));
    assert_eq!(timer.tick(), 3);
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[test]
fn zero_interval_is_rejected() {
    let (_clock, timer) = manual_timer(0);
    let (_hits, callback) = counter();

    let err = timer
        .add(Duration::ZERO, callback, false, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
    assert_eq!(timer.count(), 0);
}

#[test]
fn del_removes_task_and_is_idempotent() {
    let (clock, timer) = manual_timer(0);
    let (hits, callback) = counter();
    let (other_hits, other) = counter();

    let id = timer
        .add(Duration::from_secs(3), callback, true, Some(TimerId::from("cleanup")))
        .unwrap();
    assert_eq!(id, TimerId::from("cleanup"));
    timer.add(Duration::from_secs(5), other, false, None).unwrap();

    assert!(timer.del(&id));
    assert!(timer.del(&id));
    assert_eq!(timer.count(), 1);

    clock.advance(Duration::from_secs(5));
    assert_eq!(timer.tick(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(other_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn del_all_clears_schedule() {
    let (clock, timer) = manual_timer(0);
    let (hits, callback) = counter();
    timer
        .add(Duration::from_secs(1), callback.clone(), true, None)
        .unwrap();
    timer.add(Duration::from_secs(2), callback, false, None).unwrap();

    timer.del_all();
    assert_eq!(timer.count(), 0);

    clock.advance(Duration::from_secs(5));
    assert_eq!(timer.tick(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_callbacks_do_not_stop_others() {
    let (clock, timer) = manual_timer(0);
    let (hits, callback) = counter();
    timer
        .add(
            Duration::from_secs(1),
            Arc::new(|| Err(Error::Other("nope".to_string()))),
            false,
            None,
        )
        .unwrap();
    timer
        .add(
            Duration::from_secs(1),
            Arc::new(|| panic!("callback blew up")),
            false,
            None,
        )
        .unwrap();
    timer
        .add(Duration::from_secs(1), callback, false, None)
        .unwrap();

    clock.advance(Duration::from_secs(1));
    assert_eq!(timer.tick(), 3);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct RecordingLoop {
    added: Mutex<Vec<(Duration, TimerMode)>>,
    deleted: Mutex<Vec<TimerId>>,
    cleared: AtomicUsize,
}

impl EventLoop for RecordingLoop {
    fn add(&self, interval: Duration, mode: TimerMode, _callback: Callback) -> TimerId {
        self.added.lock().push((interval, mode));
        TimerId::from("loop-timer")
    }

    fn del(&self, id: &TimerId, _mode: TimerMode) -> bool {
        self.deleted.lock().push(id.clone());
        true
    }

    fn clear_all_timers(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn event_loop_adapter_receives_every_operation() {
    let adapter = Arc::new(RecordingLoop::default());
    let timer = Timer::with_event_loop(adapter.clone());
    let (_hits, callback) = counter();

    let id = timer
        .add(Duration::from_millis(250), callback.clone(), true, None)
        .unwrap();
    timer
        .add(Duration::from_secs(1), callback, false, None)
        .unwrap();
    assert_eq!(id, TimerId::from("loop-timer"));
    assert_eq!(
        *adapter.added.lock(),
        vec![
            (Duration::from_millis(250), TimerMode::Recurring),
            (Duration::from_secs(1), TimerMode::Once),
        ]
    );
    assert_eq!(timer.count(), 0);

    assert!(timer.del(&id));
    assert_eq!(*adapter.deleted.lock(), vec![id]);

    timer.del_all();
    assert_eq!(adapter.cleared.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn tokio_event_loop_runs_sub_second_timers() {
    let adapter = Arc::new(TokioEventLoop::new().unwrap());
    let timer = Timer::with_event_loop(adapter.clone());
    let (recurring_hits, recurring) = counter();
    let (once_hits, once) = counter();

    let id = timer
        .add(Duration::from_millis(100), recurring, true, None)
        .unwrap();
    timer
        .add(Duration::from_millis(150), once, false, None)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(recurring_hits.load(Ordering::SeqCst), 3);
    assert_eq!(once_hits.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.len(), 1);

    timer.del(&id);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recurring_hits.load(Ordering::SeqCst), 3);
    assert!(adapter.is_empty());
}
