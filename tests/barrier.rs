//! Firing, holding and draining driven by a hand-fired timing facility, so
//! every race outcome can be produced on purpose.

mod common;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chronus::{Config, Error, Phase, Scheduler};
use common::{Journal, ManualTimer, init_logging};

fn manual_scheduler() -> (Scheduler, ManualTimer) {
    init_logging();
    let timer = ManualTimer::new();
    let config = Config::new()
        .with_await_budget(Duration::from_millis(60))
        .with_poll_interval(Duration::from_millis(5));
    (Scheduler::with_facility(config, timer.clone()), timer)
}

fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn fired_task_is_held_until_await() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    let handle = scheduler
        .schedule(counting_task(&counter), Duration::from_millis(10))
        .unwrap();
    assert_eq!(scheduler.outstanding(), 1, "Accepted task should be counted");
    assert_eq!(handle.phase(), Phase::Live);
    assert_eq!(timer.delay_of(timer.armed()[0]), Some(Duration::from_millis(10)));

    assert_eq!(timer.fire_all(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 0, "Body must not run before await");
    assert_eq!(handle.phase(), Phase::Held);
    assert_eq!(scheduler.held(), 1);
    assert_eq!(scheduler.outstanding(), 1, "Holding does not change the count");

    scheduler.await_tasks();

    assert_eq!(counter.load(Ordering::SeqCst), 1, "Held task should have run");
    assert_eq!(handle.phase(), Phase::Ran);
    assert_eq!(scheduler.outstanding(), 0);
    assert_eq!(scheduler.held(), 0);
    assert!(!scheduler.is_draining());
}

#[test]
fn held_tasks_drain_in_fire_order() {
    let (scheduler, timer) = manual_scheduler();
    let journal = Journal::new();

    scheduler.schedule(journal.recorder("a"), Duration::from_millis(5)).unwrap();
    scheduler.schedule(journal.recorder("b"), Duration::from_millis(5)).unwrap();
    scheduler.schedule(journal.recorder("c"), Duration::from_millis(5)).unwrap();
    let keys = timer.armed();

    // Fire order differs from scheduling order on purpose.
    assert!(timer.fire(keys[2]));
    assert!(timer.fire(keys[0]));
    assert!(timer.fire(keys[1]));
    assert!(journal.entries().is_empty());

    scheduler.await_tasks();
    assert_eq!(journal.entries(), vec!["c", "a", "b"]);
}

#[test]
fn task_firing_while_draining_runs_on_the_firing_thread() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    scheduler.submit(counting_task(&counter)).unwrap();
    let key = timer.armed()[0];

    let firing_timer = timer.clone();
    let firing = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(15));
        firing_timer.fire(key)
    });
    scheduler.await_tasks();

    assert!(firing.join().unwrap());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.held(), 0, "A draining firing is never held");
}

#[test]
fn cancel_before_fire_disarms_the_timer() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    let handle = scheduler
        .schedule(counting_task(&counter), Duration::from_millis(50))
        .unwrap();
    assert!(scheduler.cancel(&handle), "Pending task should be cancellable");
    assert!(timer.armed().is_empty(), "Timer entry should be removed");
    assert_eq!(scheduler.outstanding(), 0);
    assert_eq!(handle.phase(), Phase::Cancelled);
    assert!(!handle.cancel(), "Second cancel has no effect");

    scheduler.await_tasks();
    assert_eq!(counter.load(Ordering::SeqCst), 0, "Cancelled body never runs");
}

#[test]
fn cancel_of_held_task_removes_it_from_the_queue() {
    let (scheduler, timer) = manual_scheduler();
    let journal = Journal::new();

    scheduler.submit(journal.recorder("kept")).unwrap();
    let dropped = scheduler.submit(journal.recorder("dropped")).unwrap();
    timer.fire_all();
    assert_eq!(scheduler.held(), 2);

    assert!(dropped.cancel());
    assert_eq!(scheduler.held(), 1);
    assert_eq!(scheduler.outstanding(), 1);

    scheduler.await_tasks();
    assert_eq!(journal.entries(), vec!["kept"]);
}

#[test]
fn cancel_after_run_is_too_late() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    let handle = scheduler.submit(counting_task(&counter)).unwrap();
    timer.fire_all();
    scheduler.await_tasks();

    assert!(!scheduler.cancel(&handle));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(handle.phase(), Phase::Ran);
}

#[test]
fn firing_lost_to_a_cancel_does_nothing() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    let handle = scheduler.submit(counting_task(&counter)).unwrap();
    // The worker already picked the entry up when the cancel comes in.
    let fire = timer.callback(timer.armed()[0]).unwrap();
    assert!(handle.cancel());
    fire();

    assert_eq!(scheduler.held(), 0);
    assert_eq!(scheduler.outstanding(), 0);
    scheduler.await_tasks();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn handle_from_another_scheduler_is_not_cancelled() {
    let (scheduler, _timer) = manual_scheduler();
    let (other, _other_timer) = manual_scheduler();

    let handle = other.submit(|| {}).unwrap();
    assert!(!scheduler.cancel(&handle));
    assert_eq!(other.outstanding(), 1);
    assert!(other.cancel(&handle));
}

#[test]
fn timeout_reports_remaining_and_resets() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    let first = scheduler.submit(counting_task(&counter)).unwrap();
    scheduler.submit(counting_task(&counter)).unwrap();
    // Nobody fires these, so they never finish.
    let stale = timer.callback(timer.armed()[0]).unwrap();

    let result = scheduler.try_await_tasks();
    assert_eq!(
        result,
        Err(Error::Timeout {
            remaining: 2,
            budget: Duration::from_millis(60),
        })
    );
    assert_eq!(scheduler.outstanding(), 0, "Timeout still resets the count");
    assert!(!scheduler.is_draining());
    assert!(timer.armed().is_empty(), "Abandoned tasks are disarmed");
    assert_eq!(first.phase(), Phase::Cancelled);

    // A firing that slipped through after the reset changes nothing.
    stale();
    assert_eq!(scheduler.outstanding(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    scheduler.await_tasks();
}

#[test]
#[should_panic(expected = "Task can't exceed 60ms. Remaining tasks are 1.")]
fn await_tasks_panics_on_timeout() {
    let (scheduler, _timer) = manual_scheduler();
    scheduler.submit(|| {}).unwrap();
    scheduler.await_tasks();
}

#[test]
fn panicking_held_task_propagates_and_resets() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.submit(|| panic!("boom")).unwrap();
    scheduler.submit(counting_task(&counter)).unwrap();
    timer.fire_all();

    let result = panic::catch_unwind(AssertUnwindSafe(|| scheduler.await_tasks()));
    assert!(result.is_err(), "Panic should reach the awaiting caller");
    assert_eq!(scheduler.outstanding(), 0);
    assert_eq!(scheduler.held(), 0);
    assert!(!scheduler.is_draining());
    assert_eq!(
        counter.load(Ordering::SeqCst),
        0,
        "Tasks queued behind the panicking one are dropped by the reset"
    );

    // The next cycle starts clean.
    scheduler.submit(counting_task(&counter)).unwrap();
    timer.fire_all();
    scheduler.await_tasks();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn consecutive_cycles_start_from_a_clean_slate() {
    let (scheduler, timer) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    for cycle in 1..=3 {
        scheduler.submit(counting_task(&counter)).unwrap();
        scheduler.submit(counting_task(&counter)).unwrap();
        timer.fire_all();
        assert_eq!(scheduler.outstanding(), 2, "No drift between cycles");
        assert_eq!(scheduler.held(), 2);

        scheduler.await_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), cycle * 2);
        assert_eq!(scheduler.outstanding(), 0);
    }
}

#[test]
fn periodic_task_is_counted_once_per_firing() {
    let (scheduler, timer) = manual_scheduler();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_cl = Arc::clone(&runs);

    let handle = scheduler
        .schedule_at_fixed_rate(
            move || {
                runs_cl.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
        .unwrap();
    assert!(handle.is_periodic());
    assert_eq!(scheduler.outstanding(), 1);
    let key = timer.armed()[0];

    timer.fire(key);
    scheduler.await_tasks();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(handle.phase(), Phase::Live, "Periodic task stays armed");
    assert_eq!(scheduler.outstanding(), 0);

    timer.fire(key);
    assert_eq!(scheduler.outstanding(), 1, "Next period is counted again");
    scheduler.await_tasks();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    assert!(scheduler.cancel(&handle));
    assert!(timer.armed().is_empty());
    assert!(!handle.cancel(), "Already cancelled");
    scheduler.await_tasks();
}

#[test]
fn overlapping_periodic_firings_coalesce_while_held() {
    let (scheduler, timer) = manual_scheduler();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_cl = Arc::clone(&runs);

    scheduler
        .schedule_with_fixed_delay(
            move || {
                runs_cl.fetch_add(1, Ordering::SeqCst);
            },
            Duration::ZERO,
            Duration::from_millis(1),
        )
        .unwrap();
    let key = timer.armed()[0];
    timer.fire(key);
    timer.fire(key);
    timer.fire(key);
    assert_eq!(scheduler.held(), 1);
    assert_eq!(scheduler.outstanding(), 1);

    scheduler.await_tasks();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn periodic_task_survives_a_timeout_reset() {
    let (scheduler, timer) = manual_scheduler();
    let handle = scheduler
        .schedule_at_fixed_rate(|| {}, Duration::from_millis(5), Duration::from_millis(5))
        .unwrap();

    // Never fired, so the first period is still outstanding.
    assert!(scheduler.try_await_tasks().is_err());
    assert_eq!(handle.phase(), Phase::Live);
    assert_eq!(timer.armed().len(), 1, "Periodic entry stays armed");

    // Not counted again until it fires.
    scheduler.await_tasks();
    assert!(handle.cancel());
}

#[test]
fn zero_period_is_rejected() {
    let (scheduler, timer) = manual_scheduler();
    let result = scheduler.schedule_at_fixed_rate(|| {}, Duration::ZERO, Duration::ZERO);
    assert_eq!(result.err(), Some(Error::ZeroPeriod));
    assert!(timer.armed().is_empty());
    assert_eq!(scheduler.outstanding(), 0);
}

#[test]
fn schedule_after_shutdown_fails() {
    let (scheduler, _timer) = manual_scheduler();
    scheduler.shutdown();
    assert!(scheduler.is_shutdown());

    let result = scheduler.submit(|| {});
    assert_eq!(result.err(), Some(Error::Shutdown));
    assert_eq!(scheduler.outstanding(), 0, "Rejected tasks are not counted");
    scheduler.await_tasks();
}

#[test]
fn handle_outliving_its_scheduler_cannot_cancel() {
    let (scheduler, _timer) = manual_scheduler();
    let handle = scheduler.submit(|| {}).unwrap();
    drop(scheduler);
    assert!(!handle.cancel());
}
