use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evloop::{Dispatcher, Timer};

#[test]
fn timers_fire_in_deadline_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = Dispatcher::new().unwrap();
    for (label, ms) in [("late", 30u64), ("early", 10), ("middle", 20)] {
        let order = order.clone();
        dispatcher.activate_timer(Timer::new(Duration::from_millis(ms), move |_, _| {
            order.lock().unwrap().push(label);
            true
        }));
    }
    assert_eq!(dispatcher.run(), 0);
    assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
}

#[test]
fn repeat_two_fires_three_times_then_loop_exits() {
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    let mut dispatcher = Dispatcher::new().unwrap();
    dispatcher.activate_timer(Timer::repeating(Duration::from_millis(10), 2, move |_, _| {
        count.fetch_add(1, Ordering::Relaxed);
        true
    }));
    assert!(dispatcher.is_pending());
    // exits on its own once the timer fires out
    assert_eq!(dispatcher.run(), 0);
    assert_eq!(fired.load(Ordering::Relaxed), 3);
    assert!(!dispatcher.is_pending());
}

#[test]
fn deactivation_is_idempotent() {
    let mut dispatcher = Dispatcher::new().unwrap();
    let idle = dispatcher.activate_timer(Timer::new(Duration::from_secs(30), |_, _| true));
    assert!(dispatcher.deactivate_timer(idle));
    assert!(!dispatcher.deactivate_timer(idle));
    assert!(!dispatcher.is_pending());

    // a later timer is unaffected by the stale handle
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    dispatcher.activate_timer(Timer::new(Duration::from_millis(10), move |_, _| {
        count.fetch_add(1, Ordering::Relaxed);
        true
    }));
    assert!(!dispatcher.deactivate_timer(idle));
    assert_eq!(dispatcher.run(), 0);
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn callback_may_manage_its_own_schedule() {
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    let mut dispatcher = Dispatcher::new().unwrap();
    dispatcher.activate_timer(Timer::repeating(
        Duration::from_millis(5),
        -1,
        move |reactor, handle| {
            let n = count.fetch_add(1, Ordering::Relaxed) + 1;
            if n < 3 {
                reactor.reschedule_timer(handle);
            } else {
                reactor.deactivate_timer(handle);
            }
            false // scheduling handled above
        },
    ));
    assert_eq!(dispatcher.run(), 0);
    assert_eq!(fired.load(Ordering::Relaxed), 3);
}

#[test]
fn interval_change_applies_on_next_activation_cycle() {
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    let mut dispatcher = Dispatcher::new().unwrap();
    dispatcher.activate_timer(Timer::repeating(
        Duration::from_millis(5),
        3,
        move |reactor, handle| {
            count.fetch_add(1, Ordering::Relaxed);
            // stretch later firings; the default policy picks this up
            reactor.set_timer_interval(handle, Duration::from_millis(10));
            true
        },
    ));
    let start = std::time::Instant::now();
    assert_eq!(dispatcher.run(), 0);
    assert_eq!(fired.load(Ordering::Relaxed), 4);
    assert!(start.elapsed() >= Duration::from_millis(30));
}
