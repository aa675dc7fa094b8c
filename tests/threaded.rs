use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evloop::{Dispatcher, Timer};

#[test]
fn suspend_wakes_a_parked_reactor() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut dispatcher = Dispatcher::new().unwrap();
    // park the reactor on a long wait
    dispatcher.activate_timer(Timer::new(Duration::from_secs(5), |reactor, _| {
        reactor.stop(1);
        true
    }));
    dispatcher.start_thread(false).unwrap();
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    {
        let mut core = dispatcher.suspend();
        core.activate_timer(Timer::new(Duration::from_millis(100), |reactor, _| {
            reactor.stop(7);
            true
        }));
    } // guard drop wakes the reactor; it must notice the new deadline
    assert_eq!(dispatcher.join(), 7);
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn stop_reaches_a_foreign_thread_promptly() {
    let mut dispatcher = Dispatcher::new().unwrap();
    // nothing registered: a threaded dispatcher still waits for work
    dispatcher.start_thread(false).unwrap();
    thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    dispatcher.stop(3);
    assert_eq!(dispatcher.join(), 3);
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn handle_prompt_runs_on_the_dispatch_thread() {
    let mut dispatcher = Dispatcher::new().unwrap();
    let handle = dispatcher.handle();
    dispatcher.start_thread(false).unwrap();

    let (name_tx, name_rx) = std::sync::mpsc::channel();
    handle.prompt(move |reactor| {
        let name = thread::current().name().map(str::to_owned);
        let _ = name_tx.send(name);
        reactor.stop(5);
    });
    assert_eq!(
        name_rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        Some("evloop-dispatch".to_owned())
    );
    assert_eq!(dispatcher.join(), 5);
}

#[test]
fn handle_stop_works_from_another_thread() {
    let mut dispatcher = Dispatcher::new().unwrap();
    let handle = dispatcher.handle();
    dispatcher.start_thread(false).unwrap();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.stop(11);
    });
    assert_eq!(dispatcher.join(), 11);
    stopper.join().unwrap();
}

#[test]
fn controller_dispatches_on_its_own_thread() {
    let mut dispatcher = Dispatcher::new().unwrap();
    let fired_on = Arc::new(Mutex::new(None));
    let record = fired_on.clone();
    dispatcher.activate_timer(Timer::new(Duration::from_millis(50), move |reactor, _| {
        *record.lock().unwrap() = Some(thread::current().id());
        reactor.stop(9);
        true
    }));
    let controller = dispatcher.start_thread_controlled(false).unwrap();
    while controller.dispatch_next() {}
    assert_eq!(dispatcher.join(), 9);
    assert_eq!(*fired_on.lock().unwrap(), Some(thread::current().id()));
}

#[test]
fn dispatcher_is_reusable_after_join() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut dispatcher = Dispatcher::new().unwrap();

    let count = fired.clone();
    dispatcher.activate_timer(Timer::new(Duration::from_millis(10), move |reactor, _| {
        count.fetch_add(1, Ordering::Relaxed);
        reactor.stop(1);
        true
    }));
    dispatcher.start_thread(false).unwrap();
    assert_eq!(dispatcher.join(), 1);

    // same dispatcher, second life on the calling thread
    let count = fired.clone();
    dispatcher.activate_timer(Timer::new(Duration::from_millis(10), move |reactor, _| {
        count.fetch_add(1, Ordering::Relaxed);
        reactor.stop(2);
        true
    }));
    assert_eq!(dispatcher.run(), 2);
    assert_eq!(fired.load(Ordering::Relaxed), 2);
}
