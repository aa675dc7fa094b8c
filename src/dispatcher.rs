use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{error, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::event::Event;
use crate::poller::{Poller, ReadyEvent};
use crate::reactor::{boost_priority, Reactor};
use crate::stream::{Direction, Flags};
use crate::time::TimeValue;
use crate::timer::{Timer, TimerHandle};

/// Owns the wait backend and the shared reactor core, and runs the
/// wait/dispatch loop either on the calling thread ([`run`]) or on a
/// named background thread ([`start_thread`]).
///
/// [`run`]: Dispatcher::run
/// [`start_thread`]: Dispatcher::start_thread
pub struct Dispatcher {
    core: Arc<Mutex<Reactor>>,
    poller: Arc<Mutex<Poller>>,
    thread: Option<JoinHandle<i32>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl Dispatcher {
    pub fn new() -> io::Result<Dispatcher> {
        let poller = Poller::new()?;
        let waker = Arc::new(poller.waker()?);
        let registrar = poller.registrar()?;
        let core = Arc::new(Mutex::new(Reactor::new(registrar, waker)));
        let (stop_tx, stop_rx) = bounded(1);
        Ok(Dispatcher {
            core,
            poller: Arc::new(Mutex::new(poller)),
            thread: None,
            stop_tx,
            stop_rx,
        })
    }

    /// Run the dispatch loop on the calling thread until [`stop`] or
    /// until nothing is left to wait on. Returns the exit code.
    ///
    /// [`stop`]: Dispatcher::stop
    pub fn run(&mut self) -> i32 {
        let Some(mut poller) = self.poller.try_lock() else {
            error!("dispatch loop is already running");
            return -1;
        };
        run_loop(&self.core, &mut poller, None, false)
    }

    /// One wait/dispatch cycle on the calling thread, for callers with
    /// their own outer loop.
    pub fn run_once(&mut self) -> i32 {
        let Some(mut poller) = self.poller.try_lock() else {
            error!("dispatch loop is already running");
            return -1;
        };
        run_loop(&self.core, &mut poller, None, true)
    }

    /// Request loop exit from any thread. The first effective stop sets
    /// the exit code.
    pub fn stop(&self, exit_code: i32) {
        self.core.lock().stop(exit_code);
        let _ = self.stop_tx.try_send(());
    }

    /// Move the dispatch loop onto a named background thread. On spawn
    /// failure the dispatcher stays usable single-threaded.
    pub fn start_thread(&mut self, priority_boost: bool) -> io::Result<()> {
        self.spawn_thread(priority_boost, None)
    }

    /// Like [`start_thread`], but the background thread only waits:
    /// every ready set is handed to the returned [`Controller`], whose
    /// owner runs the callbacks and the timer tick on its own thread.
    ///
    /// [`start_thread`]: Dispatcher::start_thread
    pub fn start_thread_controlled(&mut self, priority_boost: bool) -> io::Result<Controller> {
        let (ready_tx, ready_rx) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        let handoff = Handoff {
            ready_tx,
            done_rx,
            stop_rx: self.stop_rx.clone(),
        };
        self.spawn_thread(priority_boost, Some(handoff))?;
        Ok(Controller {
            core: Arc::clone(&self.core),
            ready_rx,
            done_tx,
        })
    }

    fn spawn_thread(&mut self, priority_boost: bool, handoff: Option<Handoff>) -> io::Result<()> {
        if self.thread.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "dispatcher thread already running",
            ));
        }
        {
            let mut core = self.core.lock();
            core.set_priority_boost(priority_boost);
            core.set_threaded(true);
        }
        // discard stop signals left over from a previous run
        while self.stop_rx.try_recv().is_ok() {}
        let core = Arc::clone(&self.core);
        let poller = Arc::clone(&self.poller);
        let spawned = thread::Builder::new()
            .name("evloop-dispatch".into())
            .spawn(move || {
                let Some(mut poller) = poller.try_lock() else {
                    error!("dispatch loop is already running");
                    return -1;
                };
                run_loop(&core, &mut poller, handoff.as_ref(), false)
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.core.lock().set_threaded(false);
                Err(e)
            }
        }
    }

    /// Wait for the background thread and return its exit code. The
    /// dispatcher is reusable afterwards.
    pub fn join(&mut self) -> i32 {
        match self.thread.take() {
            Some(handle) => {
                let code = match handle.join() {
                    Ok(code) => code,
                    Err(_) => {
                        error!("dispatch thread panicked");
                        -1
                    }
                };
                self.core.lock().set_threaded(false);
                code
            }
            None => self.core.lock().exit_code(),
        }
    }

    /// Park the reactor and take exclusive access to its core. The
    /// reactor resumes when the guard drops.
    ///
    /// Foreign threads only: a dispatch callback already holds the core
    /// (it receives `&mut Reactor`), so suspending from inside one
    /// deadlocks.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        SuspendGuard {
            guard: self.core.lock(),
        }
    }

    /// A cloneable handle for foreign threads.
    pub fn handle(&self) -> Handle {
        Handle {
            core: Arc::clone(&self.core),
            stop_tx: self.stop_tx.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.lock().is_running()
    }

    pub fn is_pending(&self) -> bool {
        self.core.lock().is_pending()
    }

    pub fn set_precise_timing(&self, on: bool) {
        self.core.lock().set_precise_timing(on);
    }

    /// Apply the best-effort priority boost to the calling thread right
    /// away, independent of the loop's own boost flag.
    pub fn boost_priority(&self) {
        boost_priority();
    }

    // Convenience wrappers; each parks the reactor for the duration of
    // the call, so they are safe while a background thread runs.

    pub fn activate_timer(&self, timer: Timer) -> TimerHandle {
        self.suspend().activate_timer(timer)
    }

    pub fn deactivate_timer(&self, handle: TimerHandle) -> bool {
        self.suspend().deactivate_timer(handle)
    }

    pub fn register_socket(
        &self,
        socket: &impl AsRawFd,
        flags: Flags,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        self.suspend().register_socket(socket, flags, callback)
    }

    pub fn register_channel(
        &self,
        input: Option<RawFd>,
        output: Option<RawFd>,
        flags: Flags,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        self.suspend().register_channel(input, output, flags, callback)
    }

    pub fn install_generic_input(
        &self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        self.suspend().install_generic_input(fd, callback)
    }

    pub fn install_generic_output(
        &self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        self.suspend().install_generic_output(fd, callback)
    }

    pub fn register_event(
        &self,
        event: &Event,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        self.suspend().register_event(event, callback)
    }

    pub fn deregister(&self, fd: RawFd) -> bool {
        self.suspend().deregister(fd)
    }
}

/// Exclusive access to a parked reactor core; wakes the dispatch loop
/// when dropped.
pub struct SuspendGuard<'a> {
    guard: MutexGuard<'a, Reactor>,
}

impl Deref for SuspendGuard<'_> {
    type Target = Reactor;

    fn deref(&self) -> &Reactor {
        &self.guard
    }
}

impl DerefMut for SuspendGuard<'_> {
    fn deref_mut(&mut self) -> &mut Reactor {
        &mut self.guard
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.guard.wake();
    }
}

/// Cheap cloneable access to a running dispatcher from other threads.
///
/// Every method takes the core lock, so handles are for foreign threads
/// only: calling [`suspend`](Handle::suspend) or
/// [`prompt`](Handle::prompt) from a dispatch callback on the reactor
/// thread deadlocks. Callbacks already receive `&mut Reactor` and need
/// no handle.
#[derive(Clone)]
pub struct Handle {
    core: Arc<Mutex<Reactor>>,
    stop_tx: Sender<()>,
}

impl Handle {
    /// See [`Dispatcher::suspend`]; the same foreign-thread-only rule
    /// applies.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        SuspendGuard {
            guard: self.core.lock(),
        }
    }

    pub fn stop(&self, exit_code: i32) {
        self.core.lock().stop(exit_code);
        let _ = self.stop_tx.try_send(());
    }

    /// Run `f` on the dispatching thread at the next safe point.
    pub fn prompt(&self, f: impl FnOnce(&mut Reactor) + Send + 'static) {
        let mut core = self.core.lock();
        core.prompt(f);
        core.wake();
    }

    pub fn is_running(&self) -> bool {
        self.core.lock().is_running()
    }

    pub fn is_pending(&self) -> bool {
        self.core.lock().is_pending()
    }
}

/// Reactor-side half of the controlled hand-off.
struct Handoff {
    ready_tx: Sender<Vec<ReadyEvent>>,
    done_rx: Receiver<()>,
    stop_rx: Receiver<()>,
}

impl Handoff {
    /// Hand the ready set to the controller and wait for it to finish
    /// dispatching. A stop signal releases a parked reactor; a dropped
    /// controller gives the events back for self-dispatch.
    fn relinquish(&self, events: Vec<ReadyEvent>) -> Result<(), Vec<ReadyEvent>> {
        select! {
            send(self.ready_tx, events) -> res => match res {
                Ok(()) => {
                    let _ = self.done_rx.recv();
                    Ok(())
                }
                Err(err) => Err(err.into_inner()),
            },
            recv(self.stop_rx) -> _ => Ok(()),
        }
    }
}

/// Dispatch side of [`Dispatcher::start_thread_controlled`]: callbacks
/// and the timer tick run on whatever thread drives this.
pub struct Controller {
    core: Arc<Mutex<Reactor>>,
    ready_rx: Receiver<Vec<ReadyEvent>>,
    done_tx: Sender<()>,
}

impl Controller {
    /// Block for the next cycle and dispatch it. Returns `false` once
    /// the dispatcher has exited.
    pub fn dispatch_next(&self) -> bool {
        match self.ready_rx.recv() {
            Ok(events) => {
                self.dispatch(events);
                true
            }
            Err(_) => false,
        }
    }

    /// Non-blocking variant for callers with their own event pump.
    pub fn try_dispatch(&self) -> bool {
        match self.ready_rx.try_recv() {
            Ok(events) => {
                self.dispatch(events);
                true
            }
            Err(_) => false,
        }
    }

    fn dispatch(&self, events: Vec<ReadyEvent>) {
        {
            let mut core = self.core.lock();
            core.dispatch_ready(&events);
            core.run_timers();
        }
        let _ = self.done_tx.send(());
    }
}

fn run_loop(
    core: &Arc<Mutex<Reactor>>,
    poller: &mut Poller,
    handoff: Option<&Handoff>,
    one_shot: bool,
) -> i32 {
    {
        let mut guard = core.lock();
        guard.begin_run(one_shot);
        if guard.wants_priority_boost() {
            boost_priority();
        }
    }
    loop {
        let timeout = {
            let guard = core.lock();
            if !guard.is_pending() {
                // an unthreaded loop with nothing to wait on would
                // block forever; exit instead
                warn!("nothing left to dispatch; loop exiting");
                break;
            }
            guard.wait_timeout(TimeValue::now())
        };
        // the lock stays free while we block, so other threads can park
        // the reactor and mutate its state
        poller.wait(timeout);
        match handoff {
            Some(handoff) => {
                core.lock().drain_prompts();
                let events = poller.take_ready();
                if let Err(events) = handoff.relinquish(events) {
                    // controller went away; dispatch on this thread
                    let mut guard = core.lock();
                    guard.dispatch_ready(&events);
                    guard.run_timers();
                }
            }
            None => {
                let mut guard = core.lock();
                guard.drain_prompts();
                guard.dispatch_ready(poller.ready());
                guard.run_timers();
            }
        }
        if !core.lock().is_running() {
            break;
        }
    }
    core.lock().end_run()
}
