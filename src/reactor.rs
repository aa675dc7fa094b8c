use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use mio::{Interest, Waker};

use crate::event::{self, Event};
use crate::poller::{ReadyEvent, Registrar, WAKE_TOKEN};
use crate::stream::{Direction, Flags, IoCallback, Kind, Stream, StreamTable};
use crate::time::TimeValue;
use crate::timer::{Fire, Timer, TimerHandle, TimerMgr};

/// Below this delay, precise-timing mode polls with a zero timeout
/// instead of blocking.
const PRECISE_THRESHOLD: Duration = Duration::from_millis(10);

type Prompt = Box<dyn FnOnce(&mut Reactor) + Send>;

/// The shared mutable core: timer engine, stream registry, and run
/// flags, all behind one mutex owned by the [`Dispatcher`].
///
/// Callbacks receive `&mut Reactor` and may freely register, deregister,
/// activate, deactivate, or stop from inside a dispatch pass.
///
/// [`Dispatcher`]: crate::Dispatcher
pub struct Reactor {
    pub(crate) timers: TimerMgr,
    streams: StreamTable,
    registrar: Registrar,
    waker: Arc<Waker>,
    running: bool,
    exit_code: i32,
    threaded: bool,
    precise_timing: bool,
    priority_boost: bool,
    prompts: Vec<Prompt>,
}

impl Reactor {
    pub(crate) fn new(registrar: Registrar, waker: Arc<Waker>) -> Reactor {
        Reactor {
            timers: TimerMgr::new(),
            streams: StreamTable::new(),
            registrar,
            waker,
            running: false,
            exit_code: 0,
            threaded: false,
            precise_timing: false,
            priority_boost: false,
            prompts: Vec::new(),
        }
    }

    // ---- timers ----

    pub fn activate_timer(&mut self, timer: Timer) -> TimerHandle {
        self.timers.activate(timer, TimeValue::now())
    }

    /// Idempotent; a stale handle is a no-op and returns `false`.
    pub fn deactivate_timer(&mut self, handle: TimerHandle) -> bool {
        self.timers.deactivate(handle)
    }

    pub fn timer_is_active(&self, handle: TimerHandle) -> bool {
        self.timers.is_active(handle)
    }

    /// Reset an active timer's deadline to now + interval, keeping its
    /// repeat count. Legal from the timer's own callback (return `false`
    /// from the callback afterwards).
    pub fn reschedule_timer(&mut self, handle: TimerHandle) -> bool {
        self.timers.reschedule(handle, TimeValue::now())
    }

    pub fn set_timer_interval(&mut self, handle: TimerHandle, interval: Duration) -> bool {
        self.timers.set_interval(handle, interval)
    }

    pub fn set_timer_repeat(&mut self, handle: TimerHandle, repeat: i32) -> bool {
        self.timers.set_repeat(handle, repeat)
    }

    /// Delay until the earliest timer deadline; `None` when no timer is
    /// pending.
    pub fn timer_remaining(&self) -> Option<Duration> {
        self.timers.time_remaining(TimeValue::now())
    }

    // ---- stream registration ----

    pub fn register_socket(
        &mut self,
        socket: &impl AsRawFd,
        flags: Flags,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        self.update_stream(Kind::Socket, fd, fd, flags, Some(Box::new(callback)))
    }

    /// Channels may carry distinct input and output descriptors; either
    /// side may be absent.
    pub fn register_channel(
        &mut self,
        input: Option<RawFd>,
        output: Option<RawFd>,
        flags: Flags,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        self.update_stream(
            Kind::Channel,
            input.unwrap_or(-1),
            output.unwrap_or(-1),
            flags,
            Some(Box::new(callback)),
        )
    }

    pub fn install_generic_input(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        let flags = match self.current_flags(fd) {
            Some(f) => f.with(Flags::INPUT),
            None => Flags::INPUT,
        };
        self.update_stream(Kind::Generic, fd, fd, flags, Some(Box::new(callback)))
    }

    pub fn install_generic_output(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        let flags = match self.current_flags(fd) {
            Some(f) => f.with(Flags::OUTPUT),
            None => Flags::OUTPUT,
        };
        self.update_stream(Kind::Generic, fd, fd, flags, Some(Box::new(callback)))
    }

    pub fn remove_generic_input(&mut self, fd: RawFd) {
        if let Some(flags) = self.current_flags(fd) {
            if let Err(e) = self.update_stream(Kind::Generic, fd, fd, flags.without(Flags::INPUT), None)
            {
                warn!("removing input notification for fd {} failed: {}", fd, e);
            }
        }
    }

    pub fn remove_generic_output(&mut self, fd: RawFd) {
        if let Some(flags) = self.current_flags(fd) {
            if let Err(e) =
                self.update_stream(Kind::Generic, fd, fd, flags.without(Flags::OUTPUT), None)
            {
                warn!("removing output notification for fd {} failed: {}", fd, e);
            }
        }
    }

    /// Register a cross-thread [`Event`]; the callback fires after the
    /// event auto-resets.
    pub fn register_event(
        &mut self,
        event: &Event,
        callback: impl FnMut(&mut Reactor, RawFd, Direction) + Send + 'static,
    ) -> io::Result<()> {
        let fd = event.read_fd();
        self.update_stream(Kind::Event, fd, fd, Flags::INPUT, Some(Box::new(callback)))
    }

    /// Replace a registered descriptor's notification set. An empty set
    /// releases the registration.
    pub fn set_flags(&mut self, fd: RawFd, flags: Flags) -> io::Result<()> {
        if self.streams.lookup(fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor not registered",
            ));
        }
        self.update_stream(Kind::Generic, fd, fd, flags, None)
    }

    /// Drop a registration entirely, whatever its kind. Returns `false`
    /// if the descriptor was not registered.
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        if self.streams.lookup(fd).is_none() {
            return false;
        }
        // releasing never fails: backend errors are logged in the drop path
        let _ = self.update_stream(Kind::Generic, fd, fd, Flags::NONE, None);
        true
    }

    fn current_flags(&self, fd: RawFd) -> Option<Flags> {
        let slot = self.streams.lookup(fd)?;
        self.streams.get(slot).map(|s| s.flags)
    }

    /// Single entry point for registration changes. The requested flag
    /// set *replaces* the previous one; zero flags return the record to
    /// the pool. On backend failure the previous state is restored, so
    /// no partial registration survives.
    fn update_stream(
        &mut self,
        kind: Kind,
        input_fd: RawFd,
        output_fd: RawFd,
        flags: Flags,
        callback: Option<IoCallback>,
    ) -> io::Result<()> {
        let existing = self
            .streams
            .lookup(input_fd)
            .or_else(|| self.streams.lookup(output_fd));
        match existing {
            Some(slot) => {
                let (old_in, old_out, old_flags) = {
                    let Some(s) = self.streams.get(slot) else {
                        return Ok(());
                    };
                    (s.input_fd, s.output_fd, s.flags)
                };
                self.drop_registrations(old_in, old_out, old_flags);
                if flags.is_empty() {
                    self.streams.remove(slot);
                    return Ok(());
                }
                // a re-registration (callback supplied) may carry a new
                // descriptor pair; flag-only updates keep the old one
                let (new_in, new_out) = if callback.is_some() {
                    (input_fd, output_fd)
                } else {
                    (old_in, old_out)
                };
                if let Err(e) = self.apply_registrations(slot, new_in, new_out, flags) {
                    if self
                        .apply_registrations(slot, old_in, old_out, old_flags)
                        .is_err()
                    {
                        self.streams.remove(slot);
                    }
                    return Err(e);
                }
                if (new_in, new_out) != (old_in, old_out) {
                    self.streams.rebind(slot, new_in, new_out);
                }
                if let Some(s) = self.streams.get_mut(slot) {
                    s.flags = flags;
                    if let Some(cb) = callback {
                        s.kind = kind;
                        s.callback = Some(cb);
                    }
                }
                Ok(())
            }
            None => {
                if flags.is_empty() {
                    return Ok(());
                }
                let Some(cb) = callback else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "new registration needs a callback",
                    ));
                };
                let slot = self.streams.insert(Stream {
                    kind,
                    flags,
                    input_fd,
                    output_fd,
                    seq: 0,
                    callback: Some(cb),
                });
                if let Err(e) = self.apply_registrations(slot, input_fd, output_fd, flags) {
                    self.streams.remove(slot);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn apply_registrations(
        &self,
        slot: usize,
        input_fd: RawFd,
        output_fd: RawFd,
        flags: Flags,
    ) -> io::Result<()> {
        let regs = wanted_registrations(input_fd, output_fd, flags);
        for (idx, (fd, interest)) in regs.iter().enumerate() {
            if let Err(e) = self.registrar.add(*fd, slot, *interest) {
                for (done, _) in &regs[..idx] {
                    let _ = self.registrar.remove(*done);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn drop_registrations(&self, input_fd: RawFd, output_fd: RawFd, flags: Flags) {
        for (fd, _) in wanted_registrations(input_fd, output_fd, flags) {
            if let Err(e) = self.registrar.remove(fd) {
                debug!("backend deregister of fd {} failed: {}", fd, e);
            }
        }
    }

    // ---- run control ----

    /// Request loop exit. The first effective stop sets the exit code;
    /// later stops are no-ops.
    pub fn stop(&mut self, exit_code: i32) {
        if self.running {
            self.exit_code = exit_code;
            self.running = false;
        }
        self.wake();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the loop has anything left to wait on. A threaded
    /// dispatcher is always pending (its owner may add work later).
    pub fn is_pending(&self) -> bool {
        self.threaded || !self.streams.is_empty() || self.timers.has_active()
    }

    pub fn set_precise_timing(&mut self, on: bool) {
        self.precise_timing = on;
    }

    pub fn set_priority_boost(&mut self, on: bool) {
        self.priority_boost = on;
    }

    /// Queue a closure to run on the dispatching thread at the next safe
    /// point. Prefer [`Handle::prompt`](crate::Handle::prompt), which
    /// also wakes the loop.
    pub fn prompt(&mut self, f: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.prompts.push(Box::new(f));
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("wake failed: {}", e);
        }
    }

    pub(crate) fn begin_run(&mut self, one_shot: bool) {
        self.exit_code = 0;
        self.running = !one_shot;
    }

    pub(crate) fn end_run(&mut self) -> i32 {
        self.running = false;
        self.exit_code
    }

    pub(crate) fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub(crate) fn set_threaded(&mut self, threaded: bool) {
        self.threaded = threaded;
    }

    pub(crate) fn wants_priority_boost(&self) -> bool {
        self.priority_boost
    }

    /// Delay to hand the wait backend; `None` blocks indefinitely.
    pub(crate) fn wait_timeout(&self, now: TimeValue) -> Option<Duration> {
        let remaining = self.timers.time_remaining(now)?;
        if self.precise_timing && remaining < PRECISE_THRESHOLD {
            Some(Duration::ZERO)
        } else {
            Some(remaining)
        }
    }

    // ---- dispatch ----

    pub(crate) fn drain_prompts(&mut self) {
        while !self.prompts.is_empty() {
            for f in std::mem::take(&mut self.prompts) {
                f(self);
            }
        }
    }

    pub(crate) fn dispatch_ready(&mut self, events: &[ReadyEvent]) {
        // snapshot each ready slot's generation before any callback
        // runs: a callback may free a slot and a later registration may
        // reuse it, and the reused slot must not inherit this pass's
        // readiness
        let pass: Vec<(usize, u64, bool, bool)> = events
            .iter()
            .filter(|ev| ev.token != WAKE_TOKEN.0)
            .filter_map(|ev| {
                self.streams
                    .get(ev.token)
                    .map(|s| (ev.token, s.seq, ev.readable, ev.writable))
            })
            .collect();
        for (slot, seq, readable, writable) in pass {
            if readable {
                self.dispatch_one(slot, seq, Direction::Input);
            }
            if writable {
                self.dispatch_one(slot, seq, Direction::Output);
            }
        }
    }

    fn dispatch_one(&mut self, slot: usize, seq: u64, direction: Direction) {
        // deregistered, or freed and reused, earlier in this pass
        let Some(stream) = self.streams.get(slot) else {
            return;
        };
        if stream.seq != seq {
            return;
        }
        let wanted = match direction {
            Direction::Input => stream.flags.is_input(),
            Direction::Output => stream.flags.is_output(),
        };
        if !wanted {
            return;
        }
        let fd = match direction {
            Direction::Input => stream.input_fd,
            Direction::Output => stream.output_fd,
        };
        if stream.kind == Kind::Event {
            event::drain(fd); // auto-reset before the callback sees it
        }
        let Some((mut callback, seq)) = self.streams.take_callback(slot) else {
            return;
        };
        callback(self, fd, direction);
        self.streams.restore_callback(slot, seq, callback);
    }

    pub(crate) fn run_timers(&mut self) {
        self.run_timers_at(TimeValue::now());
    }

    pub(crate) fn run_timers_at(&mut self, now: TimeValue) {
        while let Some(slot) = self.timers.due_head(now) {
            match self.timers.begin_fire(slot) {
                Some(Fire::Pulse) => self.timers.on_pulse(now),
                Some(Fire::User { mut callback, seq }) => {
                    let handle = TimerHandle::new(slot, seq);
                    let keep = callback(self, handle);
                    self.timers.finish_fire(slot, seq, callback, keep, now);
                }
                None => break,
            }
        }
    }
}

/// Backend registrations a record with these descriptors and flags
/// needs: one combined entry when both sides share a descriptor, one
/// per side otherwise.
fn wanted_registrations(input_fd: RawFd, output_fd: RawFd, flags: Flags) -> Vec<(RawFd, Interest)> {
    let mut out = Vec::with_capacity(2);
    if input_fd >= 0 && input_fd == output_fd {
        let mut interest = None;
        if flags.is_input() {
            interest = join_interest(interest, Interest::READABLE);
        }
        if flags.is_output() {
            interest = join_interest(interest, Interest::WRITABLE);
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if flags.contains(Flags::EXCEPTION) {
            interest = join_interest(interest, Interest::PRIORITY);
        }
        if let Some(i) = interest {
            out.push((input_fd, i));
        }
    } else {
        if input_fd >= 0 && flags.is_input() {
            out.push((input_fd, Interest::READABLE));
        }
        if output_fd >= 0 && flags.is_output() {
            out.push((output_fd, Interest::WRITABLE));
        }
    }
    out
}

fn join_interest(acc: Option<Interest>, add: Interest) -> Option<Interest> {
    Some(match acc {
        Some(i) => i | add,
        None => add,
    })
}

/// Best-effort realtime boost for the dispatching thread: `SCHED_FIFO`
/// where available, falling back to a nicer nice value. Failure is a
/// warning, never an error.
pub(crate) fn boost_priority() {
    if try_boost() {
        debug!("dispatch thread priority boosted");
    } else {
        warn!(
            "priority boost failed: {} (run with elevated privileges?)",
            io::Error::last_os_error()
        );
    }
}

#[cfg(unix)]
fn try_boost() -> bool {
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param {
            sched_priority: unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) } / 2,
        };
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } == 0 {
            return true;
        }
    }
    unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) == 0 }
}

#[cfg(not(unix))]
fn try_boost() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core() -> (Reactor, Poller) {
        let poller = Poller::new().unwrap();
        let waker = Arc::new(poller.waker().unwrap());
        let reactor = Reactor::new(poller.registrar().unwrap(), waker);
        (reactor, poller)
    }

    #[test]
    fn repeating_timer_fires_without_drift() {
        let (mut core, _poller) = core();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let t0 = TimeValue::now();
        let interval = 0.005;
        let handle = core.timers.activate(
            Timer::repeating(Duration::from_micros(5_000), -1, move |_, _| {
                count.fetch_add(1, Ordering::Relaxed);
                true
            }),
            t0,
        );
        for k in 1..=1000u32 {
            let now = t0.add_secs(k as f64 * interval + 1.0e-4);
            core.run_timers_at(now);
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1000);
        // after 1000 firings the deadline is exactly t0 + 1001 intervals
        let deadline = core.timers.deadline(handle).unwrap();
        assert!((deadline.delta(t0) - 1001.0 * interval).abs() < 1.0e-4);
    }

    #[test]
    fn repeat_count_limits_firings() {
        let (mut core, _poller) = core();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let t0 = TimeValue::now();
        let handle = core.timers.activate(
            Timer::repeating(Duration::from_millis(10), 2, move |_, _| {
                count.fetch_add(1, Ordering::Relaxed);
                true
            }),
            t0,
        );
        for k in 1..=10u32 {
            core.run_timers_at(t0.add_secs(k as f64 * 0.010 + 1.0e-4));
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3); // repeat = 2 fires 3 times
        assert!(!core.timer_is_active(handle));
        assert!(!core.timers.has_active());
    }

    #[test]
    fn long_timer_fires_through_pulse_migration() {
        let (mut core, _poller) = core();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let t0 = TimeValue::now();
        core.timers.activate(
            Timer::new(Duration::from_millis(1_500), move |_, _| {
                count.fetch_add(1, Ordering::Relaxed);
                true
            }),
            t0,
        );
        core.run_timers_at(t0.add_secs(0.5));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        // pulse tick migrates the deadline onto the real clock
        core.run_timers_at(t0.add_secs(1.001));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
        core.run_timers_at(t0.add_secs(1.55));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!core.timers.has_active());
    }

    #[test]
    fn callback_can_deactivate_itself() {
        let (mut core, _poller) = core();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let t0 = TimeValue::now();
        core.timers.activate(
            Timer::repeating(Duration::from_millis(10), -1, move |reactor, handle| {
                count.fetch_add(1, Ordering::Relaxed);
                reactor.deactivate_timer(handle);
                false
            }),
            t0,
        );
        for k in 1..=5u32 {
            core.run_timers_at(t0.add_secs(k as f64 * 0.010 + 1.0e-4));
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!core.timers.has_active());
    }

    #[test]
    fn unregisterable_descriptor_rolls_back() {
        let (mut core, _poller) = core();
        // epoll rejects regular files, which makes a handy failure source
        let file = std::fs::File::open("Cargo.toml").unwrap();
        let fd = file.as_raw_fd();
        let err = core.install_generic_input(fd, |_, _, _| {});
        assert!(err.is_err());
        assert!(!core.deregister(fd)); // no record survived
        assert!(!core.is_pending());
    }

    #[test]
    fn generic_install_accumulates_directions() {
        let (mut core, _poller) = core();
        let event = Event::new().unwrap();
        let fd = event.read_fd();
        core.install_generic_input(fd, |_, _, _| {}).unwrap();
        core.install_generic_output(fd, |_, _, _| {}).unwrap();
        assert_eq!(core.current_flags(fd), Some(Flags::INPUT | Flags::OUTPUT));
        core.remove_generic_output(fd);
        assert_eq!(core.current_flags(fd), Some(Flags::INPUT));
        core.remove_generic_input(fd);
        assert_eq!(core.current_flags(fd), None);
        assert!(!core.is_pending());
    }

    #[test]
    fn channel_reregistration_moves_to_new_descriptors() {
        let (mut core, _poller) = core();
        let shared = Event::new().unwrap();
        let old_out = Event::new().unwrap();
        let new_out = Event::new().unwrap();
        core.register_channel(
            Some(shared.read_fd()),
            Some(old_out.read_fd()),
            Flags::INPUT | Flags::OUTPUT,
            |_, _, _| {},
        )
        .unwrap();
        // re-register with a different output side; the old one must be
        // fully released
        core.register_channel(
            Some(shared.read_fd()),
            Some(new_out.read_fd()),
            Flags::INPUT | Flags::OUTPUT,
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!(core.current_flags(old_out.read_fd()), None);
        assert_eq!(
            core.current_flags(new_out.read_fd()),
            Some(Flags::INPUT | Flags::OUTPUT)
        );
        assert!(core.deregister(shared.read_fd()));
        assert_eq!(core.current_flags(new_out.read_fd()), None);
        assert!(!core.is_pending());
    }

    #[test]
    fn first_stop_wins() {
        let (mut core, _poller) = core();
        core.begin_run(false);
        assert!(core.is_running());
        core.stop(42);
        core.stop(7);
        assert!(!core.is_running());
        assert_eq!(core.end_run(), 42);
    }
}
