use std::time::Duration;

use log::warn;
use slab::Slab;

use crate::reactor::Reactor;
use crate::time::TimeValue;

/// Timers due within this horizon live in the short list on the real
/// clock; anything later waits in the long list on the pulse clock.
const SHORT_HORIZON: f64 = 1.0;

/// The pulse advances the pulse clock by exactly this much per fire.
const PULSE_INTERVAL: f64 = 1.0;

/// Deadlines within a microsecond are treated as due.
const DUE_TOLERANCE: f64 = 1.0e-6;

/// Timer callbacks run on the dispatching thread with full access to the
/// reactor core. Returning `true` applies the default repeat policy;
/// returning `false` means the callback already adjusted (or deactivated)
/// its own schedule.
pub type TimerCallback = Box<dyn FnMut(&mut Reactor, TimerHandle) -> bool + Send>;

/// A software timer, created detached and handed to
/// [`Reactor::activate_timer`](crate::Reactor::activate_timer).
pub struct Timer {
    pub(crate) interval: f64,
    pub(crate) repeat: i32,
    pub(crate) callback: TimerCallback,
}

impl Timer {
    /// One-shot timer firing once after `interval`.
    pub fn new(
        interval: Duration,
        callback: impl FnMut(&mut Reactor, TimerHandle) -> bool + Send + 'static,
    ) -> Timer {
        Timer {
            interval: interval.as_secs_f64(),
            repeat: 0,
            callback: Box::new(callback),
        }
    }

    /// Repeating timer. `repeat = N` fires N+1 times; `repeat = -1` fires
    /// until deactivated.
    pub fn repeating(
        interval: Duration,
        repeat: i32,
        callback: impl FnMut(&mut Reactor, TimerHandle) -> bool + Send + 'static,
    ) -> Timer {
        Timer {
            interval: interval.as_secs_f64(),
            repeat,
            callback: Box::new(callback),
        }
    }
}

/// Generation-stamped reference to an active timer. Stale handles (the
/// timer fired out or was deactivated) are inert.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle {
    slot: usize,
    seq: u64,
}

impl TimerHandle {
    pub(crate) fn new(slot: usize, seq: u64) -> TimerHandle {
        TimerHandle { slot, seq }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum List {
    Short,
    Long,
}

enum Payload {
    /// `None` while the callback is checked out for firing.
    User(Option<TimerCallback>),
    Pulse,
}

struct Entry {
    interval: f64,
    repeat: i32,
    repeat_count: i32,
    /// Absolute deadline: real clock in the short list, pulse clock in
    /// the long list.
    timeout: TimeValue,
    list: List,
    prev: Option<usize>,
    next: Option<usize>,
    seq: u64,
    payload: Payload,
}

#[derive(Default, Clone, Copy)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
}

/// What the dispatch loop found at the head of the short list.
pub(crate) enum Fire {
    User { callback: TimerCallback, seq: u64 },
    Pulse,
}

/// The timer engine: a slab arena of entries threaded onto two sorted
/// intrusive lists (indices, not pointers).
pub(crate) struct TimerMgr {
    arena: Slab<Entry>,
    short: Ends,
    long: Ends,
    pulse: Option<usize>,
    pulse_mark: TimeValue,
    seq: u64,
}

impl TimerMgr {
    pub fn new() -> TimerMgr {
        TimerMgr {
            arena: Slab::new(),
            short: Ends::default(),
            long: Ends::default(),
            pulse: None,
            pulse_mark: TimeValue::ZERO,
            seq: 0,
        }
    }

    pub fn has_active(&self) -> bool {
        !self.arena.is_empty()
    }

    /// Time until the earliest deadline; `None` means wait indefinitely.
    pub fn time_remaining(&self, now: TimeValue) -> Option<Duration> {
        self.short
            .head
            .map(|h| self.arena[h].timeout.remaining(now))
    }

    pub fn activate(&mut self, timer: Timer, now: TimeValue) -> TimerHandle {
        self.seq += 1;
        let seq = self.seq;
        let repeat = timer.repeat;
        let slot = self.arena.insert(Entry {
            interval: timer.interval,
            repeat,
            repeat_count: repeat,
            timeout: now,
            list: List::Short,
            prev: None,
            next: None,
            seq,
            payload: Payload::User(Some(timer.callback)),
        });
        self.schedule_fresh(slot, now);
        TimerHandle { slot, seq }
    }

    /// Remove a timer from the active set. Idempotent: a stale handle is
    /// a no-op and returns `false`.
    pub fn deactivate(&mut self, handle: TimerHandle) -> bool {
        match self.arena.get(handle.slot) {
            Some(entry) if entry.seq == handle.seq => {
                let was_long = self.arena[handle.slot].list == List::Long;
                self.unlink(handle.slot);
                self.arena.remove(handle.slot);
                if was_long && self.long.head.is_none() {
                    self.retire_pulse();
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        matches!(self.arena.get(handle.slot), Some(e) if e.seq == handle.seq)
    }

    /// Reset an active timer's deadline to `now + interval`, keeping its
    /// repeat count. Legal from inside the timer's own callback (return
    /// `false` from the callback afterwards).
    pub fn reschedule(&mut self, handle: TimerHandle, now: TimeValue) -> bool {
        match self.arena.get(handle.slot) {
            Some(entry) if entry.seq == handle.seq => {
                let was_long = entry.list == List::Long;
                self.unlink(handle.slot);
                self.schedule_fresh(handle.slot, now);
                if was_long
                    && self.arena[handle.slot].list == List::Short
                    && self.long.head.is_none()
                {
                    self.retire_pulse();
                }
                true
            }
            _ => false,
        }
    }

    pub fn set_interval(&mut self, handle: TimerHandle, interval: Duration) -> bool {
        match self.arena.get_mut(handle.slot) {
            Some(entry) if entry.seq == handle.seq => {
                entry.interval = interval.as_secs_f64();
                true
            }
            _ => false,
        }
    }

    pub fn set_repeat(&mut self, handle: TimerHandle, repeat: i32) -> bool {
        match self.arena.get_mut(handle.slot) {
            Some(entry) if entry.seq == handle.seq => {
                entry.repeat = repeat;
                entry.repeat_count = repeat;
                true
            }
            _ => false,
        }
    }

    /// Head of the short list if its deadline has passed.
    pub fn due_head(&self, now: TimeValue) -> Option<usize> {
        let head = self.short.head?;
        (self.arena[head].timeout.delta(now) < DUE_TOLERANCE).then_some(head)
    }

    /// Check the due entry's callback out of the arena for firing.
    pub fn begin_fire(&mut self, slot: usize) -> Option<Fire> {
        let entry = self.arena.get_mut(slot)?;
        let seq = entry.seq;
        match &mut entry.payload {
            Payload::Pulse => Some(Fire::Pulse),
            Payload::User(cb) => cb.take().map(|callback| Fire::User { callback, seq }),
        }
    }

    /// Return a checked-out callback and apply the firing policy. If the
    /// slot was vacated (or reused) during the callback, the callback is
    /// simply dropped.
    pub fn finish_fire(
        &mut self,
        slot: usize,
        seq: u64,
        callback: TimerCallback,
        keep: bool,
        now: TimeValue,
    ) {
        let entry = match self.arena.get_mut(slot) {
            Some(entry) if entry.seq == seq => entry,
            _ => return,
        };
        if !keep {
            // The callback took care of its own rescheduling (or will
            // fire again immediately if it did not).
            if let Payload::User(cb) = &mut entry.payload {
                *cb = Some(callback);
            }
            return;
        }
        self.unlink(slot);
        let repeat_count = self.arena[slot].repeat_count;
        if repeat_count != 0 {
            if let Payload::User(cb) = &mut self.arena[slot].payload {
                *cb = Some(callback);
            }
            self.reactivate(slot, now);
            if repeat_count > 0 {
                self.arena[slot].repeat_count = repeat_count - 1;
            }
        } else {
            self.arena.remove(slot);
        }
    }

    /// The one-second pulse fired: advance the pulse clock, migrate long
    /// entries whose deadlines are now within the horizon, then either
    /// reschedule the pulse or retire it if nothing long remains.
    pub fn on_pulse(&mut self, now: TimeValue) {
        self.pulse_mark = self.pulse_mark.add_secs(PULSE_INTERVAL);
        let mut next = self.long.head;
        while let Some(slot) = next {
            let delta = self.arena[slot].timeout.delta(self.pulse_mark);
            if delta >= SHORT_HORIZON {
                break;
            }
            next = self.arena[slot].next;
            self.unlink(slot);
            self.arena[slot].timeout = now.add_secs(delta);
            self.link_sorted(slot, List::Short);
        }
        let Some(pulse) = self.pulse else { return };
        if self.long.head.is_none() {
            self.retire_pulse();
        } else {
            self.unlink(pulse);
            let timeout = self.arena[pulse].timeout.add_secs(PULSE_INTERVAL);
            self.arena[pulse].timeout = timeout;
            self.link_sorted(pulse, List::Short);
        }
    }

    fn schedule_fresh(&mut self, slot: usize, now: TimeValue) {
        let interval = self.arena[slot].interval;
        if interval <= SHORT_HORIZON {
            self.arena[slot].timeout = now.add_secs(interval);
            self.link_sorted(slot, List::Short);
        } else {
            self.ensure_pulse(now);
            // Long deadlines live on the pulse clock, quantized to the
            // end of the current pulse period.
            let timeout = self
                .pulse_mark
                .add_secs(interval + PULSE_INTERVAL - self.pulse_remaining(now));
            self.arena[slot].timeout = timeout;
            self.link_sorted(slot, List::Long);
        }
    }

    /// Default repeat rescheduling: short timers advance from the old
    /// deadline (drift-free), long timers from the current pulse time.
    fn reactivate(&mut self, slot: usize, now: TimeValue) {
        let interval = self.arena[slot].interval;
        if interval <= SHORT_HORIZON {
            let mut timeout = self.arena[slot].timeout.add_secs(interval);
            if timeout.delta(now) < -1.0 {
                warn!(
                    "timer fell behind real time (interval {:.3}s); resetting deadline",
                    interval
                );
                timeout = now;
            }
            self.arena[slot].timeout = timeout;
            self.link_sorted(slot, List::Short);
        } else {
            self.ensure_pulse(now);
            let timeout = self.pulse_time(now).add_secs(interval);
            self.arena[slot].timeout = timeout;
            self.link_sorted(slot, List::Long);
        }
    }

    fn ensure_pulse(&mut self, now: TimeValue) {
        if self.pulse.is_some() {
            return;
        }
        self.pulse_mark = now;
        self.seq += 1;
        let slot = self.arena.insert(Entry {
            interval: PULSE_INTERVAL,
            repeat: -1,
            repeat_count: -1,
            timeout: now.add_secs(PULSE_INTERVAL),
            list: List::Short,
            prev: None,
            next: None,
            seq: self.seq,
            payload: Payload::Pulse,
        });
        self.link_sorted(slot, List::Short);
        self.pulse = Some(slot);
    }

    fn retire_pulse(&mut self) {
        if let Some(slot) = self.pulse.take() {
            self.unlink(slot);
            self.arena.remove(slot);
        }
    }

    fn pulse_remaining(&self, now: TimeValue) -> f64 {
        match self.pulse {
            Some(slot) => self.arena[slot].timeout.delta(now).max(0.0),
            None => 0.0,
        }
    }

    /// Current time on the pulse clock.
    fn pulse_time(&self, now: TimeValue) -> TimeValue {
        self.pulse_mark
            .add_secs(PULSE_INTERVAL - self.pulse_remaining(now))
    }

    fn ends(&self, list: List) -> Ends {
        match list {
            List::Short => self.short,
            List::Long => self.long,
        }
    }

    fn set_ends(&mut self, list: List, ends: Ends) {
        match list {
            List::Short => self.short = ends,
            List::Long => self.long = ends,
        }
    }

    /// Sorted insert, scanning from the tail backwards since new timers
    /// usually carry the latest deadline. Ties keep insertion order.
    fn link_sorted(&mut self, slot: usize, list: List) {
        let timeout = self.arena[slot].timeout;
        let mut ends = self.ends(list);
        let mut after = ends.tail;
        while let Some(i) = after {
            if self.arena[i].timeout <= timeout {
                break;
            }
            after = self.arena[i].prev;
        }
        match after {
            Some(i) => {
                let next = self.arena[i].next;
                self.arena[slot].prev = Some(i);
                self.arena[slot].next = next;
                self.arena[i].next = Some(slot);
                match next {
                    Some(n) => self.arena[n].prev = Some(slot),
                    None => ends.tail = Some(slot),
                }
            }
            None => {
                self.arena[slot].prev = None;
                self.arena[slot].next = ends.head;
                match ends.head {
                    Some(h) => self.arena[h].prev = Some(slot),
                    None => ends.tail = Some(slot),
                }
                ends.head = Some(slot);
            }
        }
        self.arena[slot].list = list;
        self.set_ends(list, ends);
    }

    fn unlink(&mut self, slot: usize) {
        let (list, prev, next) = {
            let entry = &self.arena[slot];
            (entry.list, entry.prev, entry.next)
        };
        let mut ends = self.ends(list);
        match prev {
            Some(p) => self.arena[p].next = next,
            None => ends.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => ends.tail = prev,
        }
        self.arena[slot].prev = None;
        self.arena[slot].next = None;
        self.set_ends(list, ends);
    }

    #[cfg(test)]
    fn short_order(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut at = self.short.head;
        while let Some(i) = at {
            out.push(i);
            at = self.arena[i].next;
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn deadline(&self, handle: TimerHandle) -> Option<TimeValue> {
        self.arena
            .get(handle.slot)
            .filter(|e| e.seq == handle.seq)
            .map(|e| e.timeout)
    }
}
