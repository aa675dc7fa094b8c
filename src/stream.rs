use std::collections::HashMap;
use std::ops::BitOr;
use std::os::unix::io::RawFd;

use slab::Slab;

use crate::reactor::Reactor;

/// I/O callbacks run on the dispatching thread with full access to the
/// reactor core, so they may register or deregister other resources.
pub type IoCallback = Box<dyn FnMut(&mut Reactor, RawFd, Direction) + Send>;

/// Which readiness edge a callback is being invoked for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Input,
    Output,
}

/// What kind of resource a stream record tracks. The set is closed on
/// purpose: dispatch switches on it exhaustively.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Socket,
    Channel,
    Generic,
    Event,
}

/// Requested notification set for a registered resource.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const INPUT: Flags = Flags(0x01);
    pub const OUTPUT: Flags = Flags(0x02);
    pub const EXCEPTION: Flags = Flags(0x04);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_input(self) -> bool {
        self.contains(Flags::INPUT)
    }

    pub fn is_output(self) -> bool {
        self.contains(Flags::OUTPUT)
    }

    pub fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    pub fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.with(rhs)
    }
}

/// Bookkeeping record for one registered resource. The registry owns the
/// record; the underlying descriptor stays owned by application code.
pub(crate) struct Stream {
    pub kind: Kind,
    pub flags: Flags,
    /// Input and output descriptors are the same except for channels,
    /// which may carry a distinct pair. A negative fd means "no side".
    pub input_fd: RawFd,
    pub output_fd: RawFd,
    pub seq: u64,
    /// `None` while the callback is checked out for dispatch.
    pub callback: Option<IoCallback>,
}

/// Slab-pooled stream records with descriptor lookup. Removed records
/// return their slot to the slab free list, so steady-state register/
/// deregister churn does not allocate.
pub(crate) struct StreamTable {
    slots: Slab<Stream>,
    by_fd: HashMap<RawFd, usize>,
    seq: u64,
}

impl StreamTable {
    pub fn new() -> StreamTable {
        StreamTable {
            slots: Slab::new(),
            by_fd: HashMap::new(),
            seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn lookup(&self, fd: RawFd) -> Option<usize> {
        if fd < 0 {
            return None;
        }
        self.by_fd.get(&fd).copied()
    }

    pub fn get(&self, slot: usize) -> Option<&Stream> {
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Stream> {
        self.slots.get_mut(slot)
    }

    pub fn insert(&mut self, mut stream: Stream) -> usize {
        self.seq += 1;
        stream.seq = self.seq;
        let input_fd = stream.input_fd;
        let output_fd = stream.output_fd;
        let slot = self.slots.insert(stream);
        if input_fd >= 0 {
            self.by_fd.insert(input_fd, slot);
        }
        if output_fd >= 0 {
            self.by_fd.insert(output_fd, slot);
        }
        slot
    }

    pub fn remove(&mut self, slot: usize) -> Option<Stream> {
        let stream = self.slots.try_remove(slot)?;
        if stream.input_fd >= 0 {
            self.by_fd.remove(&stream.input_fd);
        }
        if stream.output_fd >= 0 {
            self.by_fd.remove(&stream.output_fd);
        }
        Some(stream)
    }

    /// Repoint a record at a new descriptor pair, keeping its slot and
    /// generation.
    pub fn rebind(&mut self, slot: usize, input_fd: RawFd, output_fd: RawFd) {
        let Some(stream) = self.slots.get_mut(slot) else {
            return;
        };
        let old_in = stream.input_fd;
        let old_out = stream.output_fd;
        stream.input_fd = input_fd;
        stream.output_fd = output_fd;
        if old_in >= 0 {
            self.by_fd.remove(&old_in);
        }
        if old_out >= 0 {
            self.by_fd.remove(&old_out);
        }
        if input_fd >= 0 {
            self.by_fd.insert(input_fd, slot);
        }
        if output_fd >= 0 {
            self.by_fd.insert(output_fd, slot);
        }
    }

    pub fn take_callback(&mut self, slot: usize) -> Option<(IoCallback, u64)> {
        let stream = self.slots.get_mut(slot)?;
        let seq = stream.seq;
        stream.callback.take().map(|cb| (cb, seq))
    }

    /// Hand a checked-out callback back, unless the slot was vacated or
    /// reused for a different stream while the callback ran.
    pub fn restore_callback(&mut self, slot: usize, seq: u64, callback: IoCallback) {
        if let Some(stream) = self.slots.get_mut(slot) {
            if stream.seq == seq && stream.callback.is_none() {
                stream.callback = Some(callback);
            }
        }
    }
}
