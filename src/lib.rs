//! Callback-driven event dispatch: one blocking wait multiplexing
//! socket/descriptor readiness and software timers, with callbacks run
//! at well-defined safe points.
//!
//! The core model is cooperative and single-threaded: a [`Dispatcher`]
//! waits on its [`mio`]-backed poller, then dispatches I/O callbacks and
//! ticks the timer engine while holding the reactor lock. The loop can
//! also run on a background thread; foreign threads then interact
//! through [`Dispatcher::suspend`] (an RAII guard over the parked
//! [`Reactor`]), a cloneable [`Handle`], or a [`Controller`] that pulls
//! every dispatch cycle onto its own thread.
//!
//! ```no_run
//! use std::time::Duration;
//! use evloop::{Dispatcher, Timer};
//!
//! let mut dispatcher = Dispatcher::new().unwrap();
//! dispatcher.activate_timer(Timer::repeating(
//!     Duration::from_millis(250),
//!     3,
//!     |_reactor, _handle| {
//!         println!("tick");
//!         true
//!     },
//! ));
//! // exits once the timer has fired out
//! assert_eq!(dispatcher.run(), 0);
//! ```

mod dispatcher;
mod event;
mod poller;
mod reactor;
mod stream;
mod time;
mod timer;

pub use dispatcher::{Controller, Dispatcher, Handle, SuspendGuard};
pub use event::Event;
pub use reactor::Reactor;
pub use stream::{Direction, Flags, IoCallback, Kind};
pub use time::TimeValue;
pub use timer::{Timer, TimerCallback, TimerHandle};
