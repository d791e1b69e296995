//! Timer bookkeeping: due-time tagging and the handle applications use to
//! start/stop a timer registered with a `Dispatcher`.
//!
//! Grounded on `events/timer.cpp` and `events/eventdispatcher_p.h`
//! (original_source): `s_maxTimerSerial = 0x3ff` (10 bits) and the
//! 54-bit-due-time/10-bit-serial packing into a single `u64` sort key for
//! `m_timers` are carried over verbatim. The C++ reentrancy guard
//! (`m_reentrancyGuard` pointing at a stack `bool` so a timer can detect
//! its own destruction from inside its completion callback) has no
//! counterpart here: `Dispatcher` owns timers by value in a table keyed by
//! `TimerId`, so a timer that removes itself (or another timer) while its
//! own firing is being processed just mutates that table, which Rust's
//! ownership rules make safe without a liveness flag.

use std::time::{Duration, Instant};

/// Bits reserved for the serial disambiguating timers with an identical
/// due time, matching `EventDispatcherPrivate::s_maxTimerSerial`.
const SERIAL_BITS: u32 = 10;
const MAX_SERIAL: u16 = (1 << SERIAL_BITS) - 1;

/// Opaque handle to a timer registered with a `Dispatcher`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// The `(due_time, serial)` sort key used to find the next timer to fire
/// in due-time order, packed into a single `u64` the way the original
/// implementation packs its `std::multimap` key.
pub(crate) fn pack_key(due_time_ticks: u64, serial: u16) -> u64 {
    (due_time_ticks << SERIAL_BITS) | (serial as u64 & MAX_SERIAL as u64)
}

pub(crate) struct TimerSerialAllocator {
    last: u16,
}

impl TimerSerialAllocator {
    pub(crate) fn new() -> Self {
        TimerSerialAllocator { last: 0 }
    }

    pub(crate) fn next(&mut self) -> u16 {
        self.last = if self.last >= MAX_SERIAL { 0 } else { self.last + 1 };
        self.last
    }
}

pub(crate) struct TimerEntry {
    pub interval: Duration,
    pub repeating: bool,
    pub due_at: Instant,
    pub serial: u16,
}

/// A handle applications hold onto to manage a registered timer. The
/// timer's actual state lives in the owning `Dispatcher`; this is a thin,
/// `Copy`able reference to it plus the parameters used to (re)start it.
#[derive(Clone, Copy, Debug)]
pub struct Timer {
    pub(crate) id: Option<TimerId>,
    pub interval: Duration,
    pub repeating: bool,
}

impl Timer {
    pub fn new(interval: Duration) -> Timer {
        Timer {
            id: None,
            interval,
            repeating: false,
        }
    }

    pub fn repeating(mut self, repeating: bool) -> Timer {
        self.repeating = repeating;
        self
    }

    pub fn id(&self) -> Option<TimerId> {
        self.id
    }
}
