// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

#[cfg(target_os = "linux")]
pub mod shm;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        OnceLock,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Hardware capabilities the substrate consumes: a monotone cycle counter and an interval-timer
/// sleep. Everything above this trait is platform-independent.
pub trait Platform {
    /// Reads the raw cycle counter.
    fn now_cycles(&self) -> u64;

    /// Sleeps for the given number of milliseconds.
    fn sleep_ms(&self, ms: u64);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Platform backed by the host OS. Cycles are nanoseconds since a process-wide epoch, so the
/// calibrated clock lands on roughly 1000 cycles per microsecond.
#[derive(Clone, Default)]
pub struct SystemPlatform;

/// Deterministic platform for tests. The cycle counter is a logical nanosecond count that only
/// moves when [LogicalPlatform::advance_us] is called or, unless frozen, when a sleep elapses.
/// Clones share the same clock, including across threads.
#[derive(Clone)]
pub struct LogicalPlatform {
    /// Logical nanoseconds since boot.
    now_ns: Arc<AtomicU64>,
    /// Does sleeping advance the clock?
    sleep_advances: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SystemPlatform {
    fn epoch() -> Instant {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        *EPOCH.get_or_init(Instant::now)
    }
}

impl LogicalPlatform {
    pub fn new() -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(0)),
            sleep_advances: true,
        }
    }

    /// Creates a logical platform whose clock does not move on sleeps. Used to exercise the
    /// calibration fallback and pure-spin wait paths.
    pub fn frozen() -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(0)),
            sleep_advances: false,
        }
    }

    /// Advances the logical clock by the given number of microseconds.
    pub fn advance_us(&self, us: u64) {
        self.now_ns.fetch_add(us * 1000, Ordering::SeqCst);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Platform for SystemPlatform {
    fn now_cycles(&self) -> u64 {
        Self::epoch().elapsed().as_nanos() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl Platform for LogicalPlatform {
    fn now_cycles(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        if self.sleep_advances {
            self.now_ns.fetch_add(ms * 1_000_000, Ordering::SeqCst);
        }
    }
}

impl Default for LogicalPlatform {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
