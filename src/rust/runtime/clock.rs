// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::Platform,
    runtime::SharedObject,
};
use ::std::{
    ops::Deref,
    rc::Rc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Calibration fallback when the platform timer yields a degenerate measurement. This matches the
/// 1000 MHz assumption the substrate runs with under emulation.
pub const DEFAULT_CYCLES_PER_US: u64 = 1000;

/// Length of the calibration window, in milliseconds.
pub const DEFAULT_CALIBRATE_MS: u64 = 10;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Monotonic time source. Produces a raw cycle count and a microsecond clock since boot.
///
/// The cycles-per-microsecond ratio is measured once at construction, by timing a fixed-duration
/// wait against the platform interval timer, and never changes afterwards.
pub struct Clock {
    /// Platform supplying the raw cycle counter.
    platform: Rc<dyn Platform>,
    /// Cycle count recorded at boot.
    boot_cycles: u64,
    /// Calibrated cycles per microsecond.
    cycles_per_us: u64,
}

/// A clock handle shared across subsystems.
#[derive(Clone)]
pub struct SharedClock(SharedObject<Clock>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Clock {
    /// Calibrates a new clock against the platform interval timer.
    pub fn calibrate(platform: Rc<dyn Platform>, window_ms: u64) -> Self {
        let boot_cycles: u64 = platform.now_cycles();
        platform.sleep_ms(window_ms);
        let elapsed: u64 = platform.now_cycles().saturating_sub(boot_cycles);

        let mut cycles_per_us: u64 = elapsed / (window_ms * 1000);
        if cycles_per_us == 0 {
            warn!(
                "calibrate(): degenerate measurement (elapsed={}), assuming {} cycles/us",
                elapsed, DEFAULT_CYCLES_PER_US
            );
            cycles_per_us = DEFAULT_CYCLES_PER_US;
        }

        debug!("calibrate(): {} cycles/us over {}ms window", cycles_per_us, window_ms);

        Self {
            platform,
            boot_cycles,
            cycles_per_us,
        }
    }

    /// Returns the raw cycle counter.
    pub fn now_cycles(&self) -> u64 {
        self.platform.now_cycles()
    }

    /// Returns microseconds elapsed since boot.
    pub fn now_us(&self) -> u64 {
        self.platform.now_cycles().saturating_sub(self.boot_cycles) / self.cycles_per_us
    }

    /// Converts a cycle count to microseconds.
    pub fn cycles_to_us(&self, cycles: u64) -> u64 {
        cycles / self.cycles_per_us
    }

    /// Converts microseconds to a cycle count.
    pub fn us_to_cycles(&self, us: u64) -> u64 {
        us * self.cycles_per_us
    }

    /// Returns the calibrated cycles-per-microsecond ratio.
    pub fn cycles_per_us(&self) -> u64 {
        self.cycles_per_us
    }
}

impl SharedClock {
    pub fn calibrate(platform: Rc<dyn Platform>, window_ms: u64) -> Self {
        Self(SharedObject::new(Clock::calibrate(platform, window_ms)))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedClock {
    type Target = Clock;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        Clock,
        DEFAULT_CYCLES_PER_US,
    };
    use crate::pal::LogicalPlatform;
    use ::anyhow::Result;
    use ::std::rc::Rc;

    /// Tests that a logical platform calibrates to the nanosecond granularity it advances with.
    #[test]
    fn calibrate_logical() -> Result<()> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: Clock = Clock::calibrate(Rc::new(platform.clone()), 10);

        // The logical clock advances 1000 ns per microsecond.
        crate::ensure_eq!(clock.cycles_per_us(), 1000);

        platform.advance_us(250);
        crate::ensure_eq!(clock.now_us(), 250);
        crate::ensure_eq!(clock.cycles_to_us(5_000), 5);
        crate::ensure_eq!(clock.us_to_cycles(5), 5_000);
        Ok(())
    }

    /// Tests that a frozen timer falls back to the documented default ratio.
    #[test]
    fn calibrate_fallback() -> Result<()> {
        let platform: LogicalPlatform = LogicalPlatform::frozen();
        let clock: Clock = Clock::calibrate(Rc::new(platform), 10);
        crate::ensure_eq!(clock.cycles_per_us(), DEFAULT_CYCLES_PER_US);
        Ok(())
    }
}
