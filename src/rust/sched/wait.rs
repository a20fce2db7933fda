// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::Platform,
    runtime::{
        clock::Clock,
        fail::Fail,
    },
};
use ::core::hint;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Granularity of the sleep phase, in milliseconds.
const SLEEP_STEP_MS: u64 = 1;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Adaptive polling: spins with a CPU relaxation hint while the elapsed time is under
/// `spin_budget_us`, then sleeps on the platform timer in short steps until `deadline_us`.
/// Returns the microseconds waited, or a timeout failure on deadline expiry.
pub fn wait_until<F: FnMut() -> bool>(
    clock: &Clock,
    platform: &dyn Platform,
    mut pred: F,
    spin_budget_us: u64,
    deadline_us: u64,
) -> Result<u64, Fail> {
    let start_us: u64 = clock.now_us();

    loop {
        if pred() {
            return Ok(clock.now_us().saturating_sub(start_us));
        }

        let elapsed_us: u64 = clock.now_us().saturating_sub(start_us);
        if elapsed_us >= deadline_us {
            return Err(Fail::timeout("adaptive poll deadline expired"));
        }

        if elapsed_us < spin_budget_us {
            hint::spin_loop();
        } else {
            platform.sleep_ms(SLEEP_STEP_MS);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::wait_until;
    use crate::{
        pal::{LogicalPlatform, Platform},
        runtime::SharedClock,
    };
    use ::anyhow::Result;
    use ::std::rc::Rc;

    /// Tests that a predicate that is already true returns immediately.
    #[test]
    fn immediate() -> Result<()> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: SharedClock = SharedClock::calibrate(Rc::new(platform.clone()), 1);

        let waited: u64 = match wait_until(&clock, &platform, || true, 100, 1000) {
            Ok(waited) => waited,
            Err(_) => anyhow::bail!("waiting on a true predicate should succeed"),
        };
        crate::ensure_eq!(waited, 0);
        Ok(())
    }

    /// Tests that the deadline expires through the sleep phase on a silent predicate.
    #[test]
    fn deadline() -> Result<()> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: SharedClock = SharedClock::calibrate(Rc::new(platform.clone()), 1);

        // Zero spin budget: the wait goes straight to sleeping, each sleep advancing the
        // logical clock, so the deadline is reached deterministically.
        match wait_until(&clock, &platform, || false, 0, 10_000) {
            Ok(_) => anyhow::bail!("waiting on a false predicate should time out"),
            Err(e) => crate::ensure_eq!(e.errno, libc::ETIMEDOUT),
        }
        Ok(())
    }

    /// Tests that the predicate flipping during the sleep phase is observed.
    #[test]
    fn flips_during_sleep() -> Result<()> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: SharedClock = SharedClock::calibrate(Rc::new(platform.clone()), 1);

        let start: u64 = clock.now_us();
        let probe: LogicalPlatform = platform.clone();
        let waited: u64 = match wait_until(
            &clock,
            &platform,
            // True once five logical milliseconds have passed.
            move || probe.now_cycles() >= (start + 5_000) * 1000,
            0,
            100_000,
        ) {
            Ok(waited) => waited,
            Err(_) => anyhow::bail!("the predicate flips before the deadline"),
        };
        crate::ensure_eq!(waited, 5_000);
        Ok(())
    }
}
