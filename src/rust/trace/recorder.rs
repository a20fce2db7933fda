// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        limits::MAX_ACTIVE_SPANS,
        SharedClock,
        SharedObject,
    },
    trace::event::{
        EventType,
        JobStats,
        TraceEvent,
    },
};
use ::slab::Slab;
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default capacity of the event ring. Must be a power of two.
pub const DEFAULT_TRACE_CAPACITY: usize = 256;

/// Marker stored in the `extra` field when the span table overflows.
const SPAN_OVERFLOW_MARKER: u32 = 0xDEAD;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle correlating a start event with its end event. The zero handle is invalid; ending an
/// invalid span is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceSpan(u32);

/// An open span awaiting its end event.
struct ActiveSpan {
    job_id: u32,
    step_id: u32,
    start_cycles: u64,
}

/// Always-on, low-overhead telemetry for workload governance: a fixed ring of 32-byte events with
/// a monotone append counter. Once the ring is full, new events overwrite the oldest; appends are
/// non-blocking and never allocate. Single producer.
pub struct FlightRecorder {
    /// Time source for stamping events.
    clock: SharedClock,
    /// Event storage. Length is a power of two.
    buffer: Vec<TraceEvent>,
    /// Pre-computed index mask.
    mask: u64,
    /// Monotone append counter.
    head: u64,
    /// Bounded table of open spans.
    spans: Slab<ActiveSpan>,
}

/// A recorder handle shared across subsystems.
#[derive(Clone)]
pub struct SharedRecorder(SharedObject<FlightRecorder>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TraceSpan {
    /// The invalid span handle.
    pub fn invalid() -> Self {
        Self(0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl FlightRecorder {
    /// Creates a flight recorder with a ring of `capacity` events.
    pub fn new(clock: SharedClock, capacity: usize) -> Result<Self, Fail> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Fail::new(
                libc::EINVAL,
                "cannot create a flight recorder that does not have a power of two capacity",
            ));
        }

        let mut recorder: FlightRecorder = Self {
            clock,
            buffer: vec![TraceEvent::default(); capacity],
            mask: (capacity - 1) as u64,
            head: 0,
            spans: Slab::with_capacity(MAX_ACTIVE_SPANS),
        };
        recorder.log(EventType::Boot, 0, 0, 0);

        Ok(recorder)
    }

    /// Appends one event, stamped with the current time.
    pub fn log(&mut self, kind: EventType, job_id: u32, step_id: u32, extra: u32) {
        let slot: usize = (self.head & self.mask) as usize;
        self.buffer[slot] = TraceEvent {
            ts_us: self.clock.now_us(),
            ts_cycles: self.clock.now_cycles(),
            kind,
            flags: 0,
            cpu_id: 0,
            job_id,
            step_id,
            extra,
        };
        self.head += 1;
    }

    /// Logs `start_kind` and opens a span. If the span table is full, logs a violation and
    /// returns the invalid handle instead.
    pub fn begin_span(&mut self, start_kind: EventType, job_id: u32, step_id: u32) -> TraceSpan {
        if self.spans.len() >= MAX_ACTIVE_SPANS {
            warn!("begin_span(): span table overflow (job_id={}, step_id={})", job_id, step_id);
            self.log(EventType::ContractViolation, job_id, step_id, SPAN_OVERFLOW_MARKER);
            return TraceSpan::invalid();
        }

        let start_cycles: u64 = self.clock.now_cycles();
        let slot: usize = self.spans.insert(ActiveSpan {
            job_id,
            step_id,
            start_cycles,
        });
        self.log(start_kind, job_id, step_id, 0);

        // Slot zero maps to handle one, so the zero handle stays invalid.
        TraceSpan((slot + 1) as u32)
    }

    /// Closes a span, logging `end_kind` with the measured duration in `extra`.
    pub fn end_span(&mut self, span: TraceSpan, end_kind: EventType) {
        if !span.is_valid() {
            return;
        }
        let slot: usize = (span.0 - 1) as usize;
        let open: ActiveSpan = match self.spans.try_remove(slot) {
            Some(open) => open,
            None => return,
        };

        let elapsed_cycles: u64 = self.clock.now_cycles().saturating_sub(open.start_cycles);
        let duration_us: u64 = self.clock.cycles_to_us(elapsed_cycles);
        self.log(end_kind, open.job_id, open.step_id, duration_us as u32);
    }

    /// Returns the duration of the most recent step-end event matching both ids, or 0.
    pub fn last_duration(&self, job_id: u32, step_id: u32) -> u64 {
        let count: u64 = self.head.min(self.buffer.len() as u64);
        for i in 0..count {
            let idx: usize = ((self.head - 1 - i) & self.mask) as usize;
            let e: &TraceEvent = &self.buffer[idx];
            if e.kind == EventType::StepEnd && e.job_id == job_id && e.step_id == step_id {
                return e.extra as u64;
            }
        }
        0
    }

    /// Aggregates per-job statistics by scanning the ring.
    pub fn job_stats(&self, job_id: u32) -> JobStats {
        let mut stats: JobStats = JobStats {
            job_id,
            ..Default::default()
        };

        let mut first_ts: Option<u64> = None;
        let mut last_ts: u64 = 0;

        for e in self.events() {
            if e.job_id != job_id {
                continue;
            }

            first_ts = Some(first_ts.map_or(e.ts_us, |t: u64| t.min(e.ts_us)));
            last_ts = last_ts.max(e.ts_us);

            match e.kind {
                EventType::StepEnd => {
                    stats.steps_completed += 1;
                    stats.total_cpu_us += e.extra as u64;
                },
                EventType::ContractViolation | EventType::ContractBudgetExceed => {
                    stats.violations += 1;
                },
                _ => {},
            }
        }

        stats.total_wall_us = last_ts.saturating_sub(first_ts.unwrap_or(0));
        stats
    }

    /// Iterates the retained events, oldest to newest.
    pub fn events(&self) -> impl Iterator<Item = &TraceEvent> + '_ {
        let count: u64 = self.head.min(self.buffer.len() as u64);
        let start: u64 = self.head - count;
        (0..count).map(move |i: u64| &self.buffer[((start + i) & self.mask) as usize])
    }

    /// Number of events appended since boot.
    pub fn appended(&self) -> u64 {
        self.head
    }

    /// Dumps the retained events through the logging facade.
    pub fn dump(&self) {
        debug!("=== flight recorder dump ===");
        for e in self.events() {
            debug!(
                "{:>12}us {:?} job={} step={} extra={:#x}",
                e.ts_us, e.kind, e.job_id, e.step_id, e.extra
            );
        }
        debug!("=== end dump ({} events) ===", self.head.min(self.buffer.len() as u64));
    }
}

impl SharedRecorder {
    pub fn new(clock: SharedClock, capacity: usize) -> Result<Self, Fail> {
        Ok(Self(SharedObject::new(FlightRecorder::new(clock, capacity)?)))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedRecorder {
    type Target = FlightRecorder;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedRecorder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        FlightRecorder,
        TraceSpan,
    };
    use crate::{
        pal::LogicalPlatform,
        runtime::{
            limits::MAX_ACTIVE_SPANS,
            SharedClock,
        },
        trace::event::{
            EventType,
            JobStats,
        },
    };
    use ::anyhow::Result;
    use ::std::rc::Rc;

    fn do_recorder(capacity: usize) -> Result<(FlightRecorder, LogicalPlatform)> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: SharedClock = SharedClock::calibrate(Rc::new(platform.clone()), 1);
        match FlightRecorder::new(clock, capacity) {
            Ok(recorder) => Ok((recorder, platform)),
            Err(_) => anyhow::bail!("creating a flight recorder with a valid capacity should be possible"),
        }
    }

    /// Tests if we fail to create a recorder with an invalid capacity.
    #[test]
    fn bad_new() -> Result<()> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: SharedClock = SharedClock::calibrate(Rc::new(platform), 1);
        match FlightRecorder::new(clock, 100) {
            Ok(_) => anyhow::bail!("creating a recorder with a non-power-of-two capacity should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if a span measures exactly the time the clock advanced between its endpoints.
    #[test]
    fn span_duration() -> Result<()> {
        let (mut recorder, platform) = do_recorder(64)?;

        let span: TraceSpan = recorder.begin_span(EventType::StepStart, 7, 3);
        crate::ensure_eq!(span.is_valid(), true);

        platform.advance_us(250);
        recorder.end_span(span, EventType::StepEnd);

        crate::ensure_eq!(recorder.last_duration(7, 3), 250);
        crate::ensure_eq!(recorder.last_duration(7, 4), 0);
        Ok(())
    }

    /// Tests if span table overflow logs a violation and yields the invalid handle.
    #[test]
    fn span_overflow() -> Result<()> {
        let (mut recorder, _platform) = do_recorder(64)?;

        let mut spans: Vec<TraceSpan> = Vec::new();
        for i in 0..MAX_ACTIVE_SPANS {
            spans.push(recorder.begin_span(EventType::StepStart, 1, i as u32));
        }
        let overflow: TraceSpan = recorder.begin_span(EventType::StepStart, 1, 99);
        crate::ensure_eq!(overflow.is_valid(), false);

        // Ending the invalid span must be a no-op.
        let appended: u64 = recorder.appended();
        recorder.end_span(overflow, EventType::StepEnd);
        crate::ensure_eq!(recorder.appended(), appended);

        let stats: JobStats = recorder.job_stats(1);
        crate::ensure_eq!(stats.violations, 1);

        // Closing a real span frees its slot for reuse.
        recorder.end_span(spans[0], EventType::StepEnd);
        let reused: TraceSpan = recorder.begin_span(EventType::StepStart, 1, 100);
        crate::ensure_eq!(reused.is_valid(), true);
        Ok(())
    }

    /// Tests if the ring overwrites oldest events once full, and the stats window follows.
    #[test]
    fn overwrite_oldest() -> Result<()> {
        let (mut recorder, _platform) = do_recorder(8)?;

        for i in 0..20 {
            recorder.log(EventType::SchedTick, 2, i, i);
        }

        // Only the last 8 events are retained.
        let extras: Vec<u32> = recorder.events().map(|e| e.extra).collect();
        crate::ensure_eq!(extras.len(), 8);
        crate::ensure_eq!(extras[0], 12);
        crate::ensure_eq!(extras[7], 19);
        Ok(())
    }

    /// Tests per-job aggregation: completed steps, CPU total, wall span.
    #[test]
    fn job_stats() -> Result<()> {
        let (mut recorder, platform) = do_recorder(64)?;

        let s1: TraceSpan = recorder.begin_span(EventType::StepStart, 9, 0);
        platform.advance_us(100);
        recorder.end_span(s1, EventType::StepEnd);

        let s2: TraceSpan = recorder.begin_span(EventType::StepStart, 9, 1);
        platform.advance_us(300);
        recorder.end_span(s2, EventType::StepEnd);

        // Noise from another job must not leak in.
        recorder.log(EventType::ContractBudgetExceed, 8, 0, 1);

        let stats: JobStats = recorder.job_stats(9);
        crate::ensure_eq!(stats.steps_completed, 2);
        crate::ensure_eq!(stats.total_cpu_us, 400);
        crate::ensure_eq!(stats.total_wall_us, 400);
        crate::ensure_eq!(stats.violations, 0);
        Ok(())
    }
}
