// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//==============================================================================
// Imports
//==============================================================================

use ::std::rc::Rc;
use ::zenedge::{
    mm::MemoryMap,
    pal::LogicalPlatform,
    trace::{
        EventType,
        TraceEvent,
    },
    Config,
    EdgeKernel,
};

//==============================================================================
// Constants
//==============================================================================

/// RAM of the simulated machine: 128 MiB.
pub const TOTAL_BYTES: u64 = 128 * 1024 * 1024;

//==============================================================================
// Structures
//==============================================================================

/// Test harness: one kernel context over a deterministic platform.
pub struct Test {
    pub platform: LogicalPlatform,
    pub kernel: EdgeKernel,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Test {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let map: MemoryMap = MemoryMap::flat(TOTAL_BYTES);
        let kernel: EdgeKernel =
            EdgeKernel::new(config, Rc::new(platform.clone()), &map).expect("kernel context should boot");
        Self { platform, kernel }
    }

    /// Snapshot of the retained trace events.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.kernel.recorder().events().copied().collect()
    }

    /// Retained events of one kind.
    pub fn events_of(&self, kind: EventType) -> Vec<TraceEvent> {
        self.kernel
            .recorder()
            .events()
            .filter(|e| e.kind == kind)
            .copied()
            .collect()
    }

    /// Asserts that `kinds` appear in the trace as a subsequence, in order.
    pub fn has_subsequence(&self, job_id: u32, kinds: &[EventType]) -> bool {
        let mut want: usize = 0;
        for e in self.kernel.recorder().events() {
            if want < kinds.len() && e.job_id == job_id && e.kind == kinds[want] {
                want += 1;
            }
        }
        want == kinds.len()
    }
}
