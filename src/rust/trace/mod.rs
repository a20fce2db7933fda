// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod event;
pub mod recorder;

pub use self::{
    event::{
        EventType,
        JobStats,
        TraceEvent,
    },
    recorder::{
        FlightRecorder,
        SharedRecorder,
        TraceSpan,
    },
};
