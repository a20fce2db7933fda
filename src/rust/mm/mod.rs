// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod map;
pub mod phys;

pub use self::{
    map::{
        MemoryMap,
        MemoryRegion,
        RegionKind,
    },
    phys::{
        NodePreference,
        NumaNode,
        PhysMemory,
        PmmStats,
        SharedPhysMemory,
    },
};
