// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::MAX_MEM_REGIONS,
};
use ::arrayvec::ArrayVec;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Bytes of conventional low memory in the fallback map.
const LOW_MEMORY_BYTES: u64 = 640 * 1024;

/// Start of extended memory.
pub const EXTENDED_MEMORY_BASE: u64 = 0x10_0000;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Classification of a bootloader memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// One region of the bootloader memory map.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// A bounded bootloader memory map. Only available regions become free frames.
#[derive(Clone, Default)]
pub struct MemoryMap {
    regions: ArrayVec<MemoryRegion, MAX_MEM_REGIONS>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a region to the map.
    pub fn add(&mut self, base: u64, length: u64, kind: RegionKind) -> Result<(), Fail> {
        if self.regions.is_full() {
            return Err(Fail::new(libc::ENOSPC, "memory map is full"));
        }
        self.regions.push(MemoryRegion { base, length, kind });
        Ok(())
    }

    /// Builds the conventional fallback map for a machine with `total_bytes` of RAM: low memory,
    /// then everything above 1 MiB, both available.
    pub fn flat(total_bytes: u64) -> Self {
        let mut map: MemoryMap = Self::new();
        // Capacity is statically sufficient for two regions.
        map.add(0, LOW_MEMORY_BYTES, RegionKind::Available)
            .expect("fresh map has room");
        map.add(
            EXTENDED_MEMORY_BASE,
            total_bytes.saturating_sub(EXTENDED_MEMORY_BASE),
            RegionKind::Available,
        )
        .expect("fresh map has room");
        map
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
