// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_region::{
        RawRegion,
        RegionView,
    },
    ipc::wire::SHARED_SEGMENT_SIZE,
    runtime::fail::Fail,
};

#[cfg(target_os = "linux")]
use crate::pal::shm::SharedMemory;

//======================================================================================================================
// Structures
//======================================================================================================================

enum Backing {
    /// In-process segment; both endpoints live in this address space.
    Anonymous(RawRegion),
    /// Named POSIX region shared with another process.
    #[cfg(target_os = "linux")]
    Named {
        region: RawRegion,
        // Keeps the mapping alive for as long as views exist.
        #[allow(unused)]
        shm: SharedMemory,
    },
}

/// The shared memory segment carrying the transport: both rings, the doorbell block, and the
/// blob heap, at fixed offsets. The segment must outlive every endpoint attached to it.
pub struct SharedSegment {
    backing: Backing,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedSegment {
    fn with_backing(backing: Backing) -> SharedSegment {
        Self { backing }
    }

    /// Allocates an anonymous in-process segment.
    pub fn anonymous() -> Result<SharedSegment, Fail> {
        let region: RawRegion = RawRegion::anonymous(SHARED_SEGMENT_SIZE)?;
        Ok(Self::with_backing(Backing::Anonymous(region)))
    }

    /// Creates a named segment visible to other processes.
    #[cfg(target_os = "linux")]
    pub fn create(name: &str) -> Result<SharedSegment, Fail> {
        let mut shm: SharedMemory = SharedMemory::create(name, SHARED_SEGMENT_SIZE)?;
        let region: RawRegion = RawRegion::from_raw_parts(shm.as_mut_ptr(), shm.len())?;
        Ok(Self::with_backing(Backing::Named { region, shm }))
    }

    /// Opens a named segment another process created.
    #[cfg(target_os = "linux")]
    pub fn open(name: &str) -> Result<SharedSegment, Fail> {
        let mut shm: SharedMemory = SharedMemory::open(name, SHARED_SEGMENT_SIZE)?;
        let region: RawRegion = RawRegion::from_raw_parts(shm.as_mut_ptr(), shm.len())?;
        Ok(Self::with_backing(Backing::Named { region, shm }))
    }

    fn region(&self) -> &RawRegion {
        match &self.backing {
            Backing::Anonymous(region) => region,
            #[cfg(target_os = "linux")]
            Backing::Named { region, .. } => region,
        }
    }

    /// Opens a window into the segment.
    pub fn view(&self, offset: usize, len: usize) -> Result<RegionView, Fail> {
        self.region().view(offset, len)
    }

    pub fn len(&self) -> usize {
        self.region().len()
    }
}
