// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::mm::phys::NodePreference;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Element type of a tensor. The numeric values ride on the wire inside tensor blob headers.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorDtype {
    Fp32 = 0,
    Fp16 = 1,
    Bf16 = 2,
    Int8 = 3,
    Int32 = 4,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Metadata for one tensor of a job: shape is tracked as a flat element count here; full shapes
/// live in the shared-heap blob headers once the tensor is staged for offload.
#[derive(Clone, Copy, Debug)]
pub struct TensorDesc {
    pub id: u32,
    pub dtype: TensorDtype,
    pub num_elements: u32,
    pub size_bytes: u32,
    /// Pinned tensors cannot be evicted and count against the budget for the whole job.
    pub pinned: bool,
    pub node_affinity: NodePreference,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TensorDtype {
    /// Bytes per element.
    pub fn elem_size(self) -> u32 {
        match self {
            TensorDtype::Fp32 => 4,
            TensorDtype::Fp16 => 2,
            TensorDtype::Bf16 => 2,
            TensorDtype::Int8 => 1,
            TensorDtype::Int32 => 4,
        }
    }

    pub fn from_raw(raw: u8) -> Option<TensorDtype> {
        match raw {
            0 => Some(TensorDtype::Fp32),
            1 => Some(TensorDtype::Fp16),
            2 => Some(TensorDtype::Bf16),
            3 => Some(TensorDtype::Int8),
            4 => Some(TensorDtype::Int32),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }
}

impl TensorDesc {
    /// Size of the tensor rounded up to whole KiB, the granularity of budget accounting.
    pub fn size_kb(&self) -> u32 {
        (self.size_bytes + 1023) / 1024
    }
}
