// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod graph;
pub mod tensor;

pub use self::{
    graph::{
        JobGraph,
        JobStep,
        StepType,
    },
    tensor::{
        TensorDesc,
        TensorDtype,
    },
};
