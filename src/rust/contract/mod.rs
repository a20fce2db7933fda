// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod budget;
pub mod engine;

pub use self::{
    budget::{
        AdmitResult,
        Contract,
        ContractState,
        Priority,
        SharedContract,
    },
    engine::ContractEngine,
};
