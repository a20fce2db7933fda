// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    mm::phys::{
        NodePreference,
        NumaNode,
    },
    runtime::SharedObject,
};
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Scheduling priority of a contract. Realtime work prefers the latency node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
    Realtime,
}

/// Enforcement state machine. Transitions are one-way within a single contract application:
/// a contract never walks back towards `Ok` while the job runs.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContractState {
    /// Within all budgets.
    Ok = 0,
    /// First violation detected.
    Warned = 1,
    /// Repeated violations; execution and allocation denied.
    SafeMode = 2,
}

/// Verdict of admission control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmitResult {
    Ok,
    RejectMemory,
    RejectCpu,
    RejectPriority,
    RejectNoResources,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// A resource budget bound to one job, with its runtime accounting. Long-lived: created by the
/// caller, registered on apply, and kept for the duration of the job run.
#[derive(Clone, Debug)]
pub struct Contract {
    pub job_id: u32,
    pub cpu_budget_us: u32,
    pub memory_budget_kb: u32,
    pub priority: Priority,
    /// Chosen on apply, from the priority.
    pub preferred_node: NumaNode,

    // Runtime accounting, updated by the engine.
    pub cpu_used_us: u32,
    pub mem_used_kb: u32,
    pub cpu_violations: u32,
    pub mem_violations: u32,
    pub state: ContractState,
}

/// A contract handle shared between the caller and the registry.
#[derive(Clone)]
pub struct SharedContract(SharedObject<Contract>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Contract {
    pub fn new(job_id: u32, cpu_budget_us: u32, memory_budget_kb: u32, priority: Priority) -> Self {
        Self {
            job_id,
            cpu_budget_us,
            memory_budget_kb,
            priority,
            preferred_node: NumaNode::Remote,
            cpu_used_us: 0,
            mem_used_kb: 0,
            cpu_violations: 0,
            mem_violations: 0,
            state: ContractState::Ok,
        }
    }

    /// Remaining memory budget.
    pub fn available_kb(&self) -> u32 {
        self.memory_budget_kb.saturating_sub(self.mem_used_kb)
    }

    /// Whether the contract still allows execution.
    pub fn can_continue(&self) -> bool {
        self.state != ContractState::SafeMode
    }

    pub fn node_preference(&self) -> NodePreference {
        NodePreference::Node(self.preferred_node)
    }
}

impl SharedContract {
    pub fn new(contract: Contract) -> Self {
        Self(SharedObject::new(contract))
    }
}

impl ContractState {
    pub fn name(self) -> &'static str {
        match self {
            ContractState::Ok => "OK",
            ContractState::Warned => "WARNED",
            ContractState::SafeMode => "SAFE_MODE",
        }
    }
}

impl AdmitResult {
    pub fn name(self) -> &'static str {
        match self {
            AdmitResult::Ok => "OK",
            AdmitResult::RejectMemory => "REJECT_MEMORY",
            AdmitResult::RejectCpu => "REJECT_CPU",
            AdmitResult::RejectPriority => "REJECT_PRIORITY",
            AdmitResult::RejectNoResources => "REJECT_NO_RESOURCES",
        }
    }

    /// Numeric code carried in reject events.
    pub fn code(self) -> u32 {
        match self {
            AdmitResult::Ok => 0,
            AdmitResult::RejectMemory => 1,
            AdmitResult::RejectCpu => 2,
            AdmitResult::RejectPriority => 3,
            AdmitResult::RejectNoResources => 4,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedContract {
    type Target = Contract;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedContract {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}
