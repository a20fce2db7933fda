// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    contract::budget::{
        AdmitResult,
        Contract,
        ContractState,
        Priority,
        SharedContract,
    },
    job::graph::{
        JobGraph,
        StepType,
    },
    mm::phys::{
        NumaNode,
        SharedPhysMemory,
    },
    runtime::{
        fail::Fail,
        limits::{
            MAX_CONTRACTS,
            PAGE_KB,
        },
    },
    trace::{
        EventType,
        SharedRecorder,
    },
};
use ::arrayvec::ArrayVec;

//======================================================================================================================
// Constants
//======================================================================================================================

/// CPU violations in the warned state before safe mode.
const CPU_VIOLATIONS_TO_SAFE_MODE: u32 = 3;

/// Memory violations in the warned state before safe mode.
const MEM_VIOLATIONS_TO_SAFE_MODE: u32 = 2;

/// Admission-time CPU cost estimates per step type, in microseconds.
const ESTIMATE_COMPUTE_US: u32 = 1000;
const ESTIMATE_COLLECTIVE_US: u32 = 3000;
const ESTIMATE_IO_US: u32 = 2000;
const ESTIMATE_CONTROL_US: u32 = 100;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Ties contracts to the memory manager and the flight recorder: applies and registers them,
/// charges usage against budgets, walks the enforcement state machine, and runs admission
/// control for job graphs.
pub struct ContractEngine {
    /// Event sink.
    recorder: SharedRecorder,
    /// Frame source for contract-governed allocations.
    pmm: SharedPhysMemory,
    /// Registered contracts, keyed by job id.
    registry: ArrayVec<SharedContract, MAX_CONTRACTS>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ContractEngine {
    pub fn new(recorder: SharedRecorder, pmm: SharedPhysMemory) -> Self {
        Self {
            recorder,
            pmm,
            registry: ArrayVec::new(),
        }
    }

    /// Applies a contract: zeroes its accounting, picks the preferred node from the priority,
    /// and registers it. Re-applying is the explicit reset path, including out of safe mode.
    pub fn apply(&mut self, contract: &mut SharedContract) -> Result<(), Fail> {
        contract.cpu_used_us = 0;
        contract.mem_used_kb = 0;
        contract.cpu_violations = 0;
        contract.mem_violations = 0;
        contract.state = ContractState::Ok;

        contract.preferred_node = if contract.priority == Priority::Realtime {
            NumaNode::Local
        } else {
            NumaNode::Remote
        };

        self.register(contract)?;

        debug!(
            "apply(): job {} priority={:?} node={:?} cpu_budget={}us mem_budget={}KB",
            contract.job_id, contract.priority, contract.preferred_node, contract.cpu_budget_us, contract.memory_budget_kb
        );
        let (job_id, cpu_budget_us): (u32, u32) = (contract.job_id, contract.cpu_budget_us);
        self.recorder.log(EventType::ContractApply, job_id, 0, cpu_budget_us);
        Ok(())
    }

    fn register(&mut self, contract: &SharedContract) -> Result<(), Fail> {
        for slot in self.registry.iter_mut() {
            if slot.job_id == contract.job_id {
                *slot = contract.clone();
                return Ok(());
            }
        }
        if self.registry.is_full() {
            return Err(Fail::new(libc::ENOSPC, "contract registry is full"));
        }
        self.registry.push(contract.clone());
        Ok(())
    }

    /// Looks up the registered contract for a job.
    pub fn lookup(&self, job_id: u32) -> Option<SharedContract> {
        self.registry.iter().find(|c| c.job_id == job_id).cloned()
    }

    /// Transitions the enforcement state machine. Backward transitions are refused; the walk
    /// through OK, WARNED, SAFE_MODE is monotone within one application.
    pub fn set_state(&mut self, contract: &mut SharedContract, new_state: ContractState) {
        let old_state: ContractState = contract.state;
        if old_state == new_state {
            return;
        }
        if new_state < old_state {
            warn!(
                "set_state(): refusing backward transition {} -> {} (job {})",
                old_state.name(),
                new_state.name(),
                contract.job_id
            );
            return;
        }

        contract.state = new_state;
        debug!(
            "set_state(): job {} state: {} -> {}",
            contract.job_id,
            old_state.name(),
            new_state.name()
        );
        let job_id: u32 = contract.job_id;
        self.recorder
            .log(EventType::ContractStateChange, job_id, old_state as u32, new_state as u32);

        if new_state == ContractState::SafeMode {
            let total_violations: u32 = contract.cpu_violations + contract.mem_violations;
            self.recorder.log(EventType::ContractSafeMode, job_id, 0, total_violations);
        }
    }

    fn cpu_violation_transition(&mut self, contract: &mut SharedContract) {
        if contract.state == ContractState::Ok {
            self.set_state(contract, ContractState::Warned);
        } else if contract.state == ContractState::Warned && contract.cpu_violations >= CPU_VIOLATIONS_TO_SAFE_MODE {
            self.set_state(contract, ContractState::SafeMode);
        }
    }

    fn mem_violation_transition(&mut self, contract: &mut SharedContract) {
        if contract.state == ContractState::Ok {
            self.set_state(contract, ContractState::Warned);
        } else if contract.state == ContractState::Warned && contract.mem_violations >= MEM_VIOLATIONS_TO_SAFE_MODE {
            self.set_state(contract, ContractState::SafeMode);
        }
    }

    /// Charges CPU time. Returns true when the charge pushed the contract over budget.
    pub fn charge_cpu(&mut self, contract: &mut SharedContract, us: u32) -> bool {
        contract.cpu_used_us = contract.cpu_used_us.saturating_add(us);

        if contract.cpu_used_us > contract.cpu_budget_us {
            contract.cpu_violations += 1;
            let (job_id, used): (u32, u32) = (contract.job_id, contract.cpu_used_us);
            self.recorder.log(EventType::ContractBudgetExceed, job_id, 0, used);
            self.cpu_violation_transition(contract);
            return true;
        }
        false
    }

    /// Charges memory. Returns true when the charge pushed the contract over budget.
    pub fn charge_memory(&mut self, contract: &mut SharedContract, kb: u32) -> bool {
        contract.mem_used_kb = contract.mem_used_kb.saturating_add(kb);

        if contract.mem_used_kb > contract.memory_budget_kb {
            contract.mem_violations += 1;
            let (job_id, used): (u32, u32) = (contract.job_id, contract.mem_used_kb);
            self.recorder.log(EventType::MemContractExceed, job_id, 0, used);
            self.mem_violation_transition(contract);
            return true;
        }
        false
    }

    /// Allocates one frame under the contract: denied in safe mode, denied (and counted as a
    /// violation) when the charge would overshoot the budget, otherwise served by the memory
    /// manager on the contract's preferred node.
    pub fn alloc_page(&mut self, contract: &mut SharedContract) -> Result<u64, Fail> {
        if contract.state == ContractState::SafeMode {
            warn!("alloc_page(): allocation denied for job {}: SAFE_MODE", contract.job_id);
            let job_id: u32 = contract.job_id;
            self.recorder.log(EventType::MemAllocFail, job_id, 0, 0);
            return Err(Fail::new(libc::EPERM, "contract is in safe mode"));
        }

        if contract.mem_used_kb + PAGE_KB > contract.memory_budget_kb {
            contract.mem_violations += 1;
            warn!("alloc_page(): allocation denied for job {}: budget exceeded", contract.job_id);
            let (job_id, would_use): (u32, u32) = (contract.job_id, contract.mem_used_kb + PAGE_KB);
            self.recorder.log(EventType::MemContractExceed, job_id, 0, would_use);
            self.mem_violation_transition(contract);
            return Err(Fail::new(libc::EDQUOT, "allocation would exceed memory budget"));
        }

        let addr: u64 = self.pmm.alloc_page(contract.node_preference())?;
        contract.mem_used_kb += PAGE_KB;

        let (job_id, node): (u32, NumaNode) = (contract.job_id, self.pmm.addr_to_node(addr));
        self.recorder.log(EventType::MemAlloc, job_id, node.raw() as u32, 1);
        Ok(addr)
    }

    /// Frees a frame and credits the contract.
    pub fn free_page(&mut self, contract: &mut SharedContract, addr: u64) {
        if addr == 0 {
            return;
        }
        let node: NumaNode = self.pmm.addr_to_node(addr);
        self.pmm.free_page(addr);
        contract.mem_used_kb = contract.mem_used_kb.saturating_sub(PAGE_KB);

        let job_id: u32 = contract.job_id;
        self.recorder.log(EventType::MemFree, job_id, node.raw() as u32, 1);
    }

    /// Admission control: checks a job graph (with computed memory metrics) against a contract.
    /// The CPU estimate is advisory; only memory shortfalls reject.
    pub fn admit(&mut self, contract: &Contract, job: &JobGraph) -> AdmitResult {
        debug!(
            "admit(): job {} peak={}KB pinned={}KB against budget {}KB",
            job.id(),
            job.peak_memory_kb(),
            job.pinned_memory_kb(),
            contract.memory_budget_kb
        );

        // Peak working set must fit the budget outright.
        if job.peak_memory_kb() > contract.memory_budget_kb {
            warn!("admit(): job {} rejected: memory budget exceeded", job.id());
            self.recorder.log(
                EventType::JobReject,
                job.id(),
                AdmitResult::RejectMemory.code(),
                job.peak_memory_kb(),
            );
            return AdmitResult::RejectMemory;
        }

        // Pinned tensors cannot be evicted.
        if job.pinned_memory_kb() > contract.memory_budget_kb {
            warn!("admit(): job {} rejected: pinned memory exceeds budget", job.id());
            self.recorder.log(
                EventType::JobReject,
                job.id(),
                AdmitResult::RejectMemory.code(),
                job.pinned_memory_kb(),
            );
            return AdmitResult::RejectMemory;
        }

        // Enough headroom left right now?
        let available_kb: u32 = contract.available_kb();
        if job.peak_memory_kb() > available_kb {
            warn!(
                "admit(): job {} rejected: insufficient available memory ({}KB free)",
                job.id(),
                available_kb
            );
            self.recorder.log(
                EventType::JobReject,
                job.id(),
                AdmitResult::RejectNoResources.code(),
                available_kb,
            );
            return AdmitResult::RejectNoResources;
        }

        let estimated_cpu_us: u32 = job
            .steps()
            .iter()
            .map(|s| match s.step_type {
                StepType::Compute => ESTIMATE_COMPUTE_US,
                StepType::Collective => ESTIMATE_COLLECTIVE_US,
                StepType::Io => ESTIMATE_IO_US,
                StepType::Control => ESTIMATE_CONTROL_US,
            })
            .sum();

        if estimated_cpu_us > contract.cpu_budget_us {
            // Advisory only.
            warn!(
                "admit(): job {} may exceed CPU budget (estimate {}us, budget {}us)",
                job.id(),
                estimated_cpu_us,
                contract.cpu_budget_us
            );
            self.recorder
                .log(EventType::ContractBudgetWarn, job.id(), 0, estimated_cpu_us);
        }

        debug!("admit(): job {} admitted (cpu estimate {}us)", job.id(), estimated_cpu_us);
        self.recorder
            .log(EventType::JobAdmit, job.id(), job.peak_memory_kb(), estimated_cpu_us);
        AdmitResult::Ok
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
