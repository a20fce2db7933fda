// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use self::common::Test;
use ::anyhow::Result;
use ::zenedge::{
    contract::{
        AdmitResult,
        Contract,
        Priority,
        SharedContract,
    },
    job::{
        JobGraph,
        StepType,
        TensorDtype,
    },
    mm::NodePreference,
    trace::{
        EventType,
        TraceEvent,
    },
};

//==============================================================================
// Helpers
//==============================================================================

/// Two compute steps feeding a collective, with an 8 KiB peak working set: T1 (4 KiB, pinned)
/// into T2 (4 KiB), T2 into T3 (4 KiB), T3 reduced.
fn mk_job(id: u32) -> Result<JobGraph> {
    let mut job: JobGraph = JobGraph::new(id);
    job.add_step(0, StepType::Compute)?;
    job.add_step(1, StepType::Compute)?;
    job.add_step(2, StepType::Collective)?;
    job.add_dep(1, 0)?;
    job.add_dep(2, 1)?;

    job.add_tensor(1, TensorDtype::Fp32, 1024, true, NodePreference::Any)?;
    job.add_tensor(2, TensorDtype::Fp16, 2048, false, NodePreference::Any)?;
    job.add_tensor(3, TensorDtype::Fp32, 1024, false, NodePreference::Any)?;

    job.step_add_input(0, 1)?;
    job.step_add_output(0, 2)?;
    job.step_add_input(1, 2)?;
    job.step_add_output(1, 3)?;
    job.step_add_input(2, 3)?;

    job.compute_memory();
    Ok(job)
}

//==============================================================================
// Admission
//==============================================================================

/// A 64 KiB / 50 ms contract admits the job; the admit event carries the 5000 us CPU estimate
/// (1000 + 1000 + 3000) and the 8 KiB peak.
#[test]
fn admit_accept() -> Result<()> {
    let mut test: Test = Test::new();
    let job: JobGraph = mk_job(7)?;
    zenedge::ensure_eq!(job.peak_memory_kb(), 8);

    let mut contract: SharedContract = SharedContract::new(Contract::new(7, 50_000, 64, Priority::Normal));
    test.kernel.apply_contract(&mut contract)?;

    zenedge::ensure_eq!(test.kernel.admit(&contract, &job), AdmitResult::Ok);

    let admits: Vec<TraceEvent> = test.events_of(EventType::JobAdmit);
    zenedge::ensure_eq!(admits.len(), 1);
    zenedge::ensure_eq!(admits[0].job_id, 7);
    zenedge::ensure_eq!(admits[0].step_id, 8);
    zenedge::ensure_eq!(admits[0].extra, 5000);
    Ok(())
}

/// The same job against a 4 KiB budget is rejected on memory, with the peak in the reject event.
#[test]
fn admit_reject() -> Result<()> {
    let mut test: Test = Test::new();
    let job: JobGraph = mk_job(8)?;

    let mut contract: SharedContract = SharedContract::new(Contract::new(8, 50_000, 4, Priority::Normal));
    test.kernel.apply_contract(&mut contract)?;

    zenedge::ensure_eq!(test.kernel.admit(&contract, &job), AdmitResult::RejectMemory);

    let rejects: Vec<TraceEvent> = test.events_of(EventType::JobReject);
    zenedge::ensure_eq!(rejects.len(), 1);
    zenedge::ensure_eq!(rejects[0].extra, job.peak_memory_kb());
    zenedge::ensure_eq!(test.events_of(EventType::JobAdmit).len(), 0);
    Ok(())
}

/// Admitting a job, then any subgraph of it, succeeds as well.
#[test]
fn admit_subgraph_monotone() -> Result<()> {
    let mut test: Test = Test::new();
    let job: JobGraph = mk_job(9)?;
    let mut contract: SharedContract = SharedContract::new(Contract::new(9, 50_000, 64, Priority::Normal));
    test.kernel.apply_contract(&mut contract)?;
    zenedge::ensure_eq!(test.kernel.admit(&contract, &job), AdmitResult::Ok);

    // Single-step subgraph with only the pinned tensor.
    let mut sub: JobGraph = JobGraph::new(9);
    sub.add_step(0, StepType::Compute)?;
    sub.add_tensor(1, TensorDtype::Fp32, 1024, true, NodePreference::Any)?;
    sub.step_add_input(0, 1)?;
    sub.compute_memory();

    zenedge::ensure_eq!(test.kernel.admit(&contract, &sub), AdmitResult::Ok);
    Ok(())
}
