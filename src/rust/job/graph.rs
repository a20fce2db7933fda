// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    job::tensor::{
        TensorDesc,
        TensorDtype,
    },
    mm::phys::NodePreference,
    runtime::{
        fail::Fail,
        limits::{
            MAX_JOB_STEPS,
            MAX_JOB_TENSORS,
            MAX_STEP_DEPS,
            MAX_STEP_INPUTS,
            MAX_STEP_OUTPUTS,
        },
    },
};
use ::arrayvec::ArrayVec;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// What a step does. Drives both the admission-time CPU estimate and the execution path: compute
/// steps offload to the accelerator, everything else runs inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepType {
    Compute,
    Collective,
    Io,
    Control,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// One node of the job DAG.
#[derive(Clone, Debug)]
pub struct JobStep {
    pub id: u32,
    pub step_type: StepType,
    pub deps: ArrayVec<u32, MAX_STEP_DEPS>,
    pub inputs: ArrayVec<u32, MAX_STEP_INPUTS>,
    pub outputs: ArrayVec<u32, MAX_STEP_OUTPUTS>,
    pub working_set_kb: u32,
    pub peak_memory_kb: u32,
    /// True iff every dependency has completed.
    pub ready: bool,
    pub completed: bool,
}

/// A bounded-capacity DAG of typed steps plus the tensors they touch. Built once, analyzed once
/// with [JobGraph::compute_memory], then driven to completion by the scheduler.
#[derive(Clone, Debug)]
pub struct JobGraph {
    id: u32,
    steps: ArrayVec<JobStep, MAX_JOB_STEPS>,
    tensors: ArrayVec<TensorDesc, MAX_JOB_TENSORS>,
    total_memory_kb: u32,
    peak_memory_kb: u32,
    pinned_memory_kb: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl JobGraph {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            steps: ArrayVec::new(),
            tensors: ArrayVec::new(),
            total_memory_kb: 0,
            peak_memory_kb: 0,
            pinned_memory_kb: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_steps(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn steps(&self) -> &[JobStep] {
        &self.steps
    }

    pub fn step(&self, id: u32) -> Option<&JobStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    fn step_mut(&mut self, id: u32) -> Option<&mut JobStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn tensor(&self, id: u32) -> Option<&TensorDesc> {
        self.tensors.iter().find(|t| t.id == id)
    }

    /// Appends a step. A fresh step has no dependencies and is immediately ready.
    pub fn add_step(&mut self, id: u32, step_type: StepType) -> Result<(), Fail> {
        if self.steps.is_full() {
            return Err(Fail::new(libc::ENOSPC, "job graph step capacity exhausted"));
        }
        if self.step(id).is_some() {
            return Err(Fail::new(libc::EEXIST, "duplicate step id"));
        }
        self.steps.push(JobStep {
            id,
            step_type,
            deps: ArrayVec::new(),
            inputs: ArrayVec::new(),
            outputs: ArrayVec::new(),
            working_set_kb: 0,
            peak_memory_kb: 0,
            ready: true,
            completed: false,
        });
        Ok(())
    }

    /// True iff `to` is reachable from `from` along dependency edges.
    fn reaches(&self, from: u32, to: u32) -> bool {
        if from == to {
            return true;
        }
        let mut stack: Vec<u32> = vec![from];
        let mut visited: Vec<u32> = Vec::new();
        while let Some(id) = stack.pop() {
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            if let Some(step) = self.step(id) {
                for &dep in &step.deps {
                    if dep == to {
                        return true;
                    }
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Records that `step` cannot run until `depends_on` completes. The dependent step drops out
    /// of the ready set. Edges that would close a cycle are refused.
    pub fn add_dep(&mut self, step: u32, depends_on: u32) -> Result<(), Fail> {
        if self.step(step).is_none() || self.step(depends_on).is_none() {
            return Err(Fail::new(libc::ENOENT, "unknown step id"));
        }
        if self.reaches(depends_on, step) {
            return Err(Fail::new(libc::EINVAL, "dependency would close a cycle"));
        }
        let s: &mut JobStep = self.step_mut(step).expect("existence checked above");
        if s.deps.is_full() {
            return Err(Fail::new(libc::ENOSPC, "step dependency capacity exhausted"));
        }
        s.deps.push(depends_on);
        s.ready = false;
        Ok(())
    }

    /// Registers a tensor.
    pub fn add_tensor(
        &mut self,
        id: u32,
        dtype: TensorDtype,
        num_elements: u32,
        pinned: bool,
        node_affinity: NodePreference,
    ) -> Result<(), Fail> {
        if self.tensors.is_full() {
            return Err(Fail::new(libc::ENOSPC, "job graph tensor capacity exhausted"));
        }
        if self.tensor(id).is_some() {
            return Err(Fail::new(libc::EEXIST, "duplicate tensor id"));
        }
        self.tensors.push(TensorDesc {
            id,
            dtype,
            num_elements,
            size_bytes: num_elements * dtype.elem_size(),
            pinned,
            node_affinity,
        });
        Ok(())
    }

    /// Attaches an existing tensor as an input of an existing step.
    pub fn step_add_input(&mut self, step: u32, tensor: u32) -> Result<(), Fail> {
        if self.tensor(tensor).is_none() {
            return Err(Fail::new(libc::ENOENT, "unknown tensor id"));
        }
        let s: &mut JobStep = match self.step_mut(step) {
            Some(s) => s,
            None => return Err(Fail::new(libc::ENOENT, "unknown step id")),
        };
        if s.inputs.is_full() {
            return Err(Fail::new(libc::ENOSPC, "step input capacity exhausted"));
        }
        s.inputs.push(tensor);
        Ok(())
    }

    /// Attaches an existing tensor as an output of an existing step.
    pub fn step_add_output(&mut self, step: u32, tensor: u32) -> Result<(), Fail> {
        if self.tensor(tensor).is_none() {
            return Err(Fail::new(libc::ENOENT, "unknown tensor id"));
        }
        let s: &mut JobStep = match self.step_mut(step) {
            Some(s) => s,
            None => return Err(Fail::new(libc::ENOENT, "unknown step id")),
        };
        if s.outputs.is_full() {
            return Err(Fail::new(libc::ENOSPC, "step output capacity exhausted"));
        }
        s.outputs.push(tensor);
        Ok(())
    }

    /// Marks a step completed and refreshes readiness across the graph. A rescan is O(steps *
    /// deps), which is fine at these capacities.
    pub fn mark_completed(&mut self, step: u32) {
        match self.step_mut(step) {
            Some(s) => s.completed = true,
            None => return,
        }

        for i in 0..self.steps.len() {
            if self.steps[i].completed {
                continue;
            }
            let all_done: bool = self.steps[i]
                .deps
                .iter()
                .all(|&dep| self.step(dep).map_or(false, |d| d.completed));
            if all_done {
                self.steps[i].ready = true;
            }
        }
    }

    /// Returns the first ready, incomplete step in insertion order.
    pub fn next_ready(&self) -> Option<u32> {
        self.steps.iter().find(|s| s.ready && !s.completed).map(|s| s.id)
    }

    /// Computes the memory metrics: per-step working sets from attached tensors, then the
    /// job-level peak, total, and pinned figures admission control checks against.
    pub fn compute_memory(&mut self) {
        let mut total: u32 = 0;
        let mut pinned: u32 = 0;
        for t in &self.tensors {
            total += t.size_kb();
            if t.pinned {
                pinned += t.size_kb();
            }
        }

        let mut peak: u32 = 0;
        for i in 0..self.steps.len() {
            let mut step_mem: u32 = 0;
            for &id in self.steps[i].inputs.iter().chain(self.steps[i].outputs.iter()) {
                if let Some(t) = self.tensor(id) {
                    step_mem += t.size_kb();
                }
            }
            self.steps[i].working_set_kb = step_mem;
            // Intermediates could push this higher; inputs plus outputs is the floor.
            self.steps[i].peak_memory_kb = step_mem;
            peak = peak.max(step_mem);
        }

        self.total_memory_kb = total;
        self.pinned_memory_kb = pinned;
        self.peak_memory_kb = peak;
    }

    pub fn total_memory_kb(&self) -> u32 {
        self.total_memory_kb
    }

    pub fn peak_memory_kb(&self) -> u32 {
        self.peak_memory_kb
    }

    pub fn pinned_memory_kb(&self) -> u32 {
        self.pinned_memory_kb
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        JobGraph,
        StepType,
    };
    use crate::{
        job::tensor::TensorDtype,
        mm::phys::NodePreference,
        runtime::limits::{
            MAX_JOB_STEPS,
            MAX_STEP_DEPS,
        },
    };
    use ::anyhow::Result;

    /// Builds a three-step diamond-ish graph: 0 -> 1, 0 -> 2.
    fn do_graph() -> Result<JobGraph> {
        let mut job: JobGraph = JobGraph::new(1);
        for id in 0..3 {
            if job.add_step(id, StepType::Compute).is_err() {
                anyhow::bail!("adding a step below capacity should be possible");
            }
        }
        job.add_dep(1, 0).unwrap();
        job.add_dep(2, 0).unwrap();
        Ok(job)
    }

    /// Tests readiness tracking across completions.
    #[test]
    fn readiness() -> Result<()> {
        let mut job: JobGraph = do_graph()?;

        crate::ensure_eq!(job.next_ready(), Some(0));
        crate::ensure_eq!(job.step(1).unwrap().ready, false);

        job.mark_completed(0);
        crate::ensure_eq!(job.step(1).unwrap().ready, true);
        crate::ensure_eq!(job.step(2).unwrap().ready, true);
        crate::ensure_eq!(job.next_ready(), Some(1));

        job.mark_completed(1);
        job.mark_completed(2);
        crate::ensure_eq!(job.next_ready(), None);
        Ok(())
    }

    /// Tests that readiness requires all dependencies, not just one.
    #[test]
    fn readiness_all_deps() -> Result<()> {
        let mut job: JobGraph = do_graph()?;
        job.add_step(3, StepType::Control).unwrap();
        job.add_dep(3, 1).unwrap();
        job.add_dep(3, 2).unwrap();

        job.mark_completed(0);
        job.mark_completed(1);
        crate::ensure_eq!(job.step(3).unwrap().ready, false);

        job.mark_completed(2);
        crate::ensure_eq!(job.step(3).unwrap().ready, true);
        Ok(())
    }

    /// Tests that cycle-closing edges are refused.
    #[test]
    fn reject_cycle() -> Result<()> {
        let mut job: JobGraph = do_graph()?;
        match job.add_dep(0, 1) {
            Ok(()) => anyhow::bail!("adding a cycle-closing dependency should fail"),
            Err(_) => {},
        }
        // Self-dependencies are the degenerate cycle.
        match job.add_dep(0, 0) {
            Ok(()) => anyhow::bail!("adding a self-dependency should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests capacity enforcement on steps and dependencies.
    #[test]
    fn capacity() -> Result<()> {
        let mut job: JobGraph = JobGraph::new(2);
        for id in 0..MAX_JOB_STEPS as u32 {
            job.add_step(id, StepType::Control).unwrap();
        }
        match job.add_step(MAX_JOB_STEPS as u32, StepType::Control) {
            Ok(()) => anyhow::bail!("adding a step past capacity should fail"),
            Err(_) => {},
        }

        for dep in 1..=MAX_STEP_DEPS as u32 {
            job.add_dep(0, dep).unwrap();
        }
        match job.add_dep(0, MAX_STEP_DEPS as u32 + 1) {
            Ok(()) => anyhow::bail!("adding a dependency past capacity should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests tensor bookkeeping and the memory analysis.
    #[test]
    fn memory_analysis() -> Result<()> {
        let mut job: JobGraph = do_graph()?;

        // 4 KiB pinned, 4 KiB, 4 KiB.
        job.add_tensor(1, TensorDtype::Fp32, 1024, true, NodePreference::Any).unwrap();
        job.add_tensor(2, TensorDtype::Fp16, 2048, false, NodePreference::Any)
            .unwrap();
        job.add_tensor(3, TensorDtype::Fp32, 1024, false, NodePreference::Any)
            .unwrap();

        match job.add_tensor(1, TensorDtype::Int8, 1, false, NodePreference::Any) {
            Ok(()) => anyhow::bail!("adding a duplicate tensor id should fail"),
            Err(_) => {},
        }

        job.step_add_input(0, 1).unwrap();
        job.step_add_output(0, 2).unwrap();
        job.step_add_input(1, 2).unwrap();
        job.step_add_output(1, 3).unwrap();
        job.step_add_input(2, 3).unwrap();

        match job.step_add_input(0, 99) {
            Ok(()) => anyhow::bail!("attaching an unknown tensor should fail"),
            Err(_) => {},
        }

        job.compute_memory();
        crate::ensure_eq!(job.step(0).unwrap().working_set_kb, 8);
        crate::ensure_eq!(job.step(2).unwrap().working_set_kb, 4);
        crate::ensure_eq!(job.peak_memory_kb(), 8);
        crate::ensure_eq!(job.total_memory_kb(), 12);
        crate::ensure_eq!(job.pinned_memory_kb(), 4);
        Ok(())
    }

    /// Tests sub-KiB tensors round up to a whole KiB.
    #[test]
    fn memory_rounds_up() -> Result<()> {
        let mut job: JobGraph = JobGraph::new(3);
        job.add_step(0, StepType::Compute).unwrap();
        job.add_tensor(1, TensorDtype::Int8, 10, false, NodePreference::Any).unwrap();
        job.step_add_input(0, 1).unwrap();

        job.compute_memory();
        crate::ensure_eq!(job.peak_memory_kb(), 1);
        crate::ensure_eq!(job.total_memory_kb(), 1);
        Ok(())
    }
}
