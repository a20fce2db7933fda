// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod wait;

pub use self::wait::wait_until;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    contract::{
        ContractEngine,
        SharedContract,
    },
    ipc::{
        transport::Transport,
        wire::{
            ResponsePacket,
            CMD_RUN_MODEL,
            RSP_OK,
        },
    },
    job::graph::{
        JobGraph,
        StepType,
    },
    pal::Platform,
    runtime::{
        config::Config,
        fail::Fail,
        SharedClock,
    },
    trace::{
        EventType,
        JobStats,
        SharedRecorder,
        TraceSpan,
    },
};
use ::core::hint;
use ::std::rc::Rc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler tunables, lifted from the [Config].
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Spin budget of the offload wait, in microseconds.
    pub spin_budget_us: u64,
    /// Total offload deadline, in milliseconds.
    pub deadline_ms: u64,
    /// Busy-loop iterations simulating a non-offloaded step.
    pub sim_spin_iters: u32,
    /// Halt the job on an offload timeout instead of continuing.
    pub abort_on_timeout: bool,
}

/// What a finished (or halted) job run looked like.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobReport {
    pub job_id: u32,
    pub steps_completed: u32,
    pub total_cpu_us: u64,
    pub total_wall_us: u64,
    pub violations: u32,
    /// Offloaded steps whose responses never arrived.
    pub timeouts: u32,
    /// The contract entered safe mode and the walk stopped early.
    pub halted: bool,
}

/// Drives one job to completion in a single thread: walks ready steps in dependency order,
/// executes each under a trace span, offloads compute steps through the transport, and checks
/// every measured duration against the contract's per-step budget.
pub struct Scheduler {
    clock: SharedClock,
    recorder: SharedRecorder,
    platform: Rc<dyn Platform>,
    config: SchedulerConfig,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            spin_budget_us: config.spin_budget_us,
            deadline_ms: config.deadline_ms,
            sim_spin_iters: config.sim_spin_iters,
            abort_on_timeout: config.abort_on_timeout,
        }
    }
}

impl Scheduler {
    pub fn new(
        clock: SharedClock,
        recorder: SharedRecorder,
        platform: Rc<dyn Platform>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            clock,
            recorder,
            platform,
            config,
        }
    }

    /// Runs a job under a contract. Every step is attempted exactly once, in an order consistent
    /// with its dependencies, insertion order breaking ties. If the contract enters safe mode the
    /// walk halts before the next step and the report carries partial stats.
    pub fn run_job(
        &mut self,
        job: &mut JobGraph,
        contract: &mut SharedContract,
        engine: &mut ContractEngine,
        transport: &Transport,
    ) -> JobReport {
        let job_id: u32 = job.id();
        let num_steps: u32 = job.num_steps().max(1);
        debug!("run_job(): job {} begin (budget {}us)", job_id, contract.cpu_budget_us);
        self.recorder.log(EventType::JobSubmit, job_id, 0, job.num_steps());

        let mut timeouts: u32 = 0;
        let mut halted: bool = false;

        loop {
            if !contract.can_continue() {
                warn!("run_job(): job {} halted: contract in safe mode", job_id);
                halted = true;
                break;
            }
            let sid: u32 = match job.next_ready() {
                Some(sid) => sid,
                None => break,
            };
            let (step_type, payload_id): (StepType, u32) = match job.step(sid) {
                Some(s) => (s.step_type, s.inputs.first().copied().unwrap_or(0)),
                None => break,
            };

            let span: TraceSpan = self.recorder.begin_span(EventType::StepStart, job_id, sid);
            let timed_out: bool = match self.execute_step(job_id, sid, step_type, payload_id, transport) {
                Ok(()) => false,
                Err(e) => e.errno == libc::ETIMEDOUT,
            };
            self.recorder.end_span(span, EventType::StepEnd);

            // Per-step budget enforcement from the measured duration.
            let duration_us: u64 = self.recorder.last_duration(job_id, sid);
            let per_step_budget: u64 = contract.cpu_budget_us as u64 / num_steps as u64;
            if duration_us > per_step_budget {
                warn!(
                    "run_job(): step {} took {}us (limit {}us)",
                    sid, duration_us, per_step_budget
                );
                self.recorder
                    .log(EventType::ContractBudgetExceed, job_id, sid, duration_us as u32);
            } else if duration_us * 10 > per_step_budget * 8 {
                self.recorder
                    .log(EventType::ContractBudgetWarn, job_id, sid, duration_us as u32);
            }
            engine.charge_cpu(contract, duration_us as u32);

            job.mark_completed(sid);

            if timed_out {
                timeouts += 1;
                if self.config.abort_on_timeout {
                    warn!("run_job(): job {} aborted after step {} timed out", job_id, sid);
                    halted = true;
                    break;
                }
            }
        }

        self.recorder.log(EventType::JobComplete, job_id, 0, 0);
        let stats: JobStats = self.recorder.job_stats(job_id);
        debug!(
            "run_job(): job {} end: {} steps, {}us cpu, {} violations",
            job_id, stats.steps_completed, stats.total_cpu_us, stats.violations
        );

        JobReport {
            job_id,
            steps_completed: stats.steps_completed,
            total_cpu_us: stats.total_cpu_us,
            total_wall_us: stats.total_wall_us,
            violations: stats.violations,
            timeouts,
            halted,
        }
    }

    /// Executes one step. Compute steps offload to the accelerator and wait adaptively; all
    /// other types are simulated inline with a bounded busy loop.
    fn execute_step(
        &mut self,
        job_id: u32,
        sid: u32,
        step_type: StepType,
        payload_id: u32,
        transport: &Transport,
    ) -> Result<(), Fail> {
        if step_type != StepType::Compute {
            trace!("execute_step(): simulating step {} ({:?})", sid, step_type);
            for _ in 0..self.config.sim_spin_iters {
                hint::spin_loop();
            }
            return Ok(());
        }

        debug!("execute_step(): offloading step {} (payload {})", sid, payload_id);
        let send_cycles: u64 = self.clock.now_cycles();
        self.recorder.log(EventType::AccelSubmit, job_id, sid, payload_id);

        if let Err(e) = transport.send(CMD_RUN_MODEL, payload_id) {
            // Transport backpressure; surfaced in the trace so the stall is reconstructible.
            self.recorder.log(EventType::IoStall, job_id, sid, 0);
            return Err(e);
        }

        let deadline_us: u64 = self.config.deadline_ms * 1000;
        match wait_until(
            &self.clock,
            self.platform.as_ref(),
            || transport.has_response(),
            self.config.spin_budget_us,
            deadline_us,
        ) {
            Ok(_) => {},
            Err(e) => {
                warn!("execute_step(): timeout waiting for remote execution of step {}", sid);
                self.recorder.log(EventType::IoStall, job_id, sid, self.config.deadline_ms as u32);
                return Err(e);
            },
        }

        let response: ResponsePacket = match transport.poll_response() {
            Some(response) => response,
            // The wait saw the response; a single consumer cannot lose it.
            None => return Err(Fail::new(libc::EIO, "response ring drained unexpectedly")),
        };

        let total_rtt_us: u64 = self.clock.cycles_to_us(self.clock.now_cycles().saturating_sub(send_cycles));
        let server_us: u64 = response.timestamp_us;
        let transport_us: u64 = total_rtt_us.saturating_sub(server_us);
        debug!(
            "execute_step(): step {} complete, result={:#x}, rtt={}us (server={}us, transport={}us)",
            sid, response.result, total_rtt_us, server_us, transport_us
        );

        if response.status != RSP_OK {
            warn!("execute_step(): remote error status {:#x}", response.status);
        }
        self.recorder.log(EventType::AccelComplete, job_id, sid, response.result);
        Ok(())
    }
}
