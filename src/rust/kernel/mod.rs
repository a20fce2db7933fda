// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    contract::{
        AdmitResult,
        ContractEngine,
        SharedContract,
    },
    ipc::{
        heap::{
            BlobHeap,
            SharedBlobHeap,
        },
        peer::PeerEndpoint,
        segment::SharedSegment,
        transport::Transport,
    },
    job::graph::JobGraph,
    mm::{
        map::MemoryMap,
        phys::SharedPhysMemory,
    },
    pal::Platform,
    runtime::{
        config::Config,
        fail::Fail,
        logging,
        SharedClock,
    },
    sched::{
        JobReport,
        Scheduler,
        SchedulerConfig,
    },
    trace::SharedRecorder,
};
use ::std::rc::Rc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// The kernel context: one instance wires the time source, flight recorder, physical memory
/// manager, contract engine, transport, shared heap, and scheduler together. There are no hidden
/// singletons; tests instantiate independent kernels freely, each over its own segment.
pub struct EdgeKernel {
    #[allow(unused)]
    platform: Rc<dyn Platform>,
    clock: SharedClock,
    recorder: SharedRecorder,
    pmm: SharedPhysMemory,
    engine: ContractEngine,
    segment: SharedSegment,
    transport: Transport,
    heap: SharedBlobHeap,
    scheduler: Scheduler,
    config: Config,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl EdgeKernel {
    /// Boots a kernel context: calibrates the clock, initializes memory management from the
    /// bootloader map, and sets up the accelerator transport as the host side of the segment.
    pub fn new(config: Config, platform: Rc<dyn Platform>, map: &MemoryMap) -> Result<EdgeKernel, Fail> {
        logging::initialize();

        let clock: SharedClock = SharedClock::calibrate(platform.clone(), config.calibrate_ms);
        let recorder: SharedRecorder = SharedRecorder::new(clock.clone(), config.trace_capacity)?;
        let pmm: SharedPhysMemory = SharedPhysMemory::new(map, recorder.clone())?;
        let engine: ContractEngine = ContractEngine::new(recorder.clone(), pmm.clone());

        let segment: SharedSegment = Self::open_segment(&config)?;
        let transport: Transport = Transport::host(&segment, clock.clone(), config.ring_size)?;
        let heap: SharedBlobHeap = SharedBlobHeap::create_on(&segment)?;

        let scheduler: Scheduler = Scheduler::new(
            clock.clone(),
            recorder.clone(),
            platform.clone(),
            SchedulerConfig::from_config(&config),
        );

        info!("kernel context up ({} frames free)", pmm.free_page_count());

        Ok(Self {
            platform,
            clock,
            recorder,
            pmm,
            engine,
            segment,
            transport,
            heap,
            scheduler,
            config,
        })
    }

    #[cfg(target_os = "linux")]
    fn open_segment(config: &Config) -> Result<SharedSegment, Fail> {
        if config.shm_name.is_empty() {
            SharedSegment::anonymous()
        } else {
            SharedSegment::create(&config.shm_name)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn open_segment(config: &Config) -> Result<SharedSegment, Fail> {
        if config.shm_name.is_empty() {
            SharedSegment::anonymous()
        } else {
            Err(Fail::new(
                libc::EINVAL,
                "named shared memory segments are only supported on linux",
            ))
        }
    }

    /// Applies and registers a contract.
    pub fn apply_contract(&mut self, contract: &mut SharedContract) -> Result<(), Fail> {
        self.engine.apply(contract)
    }

    /// Admission control for a job graph against a contract.
    pub fn admit(&mut self, contract: &SharedContract, job: &JobGraph) -> AdmitResult {
        self.engine.admit(contract, job)
    }

    /// Runs an admitted job under its contract.
    pub fn run_job(&mut self, job: &mut JobGraph, contract: &mut SharedContract) -> JobReport {
        let EdgeKernel {
            scheduler,
            engine,
            transport,
            ..
        } = self;
        scheduler.run_job(job, contract, engine, transport)
    }

    /// Attaches the accelerator-side endpoint over this kernel's segment.
    pub fn peer(&self) -> Result<PeerEndpoint, Fail> {
        PeerEndpoint::attach(&self.segment)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn recorder(&self) -> &SharedRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut SharedRecorder {
        &mut self.recorder
    }

    pub fn pmm(&self) -> &SharedPhysMemory {
        &self.pmm
    }

    pub fn pmm_mut(&mut self) -> &mut SharedPhysMemory {
        &mut self.pmm
    }

    pub fn engine_mut(&mut self) -> &mut ContractEngine {
        &mut self.engine
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn heap_mut(&mut self) -> &mut BlobHeap {
        &mut self.heap
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dumps transport, memory, and trace state through the logging facade.
    pub fn dump(&self) {
        self.transport.dump();
        self.pmm.dump_map();
        self.heap.dump();
        self.recorder.dump();
    }
}
