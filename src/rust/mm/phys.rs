// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    mm::map::{
        MemoryMap,
        MemoryRegion,
        RegionKind,
        EXTENDED_MEMORY_BASE,
    },
    runtime::{
        fail::Fail,
        limits::{
            MAX_MEM_REGIONS,
            PAGE_SIZE,
        },
        SharedObject,
    },
    trace::{
        EventType,
        SharedRecorder,
    },
};
use ::arrayvec::ArrayVec;
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Raw wire value for "any node".
pub const NODE_ANY_RAW: u8 = 0xFF;

/// Default physical extent of the kernel image: the megabyte above low memory.
const DEFAULT_KERNEL_RANGE: (u64, u64) = (0x10_0000, 0x20_0000);

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// One of the two simulated NUMA nodes. Node 0 is the lower half of usable memory
/// (latency-sensitive work), node 1 the upper half (background work).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumaNode {
    Local = 0,
    Remote = 1,
}

/// Node preference of an allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePreference {
    Node(NumaNode),
    Any,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Accounting for one NUMA node.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeInfo {
    pub start_pfn: u32,
    pub end_pfn: u32,
    pub total_pages: u32,
    pub free_pages: u32,
    pub used_pages: u32,
}

/// Aggregate memory statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct PmmStats {
    pub total_memory_kb: u64,
    pub free_memory_kb: u64,
    pub used_memory_kb: u64,
    pub total_pages: u32,
    pub free_pages: u32,
    pub num_regions: u32,
    pub num_nodes: u8,
}

/// Physical memory manager: a bitmap over 4 KiB frames parsed from a bootloader memory map, with
/// two simulated NUMA nodes splitting the usable range in half at a boundary fixed at init.
pub struct PhysMemory {
    /// Event sink.
    recorder: SharedRecorder,
    /// Allocation bitmap. Bit set means the frame is used.
    bitmap: Vec<u8>,
    /// Reservation bitmap. Reserved frames refuse frees.
    reserved: Vec<u8>,
    /// Copy of the bootloader regions, for diagnostics.
    regions: ArrayVec<MemoryRegion, MAX_MEM_REGIONS>,
    /// Per-node accounting.
    nodes: [NodeInfo; 2],
    /// First usable PFN, past low memory and the kernel image.
    usable_start_pfn: u32,
    /// First PFN owned by node 1.
    boundary_pfn: u32,
    /// Highest PFN backed by RAM.
    highest_pfn: u32,
    total_pages: u32,
    free_pages: u32,
}

/// A memory-manager handle shared across subsystems.
#[derive(Clone)]
pub struct SharedPhysMemory(SharedObject<PhysMemory>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl NumaNode {
    pub fn from_raw(raw: u8) -> Option<NumaNode> {
        match raw {
            0 => Some(NumaNode::Local),
            1 => Some(NumaNode::Remote),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn other(self) -> NumaNode {
        match self {
            NumaNode::Local => NumaNode::Remote,
            NumaNode::Remote => NumaNode::Local,
        }
    }
}

fn addr_to_pfn(addr: u64) -> u32 {
    (addr / PAGE_SIZE as u64) as u32
}

fn pfn_to_addr(pfn: u32) -> u64 {
    pfn as u64 * PAGE_SIZE as u64
}

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

impl PhysMemory {
    /// Initializes the manager from a bootloader memory map, reserving low memory and the default
    /// kernel image extent.
    pub fn new(map: &MemoryMap, recorder: SharedRecorder) -> Result<Self, Fail> {
        Self::with_kernel_range(map, recorder, DEFAULT_KERNEL_RANGE.0, DEFAULT_KERNEL_RANGE.1)
    }

    /// Initializes the manager with an explicit kernel image extent.
    pub fn with_kernel_range(
        map: &MemoryMap,
        recorder: SharedRecorder,
        kernel_start: u64,
        kernel_end: u64,
    ) -> Result<Self, Fail> {
        // Find the highest available frame.
        let mut highest_pfn: u32 = 0;
        for region in map.regions() {
            if region.kind != RegionKind::Available {
                continue;
            }
            let end: u64 = page_align_down(region.base + region.length);
            if end > 0 {
                highest_pfn = highest_pfn.max(addr_to_pfn(end) - 1);
            }
        }
        if highest_pfn == 0 {
            return Err(Fail::out_of_memory("memory map has no available regions"));
        }

        let num_pages: usize = highest_pfn as usize + 1;
        let bitmap_len: usize = (num_pages + 7) / 8;

        let mut pmm: PhysMemory = Self {
            recorder,
            // All frames start out used; available regions clear them below.
            bitmap: vec![0xFF; bitmap_len],
            reserved: vec![0; bitmap_len],
            regions: ArrayVec::new(),
            nodes: [NodeInfo::default(); 2],
            usable_start_pfn: 0,
            boundary_pfn: 0,
            highest_pfn,
            total_pages: num_pages as u32,
            free_pages: 0,
        };

        for region in map.regions() {
            if !pmm.regions.is_full() {
                pmm.regions.push(*region);
            }
            if region.kind != RegionKind::Available {
                continue;
            }

            // Align inward: partial frames at the edges stay unusable.
            let base: u64 = page_align_up(region.base);
            let end: u64 = page_align_down(region.base + region.length);
            if end <= base {
                continue;
            }
            for pfn in addr_to_pfn(base)..addr_to_pfn(end) {
                if pmm.test(pfn) {
                    pmm.clear(pfn);
                    pmm.free_pages += 1;
                }
            }
        }

        // Low memory and the kernel image are never handed out.
        pmm.reserve_range(0, EXTENDED_MEMORY_BASE);
        pmm.reserve_range(kernel_start, kernel_end.saturating_sub(kernel_start));

        // Split what remains into the two nodes.
        let usable_start: u32 = if kernel_end > EXTENDED_MEMORY_BASE {
            addr_to_pfn(page_align_up(kernel_end))
        } else {
            addr_to_pfn(EXTENDED_MEMORY_BASE)
        };
        if usable_start > highest_pfn {
            return Err(Fail::out_of_memory("no usable memory above the kernel image"));
        }
        let usable_pages: u32 = highest_pfn - usable_start + 1;
        let boundary: u32 = usable_start + usable_pages / 2;

        pmm.usable_start_pfn = usable_start;
        pmm.boundary_pfn = boundary;
        pmm.nodes[0] = NodeInfo {
            start_pfn: usable_start,
            end_pfn: boundary,
            total_pages: boundary - usable_start,
            free_pages: 0,
            used_pages: 0,
        };
        pmm.nodes[1] = NodeInfo {
            start_pfn: boundary,
            end_pfn: highest_pfn + 1,
            total_pages: highest_pfn + 1 - boundary,
            free_pages: 0,
            used_pages: 0,
        };
        for pfn in usable_start..=highest_pfn {
            if !pmm.test(pfn) {
                let node: usize = if pfn < boundary { 0 } else { 1 };
                pmm.nodes[node].free_pages += 1;
            }
        }
        for node in pmm.nodes.iter_mut() {
            node.used_pages = node.total_pages - node.free_pages;
        }

        debug!(
            "with_kernel_range(): node 0 pfn {}..{} ({} free), node 1 pfn {}..{} ({} free)",
            pmm.nodes[0].start_pfn,
            pmm.nodes[0].end_pfn,
            pmm.nodes[0].free_pages,
            pmm.nodes[1].start_pfn,
            pmm.nodes[1].end_pfn,
            pmm.nodes[1].free_pages
        );

        let free_pages: u32 = pmm.free_pages;
        pmm.recorder.log(EventType::Boot, 0, 0, free_pages);

        Ok(pmm)
    }

    fn test(&self, pfn: u32) -> bool {
        if pfn > self.highest_pfn {
            return true;
        }
        (self.bitmap[pfn as usize / 8] >> (pfn % 8)) & 1 != 0
    }

    fn set(&mut self, pfn: u32) {
        if pfn <= self.highest_pfn {
            self.bitmap[pfn as usize / 8] |= 1 << (pfn % 8);
        }
    }

    fn clear(&mut self, pfn: u32) {
        if pfn <= self.highest_pfn {
            self.bitmap[pfn as usize / 8] &= !(1 << (pfn % 8));
        }
    }

    fn is_reserved(&self, pfn: u32) -> bool {
        pfn <= self.highest_pfn && (self.reserved[pfn as usize / 8] >> (pfn % 8)) & 1 != 0
    }

    fn node_of_pfn(&self, pfn: u32) -> NumaNode {
        if pfn >= self.boundary_pfn {
            NumaNode::Remote
        } else {
            NumaNode::Local
        }
    }

    /// Allocates one frame from within a node's range.
    fn alloc_from_node(&mut self, node: NumaNode) -> Option<u64> {
        let info: NodeInfo = self.nodes[node.raw() as usize];
        for pfn in info.start_pfn..info.end_pfn {
            if !self.test(pfn) {
                self.set(pfn);
                self.free_pages -= 1;
                self.nodes[node.raw() as usize].free_pages -= 1;
                self.nodes[node.raw() as usize].used_pages += 1;
                return Some(pfn_to_addr(pfn));
            }
        }
        None
    }

    /// Allocates one 4 KiB frame, preferring the given node. Falls back to the other node on
    /// exhaustion, logging a locality miss with the node actually used.
    pub fn alloc_page(&mut self, pref: NodePreference) -> Result<u64, Fail> {
        match pref {
            NodePreference::Any => {
                if let Some(addr) = self.alloc_from_node(NumaNode::Local) {
                    return Ok(addr);
                }
                if let Some(addr) = self.alloc_from_node(NumaNode::Remote) {
                    self.recorder
                        .log(EventType::MemLocalityMiss, 0, 0, NumaNode::Remote.raw() as u32);
                    return Ok(addr);
                }
                self.recorder.log(EventType::MemAllocFail, 0, NODE_ANY_RAW as u32, 1);
                error!("alloc_page(): out of memory");
                Err(Fail::out_of_memory("no free frames on any node"))
            },
            NodePreference::Node(node) => {
                if let Some(addr) = self.alloc_from_node(node) {
                    return Ok(addr);
                }
                let fallback: NumaNode = node.other();
                if let Some(addr) = self.alloc_from_node(fallback) {
                    self.recorder
                        .log(EventType::MemLocalityMiss, 0, node.raw() as u32, fallback.raw() as u32);
                    return Ok(addr);
                }
                self.recorder.log(EventType::MemAllocFail, 0, node.raw() as u32, 1);
                error!("alloc_page(): out of memory");
                Err(Fail::out_of_memory("no free frames on any node"))
            },
        }
    }

    /// Allocates one frame for a raw node id off the wire. Unknown ids log an event and fall
    /// back to node 0.
    pub fn alloc_page_raw(&mut self, raw_node: u8) -> Result<u64, Fail> {
        let pref: NodePreference = match raw_node {
            NODE_ANY_RAW => NodePreference::Any,
            raw => match NumaNode::from_raw(raw) {
                Some(node) => NodePreference::Node(node),
                None => {
                    warn!("alloc_page_raw(): unsupported node {}, falling back to node 0", raw);
                    self.recorder.log(EventType::MemNodeUnsupported, 0, 0, raw as u32);
                    NodePreference::Node(NumaNode::Local)
                },
            },
        };
        self.alloc_page(pref)
    }

    /// Searches `range` for `count` contiguous free frames, skipping past collisions.
    fn find_contiguous(&self, start: u32, end: u32, count: u32) -> Option<u32> {
        let mut pfn: u32 = start;
        'outer: while pfn + count <= end {
            for i in 0..count {
                if self.test(pfn + i) {
                    pfn = pfn + i + 1;
                    continue 'outer;
                }
            }
            return Some(pfn);
        }
        None
    }

    fn commit_run(&mut self, start: u32, count: u32) -> u64 {
        for pfn in start..start + count {
            self.set(pfn);
            let node: usize = self.node_of_pfn(pfn).raw() as usize;
            self.nodes[node].free_pages -= 1;
            self.nodes[node].used_pages += 1;
        }
        self.free_pages -= count;
        pfn_to_addr(start)
    }

    /// Allocates `count` contiguous frames within the preferred node, falling back to the other
    /// node as a whole on failure.
    pub fn alloc_pages(&mut self, count: u32, pref: NodePreference) -> Result<u64, Fail> {
        if count == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot allocate zero pages"));
        }
        if count == 1 {
            return self.alloc_page(pref);
        }

        let (search, requested_raw): ([Option<NumaNode>; 2], u8) = match pref {
            NodePreference::Any => ([None, None], NODE_ANY_RAW),
            NodePreference::Node(node) => ([Some(node), Some(node.other())], node.raw()),
        };

        if let NodePreference::Any = pref {
            // A run may span the node boundary in this mode.
            if let Some(start) = self.find_contiguous(self.usable_start_pfn, self.highest_pfn + 1, count) {
                return Ok(self.commit_run(start, count));
            }
        } else {
            for (attempt, node) in search.iter().flatten().enumerate() {
                let info: NodeInfo = self.nodes[node.raw() as usize];
                if let Some(start) = self.find_contiguous(info.start_pfn, info.end_pfn, count) {
                    let addr: u64 = self.commit_run(start, count);
                    if attempt > 0 {
                        self.recorder
                            .log(EventType::MemLocalityMiss, 0, requested_raw as u32, node.raw() as u32);
                    }
                    return Ok(addr);
                }
            }
        }

        self.recorder.log(EventType::MemAllocFail, 0, requested_raw as u32, count);
        error!("alloc_pages(): cannot allocate {} contiguous pages", count);
        Err(Fail::out_of_memory("no contiguous run of frames"))
    }

    /// Returns one frame. Out-of-range, reserved, and double frees warn and leave state alone.
    pub fn free_page(&mut self, addr: u64) {
        let pfn: u32 = addr_to_pfn(addr);

        if pfn > self.highest_pfn {
            warn!("free_page(): freeing invalid page (addr={:#x})", addr);
            return;
        }
        if self.is_reserved(pfn) {
            warn!("free_page(): freeing reserved page (addr={:#x})", addr);
            return;
        }
        if !self.test(pfn) {
            warn!("free_page(): double free detected (addr={:#x})", addr);
            return;
        }

        self.clear(pfn);
        self.free_pages += 1;

        let node: usize = self.node_of_pfn(pfn).raw() as usize;
        if pfn >= self.nodes[node].start_pfn && pfn < self.nodes[node].end_pfn {
            self.nodes[node].free_pages += 1;
            self.nodes[node].used_pages -= 1;
        }
    }

    /// Returns a run of frames.
    pub fn free_pages(&mut self, addr: u64, count: u32) {
        for i in 0..count {
            self.free_page(addr + i as u64 * PAGE_SIZE as u64);
        }
    }

    /// Marks a byte range as permanently reserved, aligning outward. Idempotent.
    pub fn reserve_range(&mut self, base: u64, length: u64) {
        let start: u64 = page_align_down(base);
        let end: u64 = page_align_up(base + length);

        for pfn in addr_to_pfn(start)..addr_to_pfn(end) {
            if pfn > self.highest_pfn {
                break;
            }
            if !self.test(pfn) {
                self.set(pfn);
                self.free_pages -= 1;
                let node: usize = self.node_of_pfn(pfn).raw() as usize;
                if pfn >= self.nodes[node].start_pfn && pfn < self.nodes[node].end_pfn {
                    self.nodes[node].free_pages -= 1;
                    self.nodes[node].used_pages += 1;
                }
            }
            self.reserved[pfn as usize / 8] |= 1 << (pfn % 8);
        }
    }

    /// Maps an address to the node owning it.
    pub fn addr_to_node(&self, addr: u64) -> NumaNode {
        let pfn: u32 = addr_to_pfn(addr);
        for (i, node) in self.nodes.iter().enumerate() {
            if pfn >= node.start_pfn && pfn < node.end_pfn {
                // Index tracks the enum discriminants.
                return if i == 0 { NumaNode::Local } else { NumaNode::Remote };
            }
        }
        NumaNode::Local
    }

    pub fn node(&self, node: NumaNode) -> &NodeInfo {
        &self.nodes[node.raw() as usize]
    }

    pub fn boundary_pfn(&self) -> u32 {
        self.boundary_pfn
    }

    pub fn usable_start_pfn(&self) -> u32 {
        self.usable_start_pfn
    }

    pub fn free_page_count(&self) -> u32 {
        self.free_pages
    }

    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_memory_kb: (self.highest_pfn as u64 + 1) * 4,
            free_memory_kb: self.free_pages as u64 * 4,
            used_memory_kb: (self.highest_pfn as u64 + 1) * 4 - self.free_pages as u64 * 4,
            total_pages: self.total_pages,
            free_pages: self.free_pages,
            num_regions: self.regions.len() as u32,
            num_nodes: 2,
        }
    }

    /// Dumps the region table and NUMA topology through the logging facade.
    pub fn dump_map(&self) {
        debug!("=== memory map ===");
        for (i, region) in self.regions.iter().enumerate() {
            debug!(
                "region {}: base={:#010x} length={:#010x} kind={:?}",
                i, region.base, region.length, region.kind
            );
        }
        for (i, node) in self.nodes.iter().enumerate() {
            debug!(
                "node {}: {} KB free / {} KB total",
                i,
                node.free_pages * 4,
                node.total_pages * 4
            );
        }
        debug!("=== end map ===");
    }
}

impl SharedPhysMemory {
    pub fn new(map: &MemoryMap, recorder: SharedRecorder) -> Result<Self, Fail> {
        Ok(Self(SharedObject::new(PhysMemory::new(map, recorder)?)))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedPhysMemory {
    type Target = PhysMemory;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedPhysMemory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        NodePreference,
        NumaNode,
        PhysMemory,
    };
    use crate::{
        mm::map::MemoryMap,
        pal::LogicalPlatform,
        runtime::SharedClock,
        trace::{
            EventType,
            SharedRecorder,
        },
    };
    use ::anyhow::Result;
    use ::std::rc::Rc;

    /// 128 MiB machine.
    const TOTAL_BYTES: u64 = 128 * 1024 * 1024;

    fn do_pmm() -> Result<PhysMemory> {
        let platform: LogicalPlatform = LogicalPlatform::new();
        let clock: SharedClock = SharedClock::calibrate(Rc::new(platform), 1);
        let recorder: SharedRecorder = SharedRecorder::new(clock, 256)?;
        match PhysMemory::new(&MemoryMap::flat(TOTAL_BYTES), recorder) {
            Ok(pmm) => Ok(pmm),
            Err(e) => anyhow::bail!("initializing the memory manager should be possible: {:?}", e),
        }
    }

    /// Tests the node split: the boundary sits halfway into the usable range.
    #[test]
    fn node_split() -> Result<()> {
        let pmm: PhysMemory = do_pmm()?;

        // 128 MiB = 32768 frames; low memory and the 1 MiB kernel image are reserved.
        let usable: u32 = 32767 - pmm.usable_start_pfn() + 1;
        crate::ensure_eq!(pmm.boundary_pfn(), pmm.usable_start_pfn() + usable / 2);
        crate::ensure_eq!(
            pmm.node(NumaNode::Local).total_pages,
            pmm.boundary_pfn() - pmm.usable_start_pfn()
        );
        crate::ensure_eq!(pmm.node(NumaNode::Remote).end_pfn, 32768);
        Ok(())
    }

    /// Tests allocation conservation: frees restore the exact free count.
    #[test]
    fn conservation() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;
        let before: u32 = pmm.free_page_count();

        let mut addrs: Vec<u64> = Vec::new();
        for _ in 0..5 {
            addrs.push(pmm.alloc_page(NodePreference::Node(NumaNode::Local)).unwrap());
        }
        crate::ensure_eq!(pmm.free_page_count(), before - 5);

        for addr in addrs {
            pmm.free_page(addr);
        }
        crate::ensure_eq!(pmm.free_page_count(), before);
        Ok(())
    }

    /// Tests node containment: local allocations land below the boundary.
    #[test]
    fn node_containment() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;
        for _ in 0..5 {
            let addr: u64 = pmm.alloc_page(NodePreference::Node(NumaNode::Local)).unwrap();
            crate::ensure_eq!(pmm.addr_to_node(addr), NumaNode::Local);
        }
        Ok(())
    }

    /// Tests the fallback path: exhausting node 0 spills to node 1 with a locality miss logged.
    #[test]
    fn locality_fallback() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;

        let local_free: u32 = pmm.node(NumaNode::Local).free_pages;
        for _ in 0..local_free {
            pmm.alloc_page(NodePreference::Node(NumaNode::Local)).unwrap();
        }
        crate::ensure_eq!(pmm.node(NumaNode::Local).free_pages, 0);

        let addr: u64 = match pmm.alloc_page(NodePreference::Node(NumaNode::Local)) {
            Ok(addr) => addr,
            Err(_) => anyhow::bail!("fallback allocation should succeed while node 1 has frames"),
        };
        crate::ensure_eq!(pmm.addr_to_node(addr), NumaNode::Remote);

        let misses: usize = pmm
            .recorder
            .events()
            .filter(|e| e.kind == EventType::MemLocalityMiss)
            .count();
        crate::ensure_eq!(misses, 1);
        Ok(())
    }

    /// Tests double-free and reserved-free policing.
    #[test]
    fn free_policing() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;
        let before: u32 = pmm.free_page_count();

        let addr: u64 = pmm.alloc_page(NodePreference::Any).unwrap();
        pmm.free_page(addr);
        pmm.free_page(addr); // double free: no-op
        crate::ensure_eq!(pmm.free_page_count(), before);

        pmm.free_page(0x10_0000); // kernel image: reserved, no-op
        crate::ensure_eq!(pmm.free_page_count(), before);

        pmm.free_page(u64::MAX & !0xFFF); // out of range: no-op
        crate::ensure_eq!(pmm.free_page_count(), before);
        Ok(())
    }

    /// Tests reservation idempotency.
    #[test]
    fn reserve_idempotent() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;
        let before: u32 = pmm.free_page_count();

        let base: u64 = pmm.node(NumaNode::Remote).start_pfn as u64 * 4096;
        pmm.reserve_range(base, 4 * 4096);
        crate::ensure_eq!(pmm.free_page_count(), before - 4);

        pmm.reserve_range(base, 4 * 4096);
        crate::ensure_eq!(pmm.free_page_count(), before - 4);
        Ok(())
    }

    /// Tests contiguous allocation: the run is sequential and within the requested node.
    #[test]
    fn contiguous_run() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;

        // Punch a hole so the scan has a collision to skip past.
        let first: u64 = pmm.alloc_page(NodePreference::Node(NumaNode::Local)).unwrap();
        let second: u64 = pmm.alloc_page(NodePreference::Node(NumaNode::Local)).unwrap();
        pmm.free_page(first);
        crate::ensure_eq!(second, first + 4096);

        let run: u64 = match pmm.alloc_pages(8, NodePreference::Node(NumaNode::Local)) {
            Ok(run) => run,
            Err(_) => anyhow::bail!("allocating a contiguous run should succeed"),
        };
        // The single free frame before the hole cannot hold the run.
        crate::ensure_eq!(run, second + 4096);
        crate::ensure_eq!(pmm.addr_to_node(run + 7 * 4096), NumaNode::Local);

        pmm.free_pages(run, 8);
        Ok(())
    }

    /// Tests that unknown raw node ids are logged and served from node 0.
    #[test]
    fn unknown_node_raw() -> Result<()> {
        let mut pmm: PhysMemory = do_pmm()?;
        let addr: u64 = pmm.alloc_page_raw(7).unwrap();
        crate::ensure_eq!(pmm.addr_to_node(addr), NumaNode::Local);

        let unsupported: usize = pmm
            .recorder
            .events()
            .filter(|e| e.kind == EventType::MemNodeUnsupported)
            .count();
        crate::ensure_eq!(unsupported, 1);
        Ok(())
    }
}
