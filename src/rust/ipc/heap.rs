// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::raw_region::RegionView,
    ipc::{
        segment::SharedSegment,
        wire::{
            BLOB_MAGIC,
            HEAP_CTL_OFFSET,
            HEAP_CTL_SIZE,
            HEAP_DATA_OFFSET,
            HEAP_DATA_SIZE,
            HEAP_MAGIC,
            PROTOCOL_VERSION,
        },
    },
    job::tensor::TensorDtype,
    runtime::{
        fail::Fail,
        SharedObject,
    },
};
use ::bit_iter::BitIter;
use ::std::{
    collections::HashMap,
    ops::{
        Deref,
        DerefMut,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Allocation granularity of the heap.
pub const BLOCK_SIZE: u32 = 64;

/// Size of a blob header on the wire.
pub const BLOB_HEADER_SIZE: u32 = 32;

/// Size of the tensor header embedded in tensor blobs.
pub const TENSOR_HEADER_SIZE: u32 = 36;

/// Maximum tensor rank.
pub const MAX_TENSOR_NDIM: usize = 4;

// Heap control block field offsets.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_TOTAL_BLOCKS: usize = 8;
const OFF_FREE_BLOCKS: usize = 12;
const OFF_NEXT_BLOB_ID: usize = 16;
const OFF_BITMAP: usize = 32;

// Blob header field offsets.
const BLOB_OFF_MAGIC: usize = 0;
const BLOB_OFF_ID: usize = 4;
const BLOB_OFF_TYPE: usize = 6;
const BLOB_OFF_FLAGS: usize = 7;
const BLOB_OFF_SIZE: usize = 8;
const BLOB_OFF_OFFSET: usize = 12;
const BLOB_OFF_CHECKSUM: usize = 16;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// What kind of data a blob carries.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobType {
    Raw = 0,
    Tensor = 1,
    ModelRef = 2,
    Result = 3,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Decoded blob header.
#[derive(Clone, Copy, Debug)]
pub struct BlobHeader {
    pub blob_id: u16,
    pub blob_type: u8,
    pub flags: u8,
    /// Payload size, excluding this header.
    pub size: u32,
    /// Offset of the payload from the heap data base.
    pub offset: u32,
    pub checksum: u32,
}

/// Local record of an allocation.
#[derive(Clone, Copy)]
struct BlobEntry {
    /// Header offset from the heap data base.
    offset: u32,
    blocks: u32,
}

/// Bitmap allocator of 64-byte blocks over the shared heap region, passing typed blobs between
/// the kernel and the accelerator. The bitmap in the control block is authoritative and shared;
/// the id-to-offset index is local to each side, so lookups of peer-allocated blobs fall back to
/// scanning the region for headers. Blob ownership transfers with the command/response pair.
pub struct BlobHeap {
    /// Control block window (header + bitmap).
    ctl: RegionView,
    /// Data region window.
    data: RegionView,
    total_blocks: u32,
    /// Local id-to-offset cache.
    index: HashMap<u16, BlobEntry>,
}

/// A heap handle shared across subsystems on one side.
#[derive(Clone)]
pub struct SharedBlobHeap(SharedObject<BlobHeap>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl BlobType {
    pub fn from_raw(raw: u8) -> Option<BlobType> {
        match raw {
            0 => Some(BlobType::Raw),
            1 => Some(BlobType::Tensor),
            2 => Some(BlobType::ModelRef),
            3 => Some(BlobType::Result),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }
}

impl BlobHeap {
    /// Initializes the heap over a segment. Call on exactly one side.
    pub fn create_on(segment: &SharedSegment) -> Result<BlobHeap, Fail> {
        let ctl: RegionView = segment.view(HEAP_CTL_OFFSET, HEAP_CTL_SIZE)?;
        let data: RegionView = segment.view(HEAP_DATA_OFFSET, HEAP_DATA_SIZE)?;
        Self::create(ctl, data)
    }

    /// Attaches to a heap the other side initialized.
    pub fn attach_on(segment: &SharedSegment) -> Result<BlobHeap, Fail> {
        let ctl: RegionView = segment.view(HEAP_CTL_OFFSET, HEAP_CTL_SIZE)?;
        let data: RegionView = segment.view(HEAP_DATA_OFFSET, HEAP_DATA_SIZE)?;
        Self::attach(ctl, data)
    }

    pub fn create(ctl: RegionView, data: RegionView) -> Result<BlobHeap, Fail> {
        let total_blocks: u32 = (data.len() as u32) / BLOCK_SIZE;
        let bitmap_len: usize = ((total_blocks as usize) + 7) / 8;
        if OFF_BITMAP + bitmap_len > ctl.len() {
            return Err(Fail::new(libc::EINVAL, "heap control region cannot hold the bitmap"));
        }

        ctl.write_u32(OFF_MAGIC, HEAP_MAGIC);
        ctl.write_u32(OFF_VERSION, PROTOCOL_VERSION);
        ctl.write_u32(OFF_TOTAL_BLOCKS, total_blocks);
        ctl.write_u32(OFF_FREE_BLOCKS, total_blocks);
        ctl.write_u32(OFF_NEXT_BLOB_ID, 1);
        ctl.fill_zero(OFF_BITMAP, bitmap_len);

        debug!("create(): {} blocks of {} bytes", total_blocks, BLOCK_SIZE);

        Ok(Self {
            ctl,
            data,
            total_blocks,
            index: HashMap::new(),
        })
    }

    pub fn attach(ctl: RegionView, data: RegionView) -> Result<BlobHeap, Fail> {
        if ctl.read_u32(OFF_MAGIC) != HEAP_MAGIC {
            return Err(Fail::new(libc::EINVAL, "bad heap magic"));
        }
        if ctl.read_u32(OFF_VERSION) != PROTOCOL_VERSION {
            return Err(Fail::new(libc::EINVAL, "unsupported heap version"));
        }
        let total_blocks: u32 = ctl.read_u32(OFF_TOTAL_BLOCKS);
        if total_blocks != (data.len() as u32) / BLOCK_SIZE {
            return Err(Fail::new(libc::EINVAL, "heap block count does not match the data region"));
        }

        Ok(Self {
            ctl,
            data,
            total_blocks,
            index: HashMap::new(),
        })
    }

    fn bit_test(&self, block: u32) -> bool {
        if block >= self.total_blocks {
            return true;
        }
        (self.ctl.read_u8(OFF_BITMAP + block as usize / 8) >> (block % 8)) & 1 != 0
    }

    fn bit_set(&self, block: u32) {
        let off: usize = OFF_BITMAP + block as usize / 8;
        self.ctl.write_u8(off, self.ctl.read_u8(off) | 1 << (block % 8));
    }

    fn bit_clear(&self, block: u32) {
        let off: usize = OFF_BITMAP + block as usize / 8;
        self.ctl.write_u8(off, self.ctl.read_u8(off) & !(1 << (block % 8)));
    }

    /// First-fit search for a contiguous run of free blocks.
    fn find_free_blocks(&self, count: u32) -> Option<u32> {
        let mut start: u32 = 0;
        let mut run: u32 = 0;
        for block in 0..self.total_blocks {
            if !self.bit_test(block) {
                if run == 0 {
                    start = block;
                }
                run += 1;
                if run >= count {
                    return Some(start);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn free_blocks_count(&self) -> u32 {
        self.ctl.read_u32(OFF_FREE_BLOCKS)
    }

    fn blocks_for(payload_size: u32) -> u32 {
        (payload_size + BLOB_HEADER_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    fn read_header(&self, offset: u32) -> BlobHeader {
        let base: usize = offset as usize;
        BlobHeader {
            blob_id: self.data.read_u16(base + BLOB_OFF_ID),
            blob_type: self.data.read_u8(base + BLOB_OFF_TYPE),
            flags: self.data.read_u8(base + BLOB_OFF_FLAGS),
            size: self.data.read_u32(base + BLOB_OFF_SIZE),
            offset: self.data.read_u32(base + BLOB_OFF_OFFSET),
            checksum: self.data.read_u32(base + BLOB_OFF_CHECKSUM),
        }
    }

    /// Allocates a blob with a `size`-byte payload. Ids are 1-based and wrap past zero.
    pub fn alloc(&mut self, size: u32, blob_type: BlobType) -> Result<u16, Fail> {
        let blocks: u32 = Self::blocks_for(size);
        let start: u32 = match self.find_free_blocks(blocks) {
            Some(start) => start,
            None => {
                warn!("alloc(): no space for {} blocks", blocks);
                return Err(Fail::out_of_memory("no contiguous run of heap blocks"));
            },
        };

        for i in 0..blocks {
            self.bit_set(start + i);
        }
        self.ctl.write_u32(OFF_FREE_BLOCKS, self.free_blocks_count() - blocks);

        let blob_id: u16 = self.ctl.read_u32(OFF_NEXT_BLOB_ID) as u16;
        let mut next: u16 = blob_id.wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.ctl.write_u32(OFF_NEXT_BLOB_ID, next as u32);

        let offset: u32 = start * BLOCK_SIZE;
        self.index.insert(blob_id, BlobEntry { offset, blocks });

        let base: usize = offset as usize;
        self.data.write_u32(base + BLOB_OFF_MAGIC, BLOB_MAGIC);
        self.data.write_u16(base + BLOB_OFF_ID, blob_id);
        self.data.write_u8(base + BLOB_OFF_TYPE, blob_type.raw());
        self.data.write_u8(base + BLOB_OFF_FLAGS, 0);
        self.data.write_u32(base + BLOB_OFF_SIZE, size);
        self.data.write_u32(base + BLOB_OFF_OFFSET, offset + BLOB_HEADER_SIZE);
        self.data.write_u32(base + BLOB_OFF_CHECKSUM, 0);
        self.data.fill_zero(base + 20, 12);

        Ok(blob_id)
    }

    /// Frees a blob by id, from either side. The header magic is scrubbed so stale headers do not
    /// resurface through lookup scans.
    pub fn free(&mut self, blob_id: u16) -> Result<(), Fail> {
        if blob_id == 0 {
            return Err(Fail::new(libc::EINVAL, "the zero blob id is invalid"));
        }
        let entry: BlobEntry = match self.lookup(blob_id) {
            Some(entry) => entry,
            None => return Err(Fail::new(libc::ENOENT, "no such blob")),
        };

        for i in 0..entry.blocks {
            self.bit_clear(entry.offset / BLOCK_SIZE + i);
        }
        self.ctl.write_u32(OFF_FREE_BLOCKS, self.free_blocks_count() + entry.blocks);
        self.data.write_u32(entry.offset as usize + BLOB_OFF_MAGIC, 0);
        self.index.remove(&blob_id);
        Ok(())
    }

    /// Finds a blob's allocation record: the local index first, then a header scan of the region
    /// for blobs the peer allocated. Scan hits repopulate the index.
    fn lookup(&mut self, blob_id: u16) -> Option<BlobEntry> {
        if let Some(entry) = self.index.get(&blob_id) {
            let base: usize = entry.offset as usize;
            // The peer may have freed it under us.
            if self.data.read_u32(base + BLOB_OFF_MAGIC) == BLOB_MAGIC && self.data.read_u16(base + BLOB_OFF_ID) == blob_id
            {
                return Some(*entry);
            }
            self.index.remove(&blob_id);
            return None;
        }

        // Slow path: walk headers block by block, skipping over known-sized blobs.
        let mut offset: u32 = 0;
        while offset + BLOB_HEADER_SIZE <= self.data.len() as u32 {
            if self.data.read_u32(offset as usize + BLOB_OFF_MAGIC) == BLOB_MAGIC {
                let header: BlobHeader = self.read_header(offset);
                let blocks: u32 = Self::blocks_for(header.size);
                if header.blob_id == blob_id {
                    let entry: BlobEntry = BlobEntry { offset, blocks };
                    self.index.insert(blob_id, entry);
                    return Some(entry);
                }
                offset += blocks * BLOCK_SIZE;
            } else {
                offset += BLOCK_SIZE;
            }
        }
        None
    }

    /// Returns the header of a blob, if it exists on either side.
    pub fn get(&mut self, blob_id: u16) -> Option<BlobHeader> {
        if blob_id == 0 {
            return None;
        }
        let entry: BlobEntry = self.lookup(blob_id)?;
        Some(self.read_header(entry.offset))
    }

    /// Returns a window over a blob's payload.
    pub fn blob_data(&mut self, blob_id: u16) -> Result<RegionView, Fail> {
        let header: BlobHeader = match self.get(blob_id) {
            Some(header) => header,
            None => return Err(Fail::new(libc::ENOENT, "no such blob")),
        };
        if header.offset as usize + header.size as usize > self.data.len() {
            return Err(Fail::new(libc::EINVAL, "blob payload out of bounds"));
        }
        self.data.subview(header.offset as usize, header.size as usize)
    }

    /// Allocates a tensor blob and fills in the embedded tensor header with row-major strides.
    pub fn alloc_tensor(&mut self, dtype: TensorDtype, shape: &[u32]) -> Result<u16, Fail> {
        let ndim: usize = shape.len();
        if ndim == 0 || ndim > MAX_TENSOR_NDIM {
            return Err(Fail::new(libc::EINVAL, "tensor rank must be between 1 and 4"));
        }

        let mut nelems: u32 = 1;
        for &dim in shape {
            nelems = match nelems.checked_mul(dim) {
                Some(n) => n,
                None => return Err(Fail::new(libc::EINVAL, "tensor shape overflows")),
            };
        }
        let data_size: u32 = match nelems.checked_mul(dtype.elem_size()) {
            Some(n) => n,
            None => return Err(Fail::new(libc::EINVAL, "tensor shape overflows")),
        };

        let blob_id: u16 = self.alloc(TENSOR_HEADER_SIZE + data_size, BlobType::Tensor)?;
        let view: RegionView = self.blob_data(blob_id)?;

        view.write_u8(0, dtype.raw());
        view.write_u8(1, ndim as u8);
        view.write_u16(2, 0);

        // Row-major strides, computed right to left.
        let mut strides: [u32; MAX_TENSOR_NDIM] = [0; MAX_TENSOR_NDIM];
        let mut stride: u32 = dtype.elem_size();
        for i in (0..ndim).rev() {
            strides[i] = stride;
            stride = stride.saturating_mul(shape[i]);
        }
        for i in 0..MAX_TENSOR_NDIM {
            let dim: u32 = if i < ndim { shape[i] } else { 0 };
            view.write_u32(4 + i * 4, dim);
            view.write_u32(20 + i * 4, strides[i]);
        }

        Ok(blob_id)
    }

    /// Validates a tensor blob and returns a window over its raw element data.
    pub fn tensor_data(&mut self, blob_id: u16) -> Result<RegionView, Fail> {
        let header: BlobHeader = match self.get(blob_id) {
            Some(header) => header,
            None => return Err(Fail::new(libc::ENOENT, "no such blob")),
        };
        if header.blob_type != BlobType::Tensor.raw() {
            return Err(Fail::new(libc::EINVAL, "blob does not carry a tensor"));
        }
        if header.offset as usize + header.size as usize > self.data.len() {
            return Err(Fail::new(libc::EINVAL, "blob payload out of bounds"));
        }
        if header.size < TENSOR_HEADER_SIZE {
            return Err(Fail::new(libc::EINVAL, "blob too small for a tensor header"));
        }

        let view: RegionView = self.data.subview(header.offset as usize, header.size as usize)?;
        let dtype: TensorDtype = match TensorDtype::from_raw(view.read_u8(0)) {
            Some(dtype) => dtype,
            None => return Err(Fail::new(libc::EINVAL, "unknown tensor element type")),
        };
        let ndim: usize = view.read_u8(1) as usize;
        if ndim == 0 || ndim > MAX_TENSOR_NDIM {
            return Err(Fail::new(libc::EINVAL, "tensor rank out of range"));
        }

        let mut nelems: u32 = 1;
        for i in 0..ndim {
            nelems = nelems.saturating_mul(view.read_u32(4 + i * 4));
        }
        let data_size: u32 = nelems.saturating_mul(dtype.elem_size());
        if TENSOR_HEADER_SIZE + data_size > header.size {
            return Err(Fail::new(libc::EINVAL, "tensor shape exceeds blob size"));
        }

        view.subview(TENSOR_HEADER_SIZE as usize, data_size as usize)
    }

    pub fn stats(&self) -> HeapStats {
        let free_blocks: u32 = self.free_blocks_count();
        HeapStats {
            total_blocks: self.total_blocks,
            free_blocks,
            total_bytes: self.total_blocks as u64 * BLOCK_SIZE as u64,
            free_bytes: free_blocks as u64 * BLOCK_SIZE as u64,
            used_bytes: (self.total_blocks - free_blocks) as u64 * BLOCK_SIZE as u64,
            blob_count: self.index.len() as u32,
        }
    }

    /// Dumps allocation state through the logging facade.
    pub fn dump(&self) {
        let stats: HeapStats = self.stats();
        debug!(
            "heap: {}/{} blocks free, {} bytes used, {} local blobs",
            stats.free_blocks, stats.total_blocks, stats.used_bytes, stats.blob_count
        );

        let mut allocated: u32 = 0;
        let bitmap_len: usize = ((self.total_blocks as usize) + 7) / 8;
        for i in 0..bitmap_len {
            for _bit in BitIter::from(self.ctl.read_u8(OFF_BITMAP + i)) {
                allocated += 1;
            }
        }
        debug!("heap: {} blocks marked in the shared bitmap", allocated);

        for (id, entry) in self.index.iter().take(8) {
            debug!("  blob [{}] offset={} blocks={}", id, entry.offset, entry.blocks);
        }
        if self.index.len() > 8 {
            debug!("  ... and {} more", self.index.len() - 8);
        }
    }
}

/// Aggregate heap statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub blob_count: u32,
}

impl SharedBlobHeap {
    pub fn create_on(segment: &SharedSegment) -> Result<Self, Fail> {
        Ok(Self(SharedObject::new(BlobHeap::create_on(segment)?)))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedBlobHeap {
    type Target = BlobHeap;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedBlobHeap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
