// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::byteorder::{
    ByteOrder,
    LittleEndian,
};
use ::core::{
    alloc::Layout,
    ptr,
    slice,
    sync::atomic::AtomicU32,
};
use ::std::alloc;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Alignment of managed regions. One cache line, so control blocks placed at the base are aligned.
const REGION_ALIGN: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fixed-size byte region. Either owns its memory (managed) or borrows memory supplied by the
/// caller, such as a mapped shared memory segment (unmanaged).
pub struct RawRegion {
    /// Base pointer.
    ptr: ptr::NonNull<u8>,
    /// Length in bytes.
    len: usize,
    /// Is the underlying memory managed by this module?
    is_managed: bool,
}

/// A window into a [RawRegion]. Scalars are read and written little-endian at byte offsets, so a
/// view over shared memory is byte-compatible with the peer regardless of host struct layout.
///
/// Views carry raw pointers and no lifetime: the region must outlive every view derived from it.
#[derive(Clone, Copy)]
pub struct RegionView {
    /// Base pointer of the window.
    ptr: ptr::NonNull<u8>,
    /// Length of the window in bytes.
    len: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RawRegion {
    /// Allocates a zeroed managed region.
    pub fn anonymous(len: usize) -> Result<RawRegion, Fail> {
        if len == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot create a raw region with zero length"));
        }

        let layout: Layout = match Layout::from_size_align(len, REGION_ALIGN) {
            Ok(layout) => layout,
            Err(_) => return Err(Fail::new(libc::EINVAL, "failed to create memory layout for raw region")),
        };
        let ptr: ptr::NonNull<u8> = {
            let ptr: *mut u8 = unsafe { alloc::alloc_zeroed(layout) };
            match ptr::NonNull::new(ptr) {
                Some(p) => p,
                None => alloc::handle_alloc_error(layout),
            }
        };

        Ok(RawRegion {
            ptr,
            len,
            is_managed: true,
        })
    }

    /// Constructs an unmanaged region from a pointer and a length.
    pub fn from_raw_parts(ptr: *mut u8, len: usize) -> Result<RawRegion, Fail> {
        if len == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot create a raw region with zero length"));
        }
        let ptr: ptr::NonNull<u8> = match ptr::NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return Err(Fail::new(libc::EINVAL, "cannot create a raw region from a null pointer")),
        };

        Ok(RawRegion {
            ptr,
            len,
            is_managed: false,
        })
    }

    /// Returns the length of the target region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Opens a window into the target region.
    pub fn view(&self, offset: usize, len: usize) -> Result<RegionView, Fail> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Fail::new(libc::EINVAL, "view exceeds region bounds"));
        }
        Ok(RegionView {
            ptr: unsafe { ptr::NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
        })
    }
}

impl RegionView {
    /// Returns the length of the target view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Opens a window into the target view.
    pub fn subview(&self, offset: usize, len: usize) -> Result<RegionView, Fail> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Fail::new(libc::EINVAL, "subview exceeds view bounds"));
        }
        Ok(RegionView {
            ptr: unsafe { ptr::NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
        })
    }

    fn range(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "read past end of view");
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    fn range_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len, "write past end of view");
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.range(offset, 1)[0]
    }

    pub fn write_u8(&self, offset: usize, value: u8) {
        self.range_mut(offset, 1)[0] = value;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(self.range(offset, 2))
    }

    pub fn write_u16(&self, offset: usize, value: u16) {
        LittleEndian::write_u16(self.range_mut(offset, 2), value);
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(self.range(offset, 4))
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        LittleEndian::write_u32(self.range_mut(offset, 4), value);
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        LittleEndian::read_u64(self.range(offset, 8))
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        LittleEndian::write_u64(self.range_mut(offset, 8), value);
    }

    /// Returns an atomic handle to a 4-byte word, for indices published across domains.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.len, "atomic past end of view");
        let addr: *mut u8 = unsafe { self.ptr.as_ptr().add(offset) };
        assert!(addr as usize % 4 == 0, "atomic word is unaligned");
        unsafe { &*(addr as *const AtomicU32) }
    }

    pub fn copy_from_slice(&self, offset: usize, bytes: &[u8]) {
        self.range_mut(offset, bytes.len()).copy_from_slice(bytes);
    }

    pub fn copy_to_slice(&self, offset: usize, bytes: &mut [u8]) {
        bytes.copy_from_slice(self.range(offset, bytes.len()));
    }

    pub fn fill_zero(&self, offset: usize, len: usize) {
        self.range_mut(offset, len).fill(0);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Send trait implementation. The single-producer/single-consumer discipline of the structures
/// layered on top is what makes cross-thread access sound.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}
unsafe impl Send for RegionView {}
unsafe impl Sync for RegionView {}

/// Drop trait implementation.
impl Drop for RawRegion {
    fn drop(&mut self) {
        if self.is_managed {
            let layout: Layout = Layout::from_size_align(self.len, REGION_ALIGN).unwrap();
            unsafe {
                alloc::dealloc(self.ptr.as_ptr(), layout);
            }
            self.is_managed = false;
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        RawRegion,
        RegionView,
    };
    use ::anyhow::Result;

    const REGION_LENGTH: usize = 256;

    /// Creates a managed region and sanity checks its length.
    fn do_anonymous() -> Result<RawRegion> {
        match RawRegion::anonymous(REGION_LENGTH) {
            Ok(r) => {
                crate::ensure_eq!(r.len(), REGION_LENGTH);
                Ok(r)
            },
            Err(_) => anyhow::bail!("creating managed raw regions should be possible"),
        }
    }

    /// Tests if we fail to create a region with zero length.
    #[test]
    fn bad_anonymous() -> Result<()> {
        match RawRegion::anonymous(0) {
            Ok(_) => anyhow::bail!("creating a raw region with zero length should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if scalars written through a view read back, and that a fresh region is zeroed.
    #[test]
    fn scalar_roundtrip() -> Result<()> {
        let region: RawRegion = do_anonymous()?;
        let view: RegionView = match region.view(0, REGION_LENGTH) {
            Ok(view) => view,
            Err(_) => anyhow::bail!("opening a view over a whole region should be possible"),
        };

        crate::ensure_eq!(view.read_u64(0), 0);

        view.write_u32(0, 0xDEAD_BEEF);
        view.write_u16(4, 0xCAFE);
        view.write_u64(8, 0x0123_4567_89AB_CDEF);

        crate::ensure_eq!(view.read_u32(0), 0xDEAD_BEEF);
        crate::ensure_eq!(view.read_u16(4), 0xCAFE);
        crate::ensure_eq!(view.read_u64(8), 0x0123_4567_89AB_CDEF);

        // Little-endian byte order on the wire.
        crate::ensure_eq!(view.read_u8(0), 0xEF);
        crate::ensure_eq!(view.read_u8(3), 0xDE);
        Ok(())
    }

    /// Tests if out-of-bounds views are refused.
    #[test]
    fn bad_view() -> Result<()> {
        let region: RawRegion = do_anonymous()?;
        match region.view(REGION_LENGTH - 4, 8) {
            Ok(_) => anyhow::bail!("opening an out-of-bounds view should fail"),
            Err(_) => Ok(()),
        }
    }

    /// Tests if two views over the same bytes alias.
    #[test]
    fn view_alias() -> Result<()> {
        let region: RawRegion = do_anonymous()?;
        let a: RegionView = region.view(0, 64).unwrap();
        let b: RegionView = region.view(0, 128).unwrap();

        a.write_u32(16, 42);
        crate::ensure_eq!(b.read_u32(16), 42);
        Ok(())
    }
}
