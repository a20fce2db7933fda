// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    ffi,
    ptr,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A named shared memory region, for deploying the transport across processes. The in-process
/// tests use anonymous segments instead; this backing is only built on Linux.
pub struct SharedMemory {
    /// Was this region created or opened?
    was_created: bool,
    /// Name.
    name: ffi::CString,
    /// Underlying file descriptor.
    fd: libc::c_int,
    /// Size in bytes.
    size: libc::size_t,
    /// Base address.
    addr: *mut libc::c_void,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated functions.
impl SharedMemory {
    /// Creates a named shared memory region.
    pub fn create(name: &str, size: usize) -> Result<SharedMemory, Fail> {
        let name: ffi::CString = match ffi::CString::new(name.to_string()) {
            Ok(name) => name,
            Err(_) => return Err(Fail::new(libc::EINVAL, "could not parse name of shared memory region")),
        };
        let fd: libc::c_int = unsafe {
            let ret: libc::c_int = libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                libc::S_IRUSR | libc::S_IWUSR,
            );
            if ret == -1 {
                let errno: libc::c_int = *libc::__errno_location();
                let cause: String = format!(
                    "failed to create shared memory region (name={:?}, size={}, errno={})",
                    name, size, errno
                );
                error!("create(): {}", cause);
                return Err(Fail::new(errno, &cause));
            }
            ret
        };

        let mut shm: SharedMemory = SharedMemory {
            was_created: true,
            name,
            fd,
            size: 0,
            addr: ptr::null_mut(),
        };

        shm.truncate(size)?;
        shm.map(size)?;

        Ok(shm)
    }

    /// Opens an existing named shared memory region.
    pub fn open(name: &str, size: usize) -> Result<SharedMemory, Fail> {
        let name: ffi::CString = match ffi::CString::new(name.to_string()) {
            Ok(name) => name,
            Err(_) => return Err(Fail::new(libc::EINVAL, "could not parse name of shared memory region")),
        };
        let fd: libc::c_int = unsafe {
            let ret: libc::c_int = libc::shm_open(name.as_ptr(), libc::O_RDWR, libc::S_IRUSR | libc::S_IWUSR);
            if ret == -1 {
                let errno: libc::c_int = *libc::__errno_location();
                let cause: String = format!(
                    "failed to open shared memory region (name={:?}, size={}, errno={})",
                    name, size, errno
                );
                error!("open(): {}", cause);
                return Err(Fail::new(errno, &cause));
            }
            ret
        };

        let mut shm: SharedMemory = SharedMemory {
            was_created: false,
            name,
            fd,
            size: 0,
            addr: ptr::null_mut(),
        };

        shm.map(size)?;

        Ok(shm)
    }

    /// Returns a raw pointer to the base of the target shared memory region.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Returns the length of the target shared memory region.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Truncates the target shared memory region.
    fn truncate(&mut self, size: usize) -> Result<(), Fail> {
        unsafe {
            let ret: libc::c_int = libc::ftruncate(self.fd, size as libc::off_t);
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to truncate shared memory region"));
            }
        };

        self.size = size;

        Ok(())
    }

    /// Maps the target shared memory region into the address space of the calling process.
    fn map(&mut self, size: usize) -> Result<(), Fail> {
        let addr: *mut libc::c_void = unsafe {
            let ret: *mut libc::c_void = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            );
            if ret == libc::MAP_FAILED {
                return Err(Fail::new(libc::EAGAIN, "failed to map shared memory region"));
            }
            ret
        };

        self.addr = addr;
        self.size = size;

        Ok(())
    }

    /// Unmaps the target shared memory region from the address space of the calling process.
    fn unmap(&mut self) -> Result<(), Fail> {
        if self.size == 0 || self.addr.is_null() {
            return Ok(());
        }
        unsafe {
            let ret: libc::c_int = libc::munmap(self.addr, self.size);
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to unmap shared memory region"));
            }
        }

        self.addr = ptr::null_mut();

        Ok(())
    }

    /// Closes the target shared memory region.
    fn close(&mut self) -> Result<(), Fail> {
        unsafe {
            let ret: libc::c_int = libc::close(self.fd);
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to close shared memory region"));
            }
        }

        self.fd = -1;

        Ok(())
    }

    /// Unlinks the target shared memory region.
    fn unlink(&mut self) -> Result<(), Fail> {
        unsafe {
            let ret: libc::c_int = libc::shm_unlink(self.name.as_ptr());
            if ret == -1 {
                return Err(Fail::new(libc::EAGAIN, "failed to unlink shared memory region"));
            }
        }

        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop trait implementation.
impl Drop for SharedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("drop(): {:?}", e);
        }
        if let Err(e) = self.close() {
            warn!("drop(): {:?}", e);
        }
        // The creating side owns the name.
        if self.was_created {
            if let Err(e) = self.unlink() {
                warn!("drop(): {:?}", e);
            }
        }
    }
}
