//! Read-only memory mapping of the database file.
//!
//! When `Options.mmap` is enabled, pager cache misses are served by copying
//! out of the mapping instead of issuing a read syscall. Writes always go
//! through the cache and land via `pwrite`; the mapping is remapped when the
//! file grows past its mapped length.

#![cfg(unix)]

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr;

use crate::error::{Result, TurError};

pub struct MmapRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

// The region is read-only and never handed out as &mut.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Map `len` bytes of `file` read-only. `len` must not exceed the file
    /// length, otherwise reads past EOF fault.
    pub fn map(file: &File, len: usize) -> Result<MmapRegion> {
        if len == 0 {
            return Ok(MmapRegion {
                ptr: ptr::null_mut(),
                len: 0,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TurError::Io(std::io::Error::last_os_error()));
        }
        Ok(MmapRegion { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the mapping.
    /// Returns false when the range is not covered (caller falls back to a
    /// file read).
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> bool {
        let end = offset as usize + buf.len();
        if self.ptr.is_null() || end > self.len {
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(
                (self.ptr as *const u8).add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        true
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
