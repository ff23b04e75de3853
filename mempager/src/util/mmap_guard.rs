/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::ptr::null_mut;
use std::{io, os::fd::AsRawFd};

use libc::{
    c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED_NOREPLACE, MAP_NORESERVE,
    MAP_PRIVATE, MAP_SHARED, PROT_READ, PROT_WRITE,
};

/// Owns an `mmap`ed region and unmaps it on drop.
pub(crate) struct MMapGuard {
    base: *mut u8,
    size: usize,
}

// the region is plain memory, access is synchronized by the owner
unsafe impl Send for MMapGuard {}
unsafe impl Sync for MMapGuard {}

impl MMapGuard {
    /// Maps `size` bytes of `file` shared and read-write.
    ///
    /// Writes through this mapping are visible to every other process that maps the same file.
    pub(crate) fn map_shared<F: AsRawFd>(file: &F, size: usize) -> io::Result<Self> {
        let base_ptr = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if base_ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            base: base_ptr as *mut u8,
            size,
        })
    }

    /// Reserves `[base, base + size)` without any access permissions.
    ///
    /// Fails if anything is already mapped inside of that range.
    pub(crate) fn reserve_fixed(base: usize, size: usize) -> io::Result<Self> {
        let base_ptr = unsafe {
            mmap(
                base as *mut c_void,
                size,
                libc::PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE | MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };

        if base_ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if base_ptr as usize != base {
            // old kernels ignore MAP_FIXED_NOREPLACE and treat `base` as a hint
            unsafe { munmap(base_ptr, size) };
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }

        Ok(Self {
            base: base_ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.base as usize
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base, self.size) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base, self.size) }
    }
}

impl Drop for MMapGuard {
    fn drop(&mut self) {
        let code = unsafe { munmap(self.base as *mut c_void, self.size) };

        if code != 0 {
            log::error!(
                "could not unmap region {:#x}+{:#x}: {}",
                self.base as usize,
                self.size,
                io::Error::last_os_error()
            );
        }
    }
}
