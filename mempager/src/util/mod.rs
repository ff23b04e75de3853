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

pub(crate) mod mmap_guard;

use libc::{sysconf, _SC_PAGE_SIZE};

/// Page size of the host, which is also the page size of the emulated memory.
pub fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGE_SIZE) as usize }
}

/// Rounds `addr` down to the start of its page.
#[inline]
pub(crate) const fn align_down(addr: usize, page_size: usize) -> usize {
    addr - addr % page_size
}
