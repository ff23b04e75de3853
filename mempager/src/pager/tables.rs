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

use crate::Pid;

/// Identifies a page by its owner and its ordinal inside the owner's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub pid: Pid,
    pub page: usize,
}

/// One slot of physical memory.
#[derive(Debug, Default, Clone)]
pub struct Frame {
    pub(crate) owner: Option<PageRef>,

    /// reference bit for the eviction module
    pub(crate) accessed: bool,
}

impl Frame {
    #[inline]
    pub fn owner(&self) -> Option<PageRef> {
        self.owner
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    #[inline]
    pub fn accessed(&self) -> bool {
        self.accessed
    }

    #[inline]
    pub fn set_accessed(&mut self, accessed: bool) {
        self.accessed = accessed;
    }

    #[inline]
    pub(crate) fn release(&mut self) {
        self.owner = None;
        self.accessed = false;
    }
}

/// One slot of the swap disk.
#[derive(Debug, Default, Clone)]
pub struct Block {
    pub(crate) owner: Option<PageRef>,

    /// `true` once a page was written back to this block
    pub(crate) used: bool,
}

impl Block {
    #[inline]
    pub fn owner(&self) -> Option<PageRef> {
        self.owner
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.used
    }
}

/// One page of a process's virtual address space.
///
/// The block is assigned once on creation and stays the page's swap location until the process is destroyed.
#[derive(Debug, Clone)]
pub struct Page {
    pub(crate) vaddr: usize,
    pub(crate) frame: Option<usize>,
    pub(crate) block: usize,
    pub(crate) dirty: bool,
}

impl Page {
    pub(crate) fn new(vaddr: usize, block: usize) -> Self {
        Self {
            vaddr,
            frame: None,
            block,
            dirty: false,
        }
    }

    #[inline]
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    /// A page is valid iff it currently occupies a frame.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.frame.is_some()
    }

    #[inline]
    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    #[inline]
    pub fn block(&self) -> usize {
        self.block
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Page table of a single process, pages are stored in creation order.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    pid: Pid,
    pub(crate) pages: Vec<Page>,
}

impl AddressSpace {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid, pages: vec![] }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
