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

mod tables;

#[cfg(test)]
mod test;

pub use tables::{AddressSpace, Block, Frame, Page, PageRef};

use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::{
    config::PagerConfig,
    modules::{
        backing_store::BackingStoreModule,
        eviction::{ClockEvictionModule, EvictionModule},
        mapping::{MappingModule, Protection},
    },
    util::align_down,
    PagerError, Pid,
};

/// The policy engine.
///
/// Owns the frame table, the block table and the page table of every registered process,
/// as well as the backing store that holds the actual page contents.
/// Mapping changes are pushed to the clients through a [`MappingModule`] that is passed
/// to every operation which may need one.
///
/// A `Pager` is not synchronized itself, callers serialize all operations (e.g. with a single lock).
pub struct Pager<S: BackingStoreModule, E: EvictionModule = ClockEvictionModule> {
    config: PagerConfig,
    frames: Vec<Frame>,
    blocks: Vec<Block>,
    spaces: BTreeMap<Pid, AddressSpace>,
    eviction: E,
    store: S,
}

impl<S: BackingStoreModule, E: EvictionModule> Pager<S, E> {
    pub fn new(config: PagerConfig, store: S) -> Self {
        debug_assert_eq!(store.page_size(), config.page_size);
        debug_assert!(store.frame_count() >= config.frame_count);
        debug_assert!(store.block_count() >= config.block_count);

        info!(
            "pager_init {} frames, {} blocks, page size {}",
            config.frame_count, config.block_count, config.page_size
        );

        Self {
            frames: vec![Frame::default(); config.frame_count],
            blocks: vec![Block::default(); config.block_count],
            spaces: BTreeMap::new(),
            eviction: E::new(config.frame_count),
            config,
            store,
        }
    }

    /// Creates an empty address space for `pid`.
    pub fn register(&mut self, pid: Pid) -> Result<(), PagerError> {
        if self.spaces.contains_key(&pid) {
            return Err(PagerError::DuplicateProcess(pid));
        }

        info!("pager_create pid {}", pid);
        self.spaces.insert(pid, AddressSpace::new(pid));
        Ok(())
    }

    /// Adds a page to the address space of `pid` and returns its virtual address.
    ///
    /// The page only gets a swap block here, a frame is assigned on first access.
    /// Fails with [`PagerError::NoSpace`] if all blocks are in use.
    pub fn extend(&mut self, pid: Pid) -> Result<usize, PagerError> {
        let space = self
            .spaces
            .get_mut(&pid)
            .ok_or(PagerError::UnknownProcess(pid))?;

        let ordinal = space.pages.len();
        if ordinal >= self.config.region_pages() {
            // the client could not map this page anyway
            return Err(PagerError::NoSpace(pid));
        }

        let block = self
            .blocks
            .iter()
            .position(Block::is_free)
            .ok_or(PagerError::NoSpace(pid))?;

        let vaddr = self.config.base_addr + ordinal * self.config.page_size;
        self.blocks[block] = Block {
            owner: Some(PageRef { pid, page: ordinal }),
            used: false,
        };
        space.pages.push(Page::new(vaddr, block));

        debug!("pager_extend pid {} vaddr {:#x} block {}", pid, vaddr, block);
        Ok(vaddr)
    }

    /// Services a page fault of `pid` at `addr`.
    ///
    /// If the page is resident already this was a write to a read only page: the page becomes dirty and writable.
    /// Otherwise the page is loaded into a free frame (evicting another page if necessary) and mapped read only.
    pub fn fault<M: MappingModule>(
        &mut self,
        pid: Pid,
        addr: usize,
        mapping: &M,
    ) -> Result<(), PagerError> {
        let ordinal = self.page_index(pid, addr)?;
        let space = self
            .spaces
            .get_mut(&pid)
            .ok_or(PagerError::UnknownProcess(pid))?;
        let page = &mut space.pages[ordinal];

        debug!("pager_fault pid {} vaddr {:#x}", pid, addr);

        if let Some(frame) = page.frame {
            self.frames[frame].accessed = true;
            page.dirty = true;
            mapping.chprot(pid, page.vaddr, Protection::ReadWrite)?;
            return Ok(());
        }

        self.page_in(pid, ordinal, mapping)?;
        Ok(())
    }

    /// Reads `len` bytes starting at `addr` from the address space of `pid`.
    ///
    /// This behaves like a read access of the process: pages of the region that are not resident
    /// are loaded (and mapped read only) first.
    /// Fails with [`PagerError::InvalidRegion`] if any byte is outside of the pages allocated to `pid`.
    pub fn read_region<M: MappingModule>(
        &mut self,
        pid: Pid,
        addr: usize,
        len: usize,
        mapping: &M,
    ) -> Result<Vec<u8>, PagerError> {
        let space = self
            .spaces
            .get(&pid)
            .ok_or(PagerError::UnknownProcess(pid))?;

        if len == 0 {
            return Ok(vec![]);
        }

        let invalid = PagerError::InvalidRegion { pid, addr, len };
        let base = self.config.base_addr;
        let page_size = self.config.page_size;
        let allocated_end = base + space.len() * page_size;
        let end = match addr.checked_add(len) {
            Some(end) if addr >= base && end <= allocated_end => end,
            _ => return Err(invalid),
        };

        let mut data = Vec::with_capacity(len);
        let mut curr = addr;
        while curr < end {
            let ordinal = (curr - base) / page_size;
            let offset = (curr - base) % page_size;
            let chunk = (page_size - offset).min(end - curr);

            let resident = self.spaces[&pid].pages[ordinal].frame;
            let frame = match resident {
                Some(frame) => frame,
                None => self.page_in(pid, ordinal, mapping)?,
            };
            self.frames[frame].accessed = true;

            data.extend_from_slice(&self.store.frame(frame)[offset..offset + chunk]);
            curr += chunk;
        }

        Ok(data)
    }

    /// Releases all frames and blocks of `pid` and forgets its address space.
    ///
    /// The process is gone already, so no mapping changes are sent.
    pub fn destroy(&mut self, pid: Pid) -> Result<(), PagerError> {
        let space = self
            .spaces
            .remove(&pid)
            .ok_or(PagerError::UnknownProcess(pid))?;

        for page in space.pages {
            self.blocks[page.block] = Block::default();
            if let Some(frame) = page.frame {
                self.frames[frame].release();
            }
        }

        info!("pager_destroy pid {}", pid);
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &PagerConfig {
        &self.config
    }

    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn address_space(&self, pid: Pid) -> Option<&AddressSpace> {
        self.spaces.get(&pid)
    }

    pub fn address_spaces(&self) -> impl Iterator<Item = &AddressSpace> {
        self.spaces.values()
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct access to the emulated memory, e.g. to emulate a client writing through its mapping.
    #[inline]
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[inline]
    pub fn eviction(&self) -> &E {
        &self.eviction
    }

    /// Ordinal of the page of `pid` that contains `addr`.
    fn page_index(&self, pid: Pid, addr: usize) -> Result<usize, PagerError> {
        let space = self
            .spaces
            .get(&pid)
            .ok_or(PagerError::UnknownProcess(pid))?;

        let vaddr = align_down(addr, self.config.page_size);
        if vaddr < self.config.base_addr {
            return Err(PagerError::UnmanagedAddress { pid, addr });
        }

        let ordinal = (vaddr - self.config.base_addr) / self.config.page_size;
        if ordinal >= space.len() {
            return Err(PagerError::UnmanagedAddress { pid, addr });
        }

        Ok(ordinal)
    }

    /// Loads page `ordinal` of `pid` into a frame and maps it read only.
    fn page_in<M: MappingModule>(
        &mut self,
        pid: Pid,
        ordinal: usize,
        mapping: &M,
    ) -> Result<usize, PagerError> {
        let frame = match self.frames.iter().position(Frame::is_free) {
            Some(frame) => frame,
            None => self.evict(mapping)?,
        };

        let space = self
            .spaces
            .get_mut(&pid)
            .ok_or(PagerError::UnknownProcess(pid))?;
        let page = &mut space.pages[ordinal];

        if self.blocks[page.block].used {
            // page was swapped out before
            self.store.disk_read(page.block, frame);
        } else {
            self.store.zero_fill(frame);
        }

        self.frames[frame] = Frame {
            owner: Some(PageRef { pid, page: ordinal }),
            accessed: true,
        };
        page.frame = Some(frame);
        page.dirty = false;

        mapping.resident(pid, page.vaddr, frame, Protection::Read)?;
        Ok(frame)
    }

    /// Chooses a victim frame, takes it away from its owner and returns it.
    fn evict<M: MappingModule>(&mut self, mapping: &M) -> Result<usize, PagerError> {
        let frame = self
            .eviction
            .select_victim(&mut self.frames)
            .ok_or(PagerError::NoVictim)?;
        let owner = self.frames[frame].owner.ok_or(PagerError::NoVictim)?;

        let space = self
            .spaces
            .get_mut(&owner.pid)
            .ok_or(PagerError::UnknownProcess(owner.pid))?;
        let page = &mut space.pages[owner.page];
        let dirty = page.dirty;
        page.frame = None;
        page.dirty = false;
        let (vaddr, block) = (page.vaddr, page.block);
        self.frames[frame].release();

        debug!(
            "evict frame {} (pid {} vaddr {:#x}, dirty: {})",
            frame, owner.pid, vaddr, dirty
        );

        // revoke access first, so no write can happen after the write back
        if let Err(err) = mapping.nonresident(owner.pid, vaddr) {
            // the owner is going away, its connection will destroy it
            warn!("could not unmap victim page: {}", err);
        }

        if dirty {
            self.blocks[block].used = true;
            self.store.disk_write(frame, block);
        }

        Ok(frame)
    }
}
