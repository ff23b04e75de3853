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

mod file;
mod memory;

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;

use log::debug;

/// Byte written into a frame when a page is loaded for the first time.
pub const ZERO_FILL_BYTE: u8 = b'0';

/// Emulated physical memory plus the swap disk behind it.
///
/// Both are arrays of equally sized pages: memory is split into *frames*, the disk into *blocks*.
/// Implementors only provide access to the raw bytes, all page-granular operations are built on top.
pub trait BackingStoreModule {
    /// Size in bytes of a single frame or block
    fn page_size(&self) -> usize;

    /// Whole physical memory
    fn memory(&self) -> &[u8];

    /// Whole disk
    fn disk(&self) -> &[u8];

    /// Mutable access to `(memory, disk)` at the same time
    fn parts_mut(&mut self) -> (&mut [u8], &mut [u8]);

    fn frame_count(&self) -> usize {
        self.memory().len() / self.page_size()
    }

    fn block_count(&self) -> usize {
        self.disk().len() / self.page_size()
    }

    fn frame(&self, frame: usize) -> &[u8] {
        let size = self.page_size();
        &self.memory()[frame * size..(frame + 1) * size]
    }

    fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        let size = self.page_size();
        let (memory, _) = self.parts_mut();
        &mut memory[frame * size..(frame + 1) * size]
    }

    fn block(&self, block: usize) -> &[u8] {
        let size = self.page_size();
        &self.disk()[block * size..(block + 1) * size]
    }

    /// Fills `frame` with [`ZERO_FILL_BYTE`].
    fn zero_fill(&mut self, frame: usize) {
        debug!("zero_fill frame {}", frame);
        self.frame_mut(frame).fill(ZERO_FILL_BYTE);
    }

    /// Copies disk block `block` into physical frame `frame`.
    fn disk_read(&mut self, block: usize, frame: usize) {
        debug!("disk_read from block {} to frame {}", block, frame);
        let size = self.page_size();
        let (memory, disk) = self.parts_mut();
        memory[frame * size..(frame + 1) * size]
            .copy_from_slice(&disk[block * size..(block + 1) * size]);
    }

    /// Copies physical frame `frame` into disk block `block`.
    fn disk_write(&mut self, frame: usize, block: usize) {
        debug!("disk_write from frame {} to block {}", frame, block);
        let size = self.page_size();
        let (memory, disk) = self.parts_mut();
        disk[block * size..(block + 1) * size]
            .copy_from_slice(&memory[frame * size..(frame + 1) * size]);
    }
}
